//! Interpretation of raw field values into human-readable sidecar strings.
//!
//! Interpretation never replaces a raw value; the interpreted form rides
//! along in the event as an optional second string per field.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::event::{EventField, EventRecord, FieldKind};
use crate::strings::{self, Unescaped};

use super::execve;

/// Value audit uses for "no uid/gid/session".
const UNSET_ID: u64 = u32::MAX as u64;

/// Resolves numeric user and group ids to names.
///
/// Passed in as a capability so tests and callers control where names come
/// from; the daemon wires in [`SystemUserDb`].
pub trait UserDb: Send + Sync {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// NSS-backed resolver with a small positive/negative cache; audit events
/// repeat the same handful of ids constantly.
pub struct SystemUserDb {
    ttl: Duration,
    users: Mutex<HashMap<u32, (Option<String>, Instant)>>,
    groups: Mutex<HashMap<u32, (Option<String>, Instant)>>,
}

impl Default for SystemUserDb {
    fn default() -> Self {
        SystemUserDb::new(Duration::from_secs(60))
    }
}

impl SystemUserDb {
    pub fn new(ttl: Duration) -> SystemUserDb {
        SystemUserDb {
            ttl,
            users: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn cached<F>(
        cache: &Mutex<HashMap<u32, (Option<String>, Instant)>>,
        ttl: Duration,
        id: u32,
        lookup: F,
    ) -> Option<String>
    where
        F: FnOnce() -> Option<String>,
    {
        let mut cache = cache.lock().expect("user db cache lock");
        if let Some((name, at)) = cache.get(&id) {
            if at.elapsed() < ttl {
                return name.clone();
            }
        }
        let name = lookup();
        cache.insert(id, (name.clone(), Instant::now()));
        name
    }
}

impl UserDb for SystemUserDb {
    fn user_name(&self, uid: u32) -> Option<String> {
        Self::cached(&self.users, self.ttl, uid, || {
            nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|u| u.name)
        })
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        Self::cached(&self.groups, self.ttl, gid, || {
            nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
                .ok()
                .flatten()
                .map(|g| g.name)
        })
    }
}

/// Audit's view of the syscall ABI, decoded from the `arch` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Machine {
    X86,
    X86_64,
    Arm,
    Arm64,
}

const AUDIT_ARCH_64BIT: u32 = 0x8000_0000;
const AUDIT_ARCH_LE: u32 = 0x4000_0000;
const EM_386: u32 = 3;
const EM_ARM: u32 = 40;
const EM_X86_64: u32 = 62;
const EM_AARCH64: u32 = 183;

pub fn machine_from_arch(arch: u32) -> Option<Machine> {
    match arch {
        a if a == EM_386 | AUDIT_ARCH_LE => Some(Machine::X86),
        a if a == EM_X86_64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE => Some(Machine::X86_64),
        a if a == EM_ARM | AUDIT_ARCH_LE => Some(Machine::Arm),
        a if a == EM_AARCH64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE => Some(Machine::Arm64),
        _ => None,
    }
}

pub fn machine_name(machine: Machine) -> &'static str {
    match machine {
        Machine::X86 => "i386",
        Machine::X86_64 => "x86_64",
        Machine::Arm => "arm",
        Machine::Arm64 => "aarch64",
    }
}

/// Syscall numbers for the machines audit reports. The table covers the
/// syscalls that dominate audit traffic; anything else renders as
/// `unknown-syscall(N)`.
pub fn syscall_name(machine: Machine, nr: i64) -> Option<&'static str> {
    match machine {
        Machine::X86_64 => x86_64_syscall(nr),
        Machine::X86 => x86_syscall(nr),
        Machine::Arm64 => arm64_syscall(nr),
        Machine::Arm => arm_syscall(nr),
    }
}

fn x86_64_syscall(nr: i64) -> Option<&'static str> {
    Some(match nr {
        0 => "read",
        1 => "write",
        2 => "open",
        3 => "close",
        4 => "stat",
        5 => "fstat",
        6 => "lstat",
        9 => "mmap",
        10 => "mprotect",
        11 => "munmap",
        12 => "brk",
        16 => "ioctl",
        21 => "access",
        22 => "pipe",
        32 => "dup",
        33 => "dup2",
        41 => "socket",
        42 => "connect",
        43 => "accept",
        44 => "sendto",
        45 => "recvfrom",
        46 => "sendmsg",
        47 => "recvmsg",
        49 => "bind",
        50 => "listen",
        54 => "setsockopt",
        56 => "clone",
        57 => "fork",
        58 => "vfork",
        59 => "execve",
        60 => "exit",
        62 => "kill",
        76 => "truncate",
        77 => "ftruncate",
        80 => "chdir",
        82 => "rename",
        83 => "mkdir",
        84 => "rmdir",
        85 => "creat",
        86 => "link",
        87 => "unlink",
        88 => "symlink",
        90 => "chmod",
        91 => "fchmod",
        92 => "chown",
        93 => "fchown",
        94 => "lchown",
        101 => "ptrace",
        105 => "setuid",
        106 => "setgid",
        113 => "setreuid",
        114 => "setregid",
        117 => "setresuid",
        119 => "setresgid",
        133 => "mknod",
        155 => "pivot_root",
        157 => "prctl",
        159 => "adjtimex",
        161 => "chroot",
        163 => "acct",
        165 => "mount",
        166 => "umount2",
        169 => "reboot",
        175 => "init_module",
        176 => "delete_module",
        188 => "setxattr",
        189 => "lsetxattr",
        190 => "fsetxattr",
        197 => "removexattr",
        198 => "lremovexattr",
        199 => "fremovexattr",
        231 => "exit_group",
        257 => "openat",
        258 => "mkdirat",
        259 => "mknodat",
        260 => "fchownat",
        263 => "unlinkat",
        264 => "renameat",
        265 => "linkat",
        266 => "symlinkat",
        268 => "fchmodat",
        288 => "accept4",
        302 => "prlimit64",
        313 => "finit_module",
        316 => "renameat2",
        322 => "execveat",
        435 => "clone3",
        _ => return None,
    })
}

fn x86_syscall(nr: i64) -> Option<&'static str> {
    Some(match nr {
        1 => "exit",
        2 => "fork",
        3 => "read",
        4 => "write",
        5 => "open",
        6 => "close",
        9 => "link",
        10 => "unlink",
        11 => "execve",
        12 => "chdir",
        14 => "mknod",
        15 => "chmod",
        21 => "mount",
        23 => "setuid",
        38 => "rename",
        39 => "mkdir",
        40 => "rmdir",
        46 => "setgid",
        61 => "chroot",
        63 => "dup2",
        83 => "symlink",
        90 => "mmap",
        91 => "munmap",
        102 => "socketcall",
        106 => "stat",
        120 => "clone",
        128 => "init_module",
        129 => "delete_module",
        182 => "chown",
        190 => "vfork",
        192 => "mmap2",
        212 => "chown32",
        213 => "setuid32",
        214 => "setgid32",
        295 => "openat",
        301 => "unlinkat",
        358 => "execveat",
        _ => return None,
    })
}

fn arm64_syscall(nr: i64) -> Option<&'static str> {
    Some(match nr {
        35 => "unlinkat",
        34 => "mkdirat",
        48 => "faccessat",
        49 => "chdir",
        51 => "chroot",
        53 => "fchmodat",
        54 => "fchownat",
        56 => "openat",
        57 => "close",
        63 => "read",
        64 => "write",
        93 => "exit",
        94 => "exit_group",
        129 => "kill",
        146 => "setreuid",
        147 => "setregid",
        157 => "setsid",
        198 => "socket",
        200 => "bind",
        201 => "listen",
        203 => "connect",
        220 => "clone",
        221 => "execve",
        222 => "mmap",
        226 => "mprotect",
        281 => "execveat",
        435 => "clone3",
        _ => return None,
    })
}

fn arm_syscall(nr: i64) -> Option<&'static str> {
    Some(match nr {
        1 => "exit",
        2 => "fork",
        3 => "read",
        4 => "write",
        5 => "open",
        6 => "close",
        11 => "execve",
        12 => "chdir",
        15 => "chmod",
        23 => "setuid",
        39 => "mkdir",
        40 => "rmdir",
        63 => "dup2",
        120 => "clone",
        190 => "vfork",
        248 => "exit_group",
        281 => "socket",
        283 => "connect",
        322 => "openat",
        328 => "unlinkat",
        387 => "execveat",
        _ => return None,
    })
}

fn errno_name(errno: i64) -> Option<&'static str> {
    Some(match errno {
        1 => "EPERM",
        2 => "ENOENT",
        3 => "ESRCH",
        4 => "EINTR",
        5 => "EIO",
        6 => "ENXIO",
        7 => "E2BIG",
        8 => "ENOEXEC",
        9 => "EBADF",
        10 => "ECHILD",
        11 => "EAGAIN",
        12 => "ENOMEM",
        13 => "EACCES",
        14 => "EFAULT",
        16 => "EBUSY",
        17 => "EEXIST",
        18 => "EXDEV",
        19 => "ENODEV",
        20 => "ENOTDIR",
        21 => "EISDIR",
        22 => "EINVAL",
        23 => "ENFILE",
        24 => "EMFILE",
        25 => "ENOTTY",
        26 => "ETXTBSY",
        27 => "EFBIG",
        28 => "ENOSPC",
        29 => "ESPIPE",
        30 => "EROFS",
        31 => "EMLINK",
        32 => "EPIPE",
        36 => "ENAMETOOLONG",
        38 => "ENOSYS",
        39 => "ENOTEMPTY",
        40 => "ELOOP",
        95 => "EOPNOTSUPP",
        110 => "ETIMEDOUT",
        111 => "ECONNREFUSED",
        _ => return None,
    })
}

fn capability_name(cap: u32) -> Option<&'static str> {
    Some(match cap {
        0 => "chown",
        1 => "dac_override",
        2 => "dac_read_search",
        3 => "fowner",
        4 => "fsetid",
        5 => "kill",
        6 => "setgid",
        7 => "setuid",
        8 => "setpcap",
        9 => "linux_immutable",
        10 => "net_bind_service",
        11 => "net_broadcast",
        12 => "net_admin",
        13 => "net_raw",
        14 => "ipc_lock",
        15 => "ipc_owner",
        16 => "sys_module",
        17 => "sys_rawio",
        18 => "sys_chroot",
        19 => "sys_ptrace",
        20 => "sys_pacct",
        21 => "sys_admin",
        22 => "sys_boot",
        23 => "sys_nice",
        24 => "sys_resource",
        25 => "sys_time",
        26 => "sys_tty_config",
        27 => "mknod",
        28 => "lease",
        29 => "audit_write",
        30 => "audit_control",
        31 => "setfcap",
        32 => "mac_override",
        33 => "mac_admin",
        34 => "syslog",
        35 => "wake_alarm",
        36 => "block_suspend",
        37 => "audit_read",
        38 => "perfmon",
        39 => "bpf",
        40 => "checkpoint_restore",
        _ => return None,
    })
}

fn signal_name(sig: u32) -> Option<&'static str> {
    Some(match sig {
        0 => "SIG0",
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        17 => "SIGCHLD",
        18 => "SIGCONT",
        19 => "SIGSTOP",
        _ => return None,
    })
}

fn parse_u64(raw: &[u8], radix: u32) -> Option<u64> {
    let s = std::str::from_utf8(raw).ok()?;
    u64::from_str_radix(s.trim(), radix).ok()
}

fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

pub fn uid_interp(user_db: &dyn UserDb, raw: &[u8]) -> String {
    match parse_u64(raw, 10) {
        Some(UNSET_ID) => "unset".into(),
        Some(uid) => user_db
            .user_name(uid as u32)
            .unwrap_or_else(|| format!("unknown-uid({uid})")),
        None => format!("unknown-uid({})", String::from_utf8_lossy(raw)),
    }
}

pub fn gid_interp(user_db: &dyn UserDb, raw: &[u8]) -> String {
    match parse_u64(raw, 10) {
        Some(UNSET_ID) => "unset".into(),
        Some(gid) => user_db
            .group_name(gid as u32)
            .unwrap_or_else(|| format!("unknown-gid({gid})")),
        None => format!("unknown-gid({})", String::from_utf8_lossy(raw)),
    }
}

fn arch_interp(raw: &[u8]) -> String {
    match parse_u64(raw, 16) {
        Some(arch) => match machine_from_arch(arch as u32) {
            Some(machine) => machine_name(machine).into(),
            None => format!("unknown-arch(0x{arch:x})"),
        },
        None => format!("unknown-arch({})", String::from_utf8_lossy(raw)),
    }
}

fn syscall_interp(record: &EventRecord<'_>, raw: &[u8]) -> String {
    let unknown = || format!("unknown-syscall({})", String::from_utf8_lossy(raw));
    let Some(arch_field) = record.field_by_name("arch") else {
        return unknown();
    };
    let Some(machine) = parse_u64(arch_field.raw(), 16).and_then(|a| machine_from_arch(a as u32))
    else {
        return unknown();
    };
    match parse_i64(raw).and_then(|nr| syscall_name(machine, nr)) {
        Some(name) => name.into(),
        None => unknown(),
    }
}

fn escaped_interp(raw: &[u8], null_placeholder: &str) -> Option<String> {
    let mut decoded = Vec::new();
    match strings::unescape_raw_field(&mut decoded, raw) {
        Unescaped::Quoted | Unescaped::Hex => Some(String::from_utf8_lossy(&decoded).into_owned()),
        Unescaped::HexEscapable => {
            let mut out = String::with_capacity(decoded.len());
            for &b in &decoded {
                if b == 0 {
                    out.push_str(null_placeholder);
                } else if (0x20..=0x7e).contains(&b) {
                    out.push(b as char);
                } else {
                    out.push_str(&format!("\\x{b:02X}"));
                }
            }
            Some(out)
        }
        Unescaped::Null | Unescaped::Copied => None,
    }
}

fn escaped_key_interp(raw: &[u8]) -> Option<String> {
    let mut decoded = Vec::new();
    match strings::unescape_raw_field(&mut decoded, raw) {
        Unescaped::Quoted | Unescaped::Hex | Unescaped::HexEscapable => {
            // Multiple keys are separated by 0x01 in the decoded form.
            let parts: Vec<_> = decoded
                .split(|&b| b == 1)
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect();
            Some(parts.join(","))
        }
        _ => None,
    }
}

fn proctitle_interp(raw: &[u8]) -> Option<String> {
    let mut decoded = Vec::new();
    match strings::unescape_raw_field(&mut decoded, raw) {
        Unescaped::Quoted | Unescaped::Hex | Unescaped::HexEscapable => {
            let mut out = String::new();
            execve::convert_raw_cmdline(&decoded, &mut out);
            Some(out)
        }
        _ => None,
    }
}

fn success_interp(raw: &[u8]) -> Option<String> {
    match raw {
        b"yes" | b"1" => Some("success".into()),
        b"no" | b"0" => Some("failed".into()),
        _ => None,
    }
}

fn session_interp(raw: &[u8]) -> Option<String> {
    match parse_u64(raw, 10) {
        Some(UNSET_ID) => Some("unset".into()),
        _ => None,
    }
}

fn exit_interp(raw: &[u8]) -> Option<String> {
    let value = parse_i64(raw)?;
    if value < 0 {
        errno_name(-value).map(|name| format!("{name}({value})"))
    } else {
        None
    }
}

fn mode_interp(raw: &[u8], short: bool) -> Option<String> {
    let mode = parse_u64(raw, 8)? as u32;
    let mut parts = Vec::new();
    if !short {
        let file_type = match mode & 0o170000 {
            0o140000 => Some("socket"),
            0o120000 => Some("link"),
            0o100000 => Some("file"),
            0o060000 => Some("block"),
            0o040000 => Some("dir"),
            0o020000 => Some("character"),
            0o010000 => Some("fifo"),
            _ => None,
        };
        if let Some(t) = file_type {
            parts.push(t.to_string());
        }
    }
    if mode & 0o4000 != 0 {
        parts.push("suid".into());
    }
    if mode & 0o2000 != 0 {
        parts.push("sgid".into());
    }
    if mode & 0o1000 != 0 {
        parts.push("sticky".into());
    }
    parts.push(format!("{:03o}", mode & 0o777));
    Some(parts.join(","))
}

fn sockaddr_interp(raw: &[u8]) -> Option<String> {
    let mut decoded = Vec::new();
    if strings::decode_hex(&mut decoded, raw).is_none() || decoded.len() < 2 {
        return None;
    }
    let family = u16::from_le_bytes([decoded[0], decoded[1]]);
    match family {
        // AF_INET
        2 if decoded.len() >= 8 => {
            let port = u16::from_be_bytes([decoded[2], decoded[3]]);
            let addr = format!("{}.{}.{}.{}", decoded[4], decoded[5], decoded[6], decoded[7]);
            Some(format!("{{ fam=inet laddr={addr} lport={port} }}"))
        }
        // AF_INET6
        10 if decoded.len() >= 24 => {
            let mut segments = Vec::with_capacity(8);
            for i in 0..8 {
                segments.push(format!(
                    "{:x}",
                    u16::from_be_bytes([decoded[8 + 2 * i], decoded[9 + 2 * i]])
                ));
            }
            let port = u16::from_be_bytes([decoded[2], decoded[3]]);
            Some(format!("{{ fam=inet6 laddr={} lport={port} }}", segments.join(":")))
        }
        // AF_UNIX
        1 => {
            let path_bytes = &decoded[2..];
            let end = path_bytes.iter().position(|&b| b == 0).unwrap_or(path_bytes.len());
            let path = if path_bytes.first() == Some(&0) && path_bytes.len() > 1 {
                // Abstract namespace: NUL-prefixed name.
                let name = &path_bytes[1..];
                let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                format!("@{}", String::from_utf8_lossy(&name[..end]))
            } else {
                String::from_utf8_lossy(&path_bytes[..end]).into_owned()
            };
            Some(format!("{{ fam=local path={path} }}"))
        }
        // AF_NETLINK
        16 if decoded.len() >= 12 => {
            let pid = u32::from_le_bytes([decoded[4], decoded[5], decoded[6], decoded[7]]);
            Some(format!("{{ fam=netlink nlnk-pid={pid} }}"))
        }
        _ => Some(format!("{{ fam={family} }}")),
    }
}

fn capability_interp(raw: &[u8]) -> Option<String> {
    let cap = parse_u64(raw, 10)?;
    capability_name(cap as u32).map(str::to_owned)
}

fn cap_bitmap_interp(raw: &[u8]) -> Option<String> {
    let bits = parse_u64(raw, 16)?;
    if bits == 0 {
        return Some("none".into());
    }
    let mut names = Vec::new();
    for bit in 0..64u32 {
        if bits & (1 << bit) != 0 {
            match capability_name(bit) {
                Some(name) => names.push(name.to_string()),
                None => names.push(format!("cap_{bit}")),
            }
        }
    }
    Some(names.join(","))
}

fn signal_interp(raw: &[u8]) -> Option<String> {
    let sig = parse_u64(raw, 10)?;
    signal_name(sig as u32).map(str::to_owned)
}

fn perm_interp(raw: &[u8]) -> Option<String> {
    let mask = parse_u64(raw, 10)? as u32;
    if mask == 0 {
        return None;
    }
    let mut parts = Vec::new();
    if mask & 4 != 0 {
        parts.push("read");
    }
    if mask & 2 != 0 {
        parts.push("write");
    }
    if mask & 1 != 0 {
        parts.push("exec");
    }
    if mask & 8 != 0 {
        parts.push("attr");
    }
    Some(parts.join(","))
}

fn protocol_interp(raw: &[u8]) -> Option<String> {
    let proto = parse_u64(raw, 10)?;
    Some(
        match proto {
            1 => "icmp",
            2 => "igmp",
            6 => "tcp",
            17 => "udp",
            58 => "ipv6-icmp",
            132 => "sctp",
            _ => return None,
        }
        .into(),
    )
}

fn nfproto_interp(raw: &[u8]) -> Option<String> {
    let family = parse_u64(raw, 10)?;
    Some(
        match family {
            0 => "unspecified",
            2 => "ipv4",
            3 => "arp",
            7 => "bridge",
            10 => "ipv6",
            12 => "decnet",
            _ => return None,
        }
        .into(),
    )
}

fn icmptype_interp(raw: &[u8]) -> Option<String> {
    let code = parse_u64(raw, 10)?;
    Some(
        match code {
            0 => "echo-reply",
            3 => "destination-unreachable",
            4 => "source-quench",
            5 => "redirect",
            8 => "echo",
            11 => "time-exceeded",
            12 => "parameter-problem",
            13 => "timestamp-request",
            14 => "timestamp-reply",
            _ => return None,
        }
        .into(),
    )
}

fn personality_interp(raw: &[u8]) -> Option<String> {
    let per = parse_u64(raw, 16)?;
    Some(
        match per & 0xff {
            0 => "PER_LINUX",
            8 => "PER_LINUX32",
            _ => return None,
        }
        .into(),
    )
}

fn oflag_interp(raw: &[u8]) -> Option<String> {
    let flags = parse_u64(raw, 8)? as u32;
    let mut parts = vec![match flags & 0o3 {
        0 => "O_RDONLY",
        1 => "O_WRONLY",
        2 => "O_RDWR",
        _ => return None,
    }
    .to_string()];
    for (bit, name) in [
        (0o100, "O_CREAT"),
        (0o200, "O_EXCL"),
        (0o400, "O_NOCTTY"),
        (0o1000, "O_TRUNC"),
        (0o2000, "O_APPEND"),
        (0o4000, "O_NONBLOCK"),
        (0o200000, "O_DIRECTORY"),
        (0o400000, "O_NOFOLLOW"),
        (0o2000000, "O_CLOEXEC"),
    ] {
        if flags & bit != 0 {
            parts.push(name.to_string());
        }
    }
    Some(parts.join("|"))
}

fn mmap_interp(raw: &[u8]) -> Option<String> {
    let flags = parse_u64(raw, 16)? as u32;
    let mut parts = Vec::new();
    for (bit, name) in [
        (0x01, "MAP_SHARED"),
        (0x02, "MAP_PRIVATE"),
        (0x10, "MAP_FIXED"),
        (0x20, "MAP_ANONYMOUS"),
        (0x100, "MAP_GROWSDOWN"),
        (0x800, "MAP_DENYWRITE"),
        (0x1000, "MAP_EXECUTABLE"),
        (0x2000, "MAP_LOCKED"),
        (0x4000, "MAP_NORESERVE"),
    ] {
        if flags & bit != 0 {
            parts.push(name);
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("|"))
}

fn seccomp_interp(raw: &[u8]) -> Option<String> {
    let code = parse_u64(raw, 16)?;
    Some(
        match (code & 0xffff_0000) as u32 {
            0x0000_0000 => "kill-thread",
            0x8000_0000 => "kill-process",
            0x0003_0000 => "trap",
            0x0005_0000 => "errno",
            0x7ff0_0000 => "trace",
            0x7ffc_0000 => "log",
            0x7fff_0000 => "allow",
            _ => return None,
        }
        .into(),
    )
}

/// Computes the interpreted sidecar for one field; `None` means the field
/// carries no interpretation.
pub fn interpret_field(
    user_db: &dyn UserDb,
    record: &EventRecord<'_>,
    field: &EventField<'_>,
    kind: FieldKind,
    null_placeholder: &str,
) -> Option<String> {
    let raw = field.raw();
    match kind {
        FieldKind::Uid => Some(uid_interp(user_db, raw)),
        FieldKind::Gid => Some(gid_interp(user_db, raw)),
        FieldKind::Arch => Some(arch_interp(raw)),
        FieldKind::Syscall => Some(syscall_interp(record, raw)),
        FieldKind::Escaped => escaped_interp(raw, null_placeholder),
        FieldKind::EscapedKey => escaped_key_interp(raw),
        FieldKind::Proctitle => proctitle_interp(raw),
        FieldKind::Success => success_interp(raw),
        FieldKind::Session => session_interp(raw),
        FieldKind::Exit => exit_interp(raw),
        FieldKind::Mode => mode_interp(raw, false),
        FieldKind::ModeShort => mode_interp(raw, true),
        FieldKind::Sockaddr => sockaddr_interp(raw),
        FieldKind::Capability => capability_interp(raw),
        FieldKind::CapBitmap => cap_bitmap_interp(raw),
        FieldKind::Signal => signal_interp(raw),
        FieldKind::Perm => perm_interp(raw),
        FieldKind::Protocol => protocol_interp(raw),
        FieldKind::NfProto => nfproto_interp(raw),
        FieldKind::Seccomp => seccomp_interp(raw),
        FieldKind::IcmpType => icmptype_interp(raw),
        FieldKind::Personality => personality_interp(raw),
        FieldKind::OFlag => oflag_interp(raw),
        FieldKind::Mmap => mmap_interp(raw),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) struct StaticUserDb;

#[cfg(test)]
impl UserDb for StaticUserDb {
    fn user_name(&self, uid: u32) -> Option<String> {
        match uid {
            0 => Some("root".into()),
            1000 => Some("tad".into()),
            _ => None,
        }
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        match gid {
            0 => Some("root".into()),
            1000 => Some("tad".into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_and_gid() {
        let db = StaticUserDb;
        assert_eq!(uid_interp(&db, b"0"), "root");
        assert_eq!(uid_interp(&db, b"4294967295"), "unset");
        assert_eq!(uid_interp(&db, b"1234"), "unknown-uid(1234)");
        assert_eq!(gid_interp(&db, b"1000"), "tad");
        assert_eq!(gid_interp(&db, b"999"), "unknown-gid(999)");
    }

    #[test]
    fn arch_table() {
        assert_eq!(arch_interp(b"c000003e"), "x86_64");
        assert_eq!(arch_interp(b"40000003"), "i386");
        assert_eq!(arch_interp(b"c00000b7"), "aarch64");
        assert_eq!(arch_interp(b"40000028"), "arm");
        assert_eq!(arch_interp(b"12345678"), "unknown-arch(0x12345678)");
    }

    #[test]
    fn success_values() {
        assert_eq!(success_interp(b"yes").unwrap(), "success");
        assert_eq!(success_interp(b"1").unwrap(), "success");
        assert_eq!(success_interp(b"no").unwrap(), "failed");
        assert_eq!(success_interp(b"0").unwrap(), "failed");
        assert_eq!(success_interp(b"maybe"), None);
    }

    #[test]
    fn escaped_values() {
        assert_eq!(escaped_interp(b"\"/bin/ls\"", " ").unwrap(), "/bin/ls");
        assert_eq!(escaped_interp(b"2F62696E2F6C73", " ").unwrap(), "/bin/ls");
        // NUL bytes become the placeholder.
        assert_eq!(escaped_interp(b"666F6F00626172", "*").unwrap(), "foo*bar");
        // Unquoted non-hex values carry no interpretation.
        assert_eq!(escaped_interp(b"(null)", " "), None);
    }

    #[test]
    fn exit_errno() {
        assert_eq!(exit_interp(b"-13").unwrap(), "EACCES(-13)");
        assert_eq!(exit_interp(b"0"), None);
        assert_eq!(exit_interp(b"-99999"), None);
    }

    #[test]
    fn mode_rendering() {
        assert_eq!(mode_interp(b"0100644", false).unwrap(), "file,644");
        assert_eq!(mode_interp(b"040755", false).unwrap(), "dir,755");
        assert_eq!(mode_interp(b"0104755", false).unwrap(), "file,suid,755");
        assert_eq!(mode_interp(b"0755", true).unwrap(), "755");
    }

    #[test]
    fn sockaddr_inet() {
        // family 2, port 80 (0x0050 BE), 127.0.0.1
        assert_eq!(
            sockaddr_interp(b"020000507F000001").unwrap(),
            "{ fam=inet laddr=127.0.0.1 lport=80 }"
        );
    }

    #[test]
    fn sockaddr_unix() {
        // family 1 followed by "/run/x.sock\0"
        let mut hex = String::from("0100");
        for b in b"/run/x.sock\0" {
            hex.push_str(&format!("{b:02X}"));
        }
        assert_eq!(
            sockaddr_interp(hex.as_bytes()).unwrap(),
            "{ fam=local path=/run/x.sock }"
        );
    }

    #[test]
    fn cap_bitmap() {
        assert_eq!(cap_bitmap_interp(b"0").unwrap(), "none");
        // chown (bit 0) + setuid (bit 7) = 0x81
        assert_eq!(cap_bitmap_interp(b"81").unwrap(), "chown,setuid");
    }

    #[test]
    fn flag_renderings() {
        assert_eq!(oflag_interp(b"0101101").unwrap(), "O_WRONLY|O_CREAT|O_TRUNC");
        assert_eq!(mmap_interp(b"22").unwrap(), "MAP_PRIVATE|MAP_ANONYMOUS");
        assert_eq!(personality_interp(b"0").unwrap(), "PER_LINUX");
        assert_eq!(icmptype_interp(b"8").unwrap(), "echo");
    }

    #[test]
    fn key_list() {
        // "key1\x01key2" hex encoded
        let mut hex = String::new();
        for b in b"key1\x01key2" {
            hex.push_str(&format!("{b:02X}"));
        }
        assert_eq!(escaped_key_interp(hex.as_bytes()).unwrap(), "key1,key2");
        assert_eq!(escaped_key_interp(b"\"mykey\"").unwrap(), "mykey");
    }
}
