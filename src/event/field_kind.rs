use super::record_type::RecordType;

/// The interpretable class of an audit field value.
///
/// The classes mirror auparse's field typing; a field's class decides how
/// the enricher computes its interpreted sidecar value. The discriminants
/// are stable because they are written into the binary event format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FieldKind {
    Unclassified = 0,
    Uid = 1,
    Gid = 2,
    Syscall = 3,
    Arch = 4,
    Exit = 5,
    Escaped = 6,
    Perm = 7,
    Mode = 8,
    Sockaddr = 9,
    Flags = 10,
    Promisc = 11,
    Capability = 12,
    Success = 13,
    A0 = 14,
    A1 = 15,
    A2 = 16,
    A3 = 17,
    Signal = 18,
    List = 19,
    TtyData = 20,
    Session = 21,
    CapBitmap = 22,
    NfProto = 23,
    IcmpType = 24,
    Protocol = 25,
    Addr = 26,
    Personality = 27,
    Seccomp = 28,
    OFlag = 29,
    Mmap = 30,
    ModeShort = 31,
    MacLabel = 32,
    Proctitle = 33,
    Hook = 34,
    NetAction = 35,
    MacProto = 36,
    IoctlReq = 37,
    EscapedKey = 38,
}

impl FieldKind {
    pub fn from_u16(raw: u16) -> FieldKind {
        if raw <= FieldKind::EscapedKey as u16 {
            // The discriminants are dense, so this transmute-free decode is
            // just a reverse match.
            FIELD_KINDS[raw as usize]
        } else {
            FieldKind::Unclassified
        }
    }
}

const FIELD_KINDS: [FieldKind; 39] = [
    FieldKind::Unclassified,
    FieldKind::Uid,
    FieldKind::Gid,
    FieldKind::Syscall,
    FieldKind::Arch,
    FieldKind::Exit,
    FieldKind::Escaped,
    FieldKind::Perm,
    FieldKind::Mode,
    FieldKind::Sockaddr,
    FieldKind::Flags,
    FieldKind::Promisc,
    FieldKind::Capability,
    FieldKind::Success,
    FieldKind::A0,
    FieldKind::A1,
    FieldKind::A2,
    FieldKind::A3,
    FieldKind::Signal,
    FieldKind::List,
    FieldKind::TtyData,
    FieldKind::Session,
    FieldKind::CapBitmap,
    FieldKind::NfProto,
    FieldKind::IcmpType,
    FieldKind::Protocol,
    FieldKind::Addr,
    FieldKind::Personality,
    FieldKind::Seccomp,
    FieldKind::OFlag,
    FieldKind::Mmap,
    FieldKind::ModeShort,
    FieldKind::MacLabel,
    FieldKind::Proctitle,
    FieldKind::Hook,
    FieldKind::NetAction,
    FieldKind::MacProto,
    FieldKind::IoctlReq,
    FieldKind::EscapedKey,
];

/// Classifies a field by name alone.
pub fn field_kind_by_name(name: &str) -> FieldKind {
    match name {
        "auid" | "uid" | "euid" | "suid" | "fsuid" | "ouid" | "oauid" | "old-auid" | "iuid"
        | "id" | "inode_uid" | "sauid" | "obj_uid" => FieldKind::Uid,
        "gid" | "egid" | "sgid" | "fsgid" | "ogid" | "igid" | "inode_gid" | "new_gid"
        | "obj_gid" => FieldKind::Gid,
        "syscall" => FieldKind::Syscall,
        "arch" => FieldKind::Arch,
        "exit" => FieldKind::Exit,
        "path" | "comm" | "exe" | "file" | "name" | "watch" | "cwd" | "cmd" | "acct" | "dir"
        | "vm" | "old-chardev" | "new-chardev" | "old-disk" | "new-disk" | "old-fs" | "new-fs"
        | "old-net" | "new-net" | "device" | "cgroup" | "apparmor" | "operation"
        | "denied_mask" | "info" | "profile" | "requested_mask" | "old-rng" | "new-rng"
        | "ocomm" | "grp" | "new_group" | "invalid_context" => FieldKind::Escaped,
        "key" => FieldKind::EscapedKey,
        "perm" | "perm_mask" => FieldKind::Perm,
        "mode" => FieldKind::Mode,
        "saddr" => FieldKind::Sockaddr,
        "prom" | "old_prom" => FieldKind::Promisc,
        "capability" => FieldKind::Capability,
        "res" | "result" | "success" => FieldKind::Success,
        "a0" => FieldKind::A0,
        "a1" => FieldKind::A1,
        "a2" => FieldKind::A2,
        "a3" => FieldKind::A3,
        "sig" | "sigev_signo" => FieldKind::Signal,
        "list" => FieldKind::List,
        "data" => FieldKind::TtyData,
        "ses" | "old-ses" => FieldKind::Session,
        "cap_pi" | "cap_pe" | "cap_pp" | "cap_fi" | "cap_fp" | "fp" | "fi" | "fe" | "old_pp"
        | "old_pi" | "old_pe" | "new_pp" | "new_pi" | "new_pe" => FieldKind::CapBitmap,
        "family" => FieldKind::NfProto,
        "icmptype" => FieldKind::IcmpType,
        "proto" => FieldKind::Protocol,
        "addr" => FieldKind::Addr,
        "per" => FieldKind::Personality,
        "code" => FieldKind::Seccomp,
        "oflag" => FieldKind::OFlag,
        "flags" => FieldKind::Mmap,
        "subj" | "obj" | "scontext" | "tcontext" | "vm-ctx" | "img-ctx" => FieldKind::MacLabel,
        "proctitle" => FieldKind::Proctitle,
        "hook" => FieldKind::Hook,
        "action" => FieldKind::NetAction,
        "macproto" => FieldKind::MacProto,
        "ioctlcmd" => FieldKind::IoctlReq,
        _ => FieldKind::Unclassified,
    }
}

/// Classifies a field, applying per-record-type overrides before the name
/// table.
///
/// Several field names mean different things depending on which record they
/// appear in (`saddr` is a packet address inside NETFILTER_PKT but a socket
/// address everywhere else, EXECVE `aN` values are escaped strings rather
/// than syscall args, and so on).
pub fn field_kind_for(rtype: RecordType, name: &str, raw_value: &[u8]) -> FieldKind {
    let by_record = match rtype {
        RecordType::EXECVE => {
            if name.starts_with('a') && name != "argc" && !name.ends_with("_len") {
                Some(FieldKind::Escaped)
            } else {
                None
            }
        }
        RecordType::AVC => (name == "saddr").then_some(FieldKind::Unclassified),
        RecordType::USER_TTY => (name == "msg").then_some(FieldKind::Escaped),
        RecordType::NETFILTER_PKT => (name == "saddr").then_some(FieldKind::Addr),
        RecordType::PATH => (name == "flags").then_some(FieldKind::Flags),
        RecordType::MQ_OPEN => (name == "mode").then_some(FieldKind::ModeShort),
        RecordType::CRYPTO_KEY_USER => (name == "fp").then_some(FieldKind::Unclassified),
        RecordType::ADD_GROUP | RecordType::DEL_GROUP | RecordType::GRP_MGMT => {
            (name == "id").then_some(FieldKind::Gid)
        }
        _ => {
            if name == "acct" {
                let escaped = raw_value.first() == Some(&b'"')
                    || (!raw_value.is_empty()
                        && raw_value.iter().all(|b| b.is_ascii_hexdigit()));
                Some(if escaped {
                    FieldKind::Escaped
                } else {
                    FieldKind::Unclassified
                })
            } else {
                None
            }
        }
    };

    by_record.unwrap_or_else(|| field_kind_by_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_round_trip() {
        for raw in 0..64u16 {
            let kind = FieldKind::from_u16(raw);
            if raw <= FieldKind::EscapedKey as u16 {
                assert_eq!(kind as u16, raw);
            } else {
                assert_eq!(kind, FieldKind::Unclassified);
            }
        }
    }

    #[test]
    fn name_table() {
        assert_eq!(field_kind_by_name("auid"), FieldKind::Uid);
        assert_eq!(field_kind_by_name("ogid"), FieldKind::Gid);
        assert_eq!(field_kind_by_name("syscall"), FieldKind::Syscall);
        assert_eq!(field_kind_by_name("proctitle"), FieldKind::Proctitle);
        assert_eq!(field_kind_by_name("frobnicate"), FieldKind::Unclassified);
    }

    #[test]
    fn saddr_depends_on_record_type() {
        assert_eq!(
            field_kind_for(RecordType::SOCKADDR, "saddr", b"0200"),
            FieldKind::Sockaddr
        );
        assert_eq!(
            field_kind_for(RecordType::NETFILTER_PKT, "saddr", b"0200"),
            FieldKind::Addr
        );
        assert_eq!(
            field_kind_for(RecordType::AVC, "saddr", b"0200"),
            FieldKind::Unclassified
        );
    }

    #[test]
    fn execve_args_are_escaped() {
        assert_eq!(
            field_kind_for(RecordType::EXECVE, "a0", b"666f6f"),
            FieldKind::Escaped
        );
        assert_eq!(
            field_kind_for(RecordType::EXECVE, "a1_len", b"100"),
            FieldKind::Unclassified
        );
        assert_eq!(
            field_kind_for(RecordType::EXECVE, "argc", b"2"),
            FieldKind::Unclassified
        );
    }

    #[test]
    fn acct_depends_on_value() {
        assert_eq!(
            field_kind_for(RecordType::USER_LOGIN, "acct", b"\"root\""),
            FieldKind::Escaped
        );
        assert_eq!(
            field_kind_for(RecordType::USER_LOGIN, "acct", b"deadbeef"),
            FieldKind::Escaped
        );
        assert_eq!(
            field_kind_for(RecordType::USER_LOGIN, "acct", b"not-hex!"),
            FieldKind::Unclassified
        );
    }
}
