//! Periodic process inventory.
//!
//! Walks `/proc` on a fetch interval and, on a longer interval, emits one
//! synthesized event per live process so downstream consumers can anchor
//! audit activity to the processes that were already running.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::event::record_type::RecordType;
use crate::event::{BuildError, Event, EventBuilder, FieldKind, EVENT_FLAG_SYNTHESIZED};

use super::execve::convert_raw_cmdline;
use super::interpret::{gid_interp, uid_interp, UserDb};

pub const PROCESS_INVENTORY_FETCH_INTERVAL: Duration = Duration::from_secs(300);
pub const PROCESS_INVENTORY_EVENT_INTERVAL: Duration = Duration::from_secs(3600);

const MAX_CMDLINE: usize = u16::MAX as usize - 1;

#[derive(Clone, Debug)]
pub struct InventoryConfig {
    pub enabled: bool,
    pub fetch_interval: Duration,
    pub event_interval: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig {
            enabled: true,
            fetch_interval: PROCESS_INVENTORY_FETCH_INTERVAL,
            event_interval: PROCESS_INVENTORY_EVENT_INTERVAL,
        }
    }
}

/// One process snapshot from `/proc`.
#[derive(Clone, Debug, Default)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub ses: u32,
    pub starttime: String,
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub fsuid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub fsgid: u32,
    pub comm: String,
    pub exe: String,
    pub cmdline: Vec<u8>,
    pub container_id: Option<String>,
}

/// Extracts a container id from `/proc/<pid>/cgroup` content.
///
/// Recognized layouts: `/docker/<id>`, `.../docker-<id>.scope`,
/// `.../containerd-<id>.scope`, and ids living under
/// `/system.slice/docker.service/`. The first 12 hex characters form the
/// short id.
pub fn container_id_from_cgroup(text: &str) -> Option<String> {
    for line in text.lines() {
        let Some(path) = line.splitn(3, ':').nth(2) else {
            continue;
        };
        let candidate = if let Some(idx) = path.find("/docker/") {
            &path[idx + "/docker/".len()..]
        } else if let Some(idx) = path.find("docker-") {
            &path[idx + "docker-".len()..]
        } else if let Some(idx) = path.find("containerd-") {
            &path[idx + "containerd-".len()..]
        } else if path.contains("/docker.service/") {
            path.rsplit('/').next().unwrap_or("")
        } else {
            continue;
        };
        let hex_len = candidate.bytes().take_while(u8::is_ascii_hexdigit).count();
        if hex_len >= 12 {
            return Some(candidate[..12].to_string());
        }
    }
    None
}

fn read_status(path: &Path, info: &mut ProcessInfo) -> io::Result<()> {
    let status = std::fs::read_to_string(path.join("status"))?;
    for line in status.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("Name:") => info.comm = parts.next().unwrap_or("").to_string(),
            Some("PPid:") => info.ppid = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            Some("Uid:") => {
                let ids: Vec<u32> = parts.filter_map(|v| v.parse().ok()).collect();
                if ids.len() >= 4 {
                    info.uid = ids[0];
                    info.euid = ids[1];
                    info.suid = ids[2];
                    info.fsuid = ids[3];
                }
            }
            Some("Gid:") => {
                let ids: Vec<u32> = parts.filter_map(|v| v.parse().ok()).collect();
                if ids.len() >= 4 {
                    info.gid = ids[0];
                    info.egid = ids[1];
                    info.sgid = ids[2];
                    info.fsgid = ids[3];
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn read_starttime(path: &Path) -> Option<String> {
    let stat = std::fs::read_to_string(path.join("stat")).ok()?;
    // The comm field may contain spaces; everything of interest is after
    // the closing paren. starttime is field 22 overall, so field 19 after
    // the state.
    let after = stat.rsplit(')').next()?;
    after.split_whitespace().nth(19).map(str::to_string)
}

/// Iterates over the live processes in `/proc`, yielding a fresh snapshot
/// per `next` call.
pub struct ProcessIterator {
    entries: std::fs::ReadDir,
}

pub fn processes() -> io::Result<ProcessIterator> {
    Ok(ProcessIterator { entries: std::fs::read_dir("/proc")? })
}

impl Iterator for ProcessIterator {
    type Item = ProcessInfo;

    fn next(&mut self) -> Option<ProcessInfo> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };

            let path = entry.path();
            let mut info = ProcessInfo { pid, ..ProcessInfo::default() };
            // The process may exit while we read it; skip on any miss.
            if read_status(&path, &mut info).is_err() {
                continue;
            }
            info.starttime = read_starttime(&path).unwrap_or_default();
            info.ses = std::fs::read_to_string(path.join("sessionid"))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(u32::MAX);
            info.exe = std::fs::read_link(path.join("exe"))
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            info.cmdline = std::fs::read(path.join("cmdline")).unwrap_or_default();
            info.container_id = std::fs::read_to_string(path.join("cgroup"))
                .ok()
                .and_then(|text| container_id_from_cgroup(&text));

            return Some(info);
        }
    }
}

/// Builds one `AUOMS_PROCESS_INVENTORY` event for a process snapshot.
pub fn build_inventory_event(
    builder: &mut EventBuilder,
    user_db: &dyn UserDb,
    info: &ProcessInfo,
    sec: u64,
    msec: u32,
) -> Result<Event, BuildError> {
    let mut cmdline = String::new();
    convert_raw_cmdline(&info.cmdline, &mut cmdline);
    let truncated = cmdline.len() > MAX_CMDLINE;
    if truncated {
        cmdline.truncate(MAX_CMDLINE);
    }

    let mut num_fields = 16;
    if info.container_id.is_some() {
        num_fields += 1;
    }

    builder.begin_event(sec, msec, 0, 1)?;
    builder.set_event_flags(EVENT_FLAG_SYNTHESIZED);
    builder.set_event_pid(info.pid);
    builder.begin_record(
        RecordType::AUOMS_PROCESS_INVENTORY,
        "AUOMS_PROCESS_INVENTORY",
        b"",
        num_fields,
    )?;

    let mut int_field = |builder: &mut EventBuilder, name: &str, val: String, kind: FieldKind| {
        builder.add_field(name, val.as_bytes(), None, kind)
    };

    int_field(builder, "pid", info.pid.to_string(), FieldKind::Unclassified)?;
    int_field(builder, "ppid", info.ppid.to_string(), FieldKind::Unclassified)?;
    {
        let raw = info.ses.to_string();
        let interp = (info.ses == u32::MAX).then_some("unset");
        builder.add_field("ses", raw.as_bytes(), interp.map(str::as_bytes), FieldKind::Session)?;
    }
    builder.add_field("starttime", info.starttime.as_bytes(), None, FieldKind::Unclassified)?;

    for (name, id) in [
        ("uid", info.uid),
        ("euid", info.euid),
        ("suid", info.suid),
        ("fsuid", info.fsuid),
    ] {
        let raw = id.to_string();
        let interp = uid_interp(user_db, raw.as_bytes());
        builder.add_field(name, raw.as_bytes(), Some(interp.as_bytes()), FieldKind::Uid)?;
    }
    for (name, id) in [
        ("gid", info.gid),
        ("egid", info.egid),
        ("sgid", info.sgid),
        ("fsgid", info.fsgid),
    ] {
        let raw = id.to_string();
        let interp = gid_interp(user_db, raw.as_bytes());
        builder.add_field(name, raw.as_bytes(), Some(interp.as_bytes()), FieldKind::Gid)?;
    }

    builder.add_field("comm", info.comm.as_bytes(), None, FieldKind::Unclassified)?;
    builder.add_field("exe", info.exe.as_bytes(), None, FieldKind::Unclassified)?;
    builder.add_field("cmdline", cmdline.as_bytes(), None, FieldKind::Unclassified)?;
    builder.add_field(
        "cmdline_truncated",
        if truncated { b"true" } else { b"false" },
        None,
        FieldKind::Unclassified,
    )?;
    if let Some(container_id) = &info.container_id {
        builder.add_field("container_id", container_id.as_bytes(), None, FieldKind::Unclassified)?;
    }

    builder.end_record()?;
    builder.end_event()
}

/// Walks `/proc` on the fetch interval and emits inventory events on the
/// event interval until shutdown.
pub async fn run_inventory(
    config: InventoryConfig,
    user_db: Arc<dyn UserDb>,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        return;
    }
    let mut builder = EventBuilder::new(128 * 1024);
    let mut ticker = tokio::time::interval(config.fetch_interval);
    let mut last_event_gen: Option<tokio::time::Instant> = None;
    info!("Process inventory started.");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let gen_events = last_event_gen
            .map(|at| at.elapsed() >= config.event_interval)
            .unwrap_or(true);

        let iter = match processes() {
            Ok(iter) => iter,
            Err(error) => {
                warn!(%error, "Failed to open /proc.");
                continue;
            }
        };

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let mut count = 0usize;
        for info in iter {
            count += 1;
            if !gen_events {
                continue;
            }
            match build_inventory_event(
                &mut builder,
                user_db.as_ref(),
                &info,
                now.as_secs(),
                now.subsec_millis(),
            ) {
                Ok(event) => {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    warn!(pid = info.pid, %error, "Failed to build inventory event.");
                }
            }
        }
        debug!(processes = count, emitted = gen_events, "Process inventory pass.");

        if gen_events {
            last_event_gen = Some(tokio::time::Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::enrich::interpret::StaticUserDb;

    #[test]
    fn container_id_formats() {
        let docker = "12:pids:/docker/0123456789abcdef0123456789abcdef\n";
        assert_eq!(container_id_from_cgroup(docker).unwrap(), "0123456789ab");

        let scope = "1:name=systemd:/system.slice/docker-deadbeefdeadbeefdeadbeef.scope\n";
        assert_eq!(container_id_from_cgroup(scope).unwrap(), "deadbeefdead");

        let containerd =
            "0::/system.slice/containerd.service/containerd-cafebabecafebabecafe.scope\n";
        assert_eq!(container_id_from_cgroup(containerd).unwrap(), "cafebabecafe");

        let service = "0::/system.slice/docker.service/abc123abc123abc123\n";
        assert_eq!(container_id_from_cgroup(service).unwrap(), "abc123abc123");

        assert_eq!(container_id_from_cgroup("0::/init.scope\n"), None);
        // Too short to be a container id.
        assert_eq!(container_id_from_cgroup("0::/docker/abc\n"), None);
    }

    #[test]
    fn inventory_event_shape() {
        let info = ProcessInfo {
            pid: 4321,
            ppid: 1,
            ses: u32::MAX,
            starttime: "12345".into(),
            uid: 0,
            euid: 0,
            suid: 0,
            fsuid: 0,
            gid: 1000,
            egid: 1000,
            sgid: 1000,
            fsgid: 1000,
            comm: "nginx".into(),
            exe: "/usr/sbin/nginx".into(),
            cmdline: b"nginx\0-g\0daemon off;\0".to_vec(),
            container_id: Some("0123456789ab".into()),
        };

        let mut builder = EventBuilder::new(64 * 1024);
        let event = build_inventory_event(&mut builder, &StaticUserDb, &info, 99, 1).unwrap();
        event.validate().unwrap();

        assert_eq!(event.pid(), 4321);
        assert_eq!(event.flags(), EVENT_FLAG_SYNTHESIZED);
        let rec = event.record_at(0).unwrap();
        assert_eq!(rec.record_type(), RecordType::AUOMS_PROCESS_INVENTORY);
        assert_eq!(rec.num_fields(), 17);

        assert_eq!(rec.field_by_name("ses").unwrap().interp(), Some(&b"unset"[..]));
        assert_eq!(rec.field_by_name("uid").unwrap().interp(), Some(&b"root"[..]));
        assert_eq!(rec.field_by_name("gid").unwrap().interp(), Some(&b"tad"[..]));
        assert_eq!(
            rec.field_by_name("cmdline").unwrap().raw(),
            b"nginx -g \"daemon off;\""
        );
        assert_eq!(rec.field_by_name("cmdline_truncated").unwrap().raw(), b"false");
        assert_eq!(rec.field_by_name("container_id").unwrap().raw(), b"0123456789ab");
    }

    #[test]
    fn walks_proc_and_finds_self() {
        let me = std::process::id() as i32;
        let found = processes().unwrap().find(|p| p.pid == me);
        let info = found.expect("own process visible in /proc");
        assert!(!info.comm.is_empty());
    }
}
