//! Minimal audit netlink client.
//!
//! Opens a `NETLINK_AUDIT` socket, claims the audit message stream by
//! setting the audit pid, and forwards raw record payloads upward. Requests
//! are matched to their kernel replies by netlink sequence number through a
//! bounded pending table; each `send` hands back the receiving end of a
//! oneshot resolved by the reader task.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use nix::sys::socket::{
    bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use snafu::{ResultExt, Snafu};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::event::record_type::RecordType;

const NLMSG_HDR_LEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

const AUDIT_SET: u16 = 1001;
const AUDIT_STATUS_ENABLED: u32 = 0x01;
const AUDIT_STATUS_PID: u32 = 0x04;

/// Cap on requests awaiting a kernel reply.
const MAX_PENDING_REPLIES: usize = 128;

const RECV_BUF_SIZE: usize = 10 * 1024;

#[derive(Debug, Snafu)]
pub enum NetlinkError {
    #[snafu(display("failed to open audit netlink socket: {source}"))]
    Open { source: nix::Error },

    #[snafu(display("failed to bind audit netlink socket: {source}"))]
    Bind { source: nix::Error },

    #[snafu(display("audit netlink send failed: {source}"))]
    Send { source: nix::Error },

    #[snafu(display("audit netlink recv failed: {source}"))]
    Recv { source: nix::Error },

    #[snafu(display("audit netlink I/O error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("kernel replied with errno {errno}"))]
    Kernel { errno: i32 },

    #[snafu(display("too many requests awaiting replies"))]
    Busy,

    #[snafu(display("the netlink reader is gone"))]
    ReaderGone,
}

/// One raw audit message from the kernel: the netlink message type and its
/// textual payload.
#[derive(Debug)]
pub struct RawMessage {
    pub record_type: RecordType,
    pub payload: Vec<u8>,
}

struct OwnedSocket(RawFd);

impl std::os::unix::io::AsRawFd for OwnedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        // The fd is exclusively ours; errors on close are unreportable.
        let _ = unsafe { libc::close(self.0) };
    }
}

pub struct AuditNetlink {
    fd: AsyncFd<OwnedSocket>,
    next_seq: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<(), i32>>>>,
}

fn put_nlmsg(buf: &mut BytesMut, msg_type: u16, flags: u16, seq: u32, payload: &[u8]) {
    let len = (NLMSG_HDR_LEN + payload.len()) as u32;
    buf.put_u32_le(len);
    buf.put_u16_le(msg_type);
    buf.put_u16_le(flags);
    buf.put_u32_le(seq);
    buf.put_u32_le(0); // pid: kernel fills in the sender
    buf.put_slice(payload);
}

/// The kernel's audit_status structure, only the fields we set.
fn audit_status_payload(mask: u32, enabled: u32, pid: u32) -> [u8; 36] {
    let mut payload = [0u8; 36];
    payload[0..4].copy_from_slice(&mask.to_le_bytes());
    payload[4..8].copy_from_slice(&enabled.to_le_bytes());
    payload[12..16].copy_from_slice(&pid.to_le_bytes());
    payload
}

impl AuditNetlink {
    pub fn open() -> Result<AuditNetlink, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkAudit,
        )
        .context(OpenSnafu)?;
        let sock = OwnedSocket(fd);
        bind(fd, &NetlinkAddr::new(0, 0)).context(BindSnafu)?;

        Ok(AuditNetlink {
            fd: AsyncFd::new(sock).context(IoSnafu)?,
            next_seq: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Sends one request and returns the channel its ack/error arrives on.
    async fn send_request(
        &self,
        msg_type: u16,
        payload: &[u8],
    ) -> Result<oneshot::Receiver<Result<(), i32>>, NetlinkError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending table lock");
            if pending.len() >= MAX_PENDING_REPLIES {
                return Err(NetlinkError::Busy);
            }
            pending.insert(seq, tx);
        }

        let mut buf = BytesMut::with_capacity(NLMSG_HDR_LEN + payload.len());
        put_nlmsg(&mut buf, msg_type, NLM_F_REQUEST | NLM_F_ACK, seq, payload);

        loop {
            let mut guard = self.fd.writable().await.context(IoSnafu)?;
            match send(self.fd.get_ref().0, &buf, MsgFlags::MSG_DONTWAIT) {
                Ok(_) => return Ok(rx),
                Err(nix::Error::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                Err(source) => {
                    self.pending.lock().expect("pending table lock").remove(&seq);
                    return Err(NetlinkError::Send { source });
                }
            }
        }
    }

    /// Directs the kernel audit stream to this process.
    pub async fn set_audit_pid(&self, pid: u32) -> Result<(), NetlinkError> {
        let payload =
            audit_status_payload(AUDIT_STATUS_ENABLED | AUDIT_STATUS_PID, 1, pid);
        let reply = self.send_request(AUDIT_SET, &payload).await?;
        match reply.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(errno)) => Err(NetlinkError::Kernel { errno }),
            Err(_) => Err(NetlinkError::ReaderGone),
        }
    }

    /// Reads messages until `records` closes or the socket fails.
    ///
    /// Control replies resolve their pending request; everything in the
    /// audit record ranges is forwarded.
    pub async fn run(&self, records: mpsc::Sender<RawMessage>) -> Result<(), NetlinkError> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let n = loop {
                let mut guard = self.fd.readable().await.context(IoSnafu)?;
                match recv(self.fd.get_ref().0, &mut buf, MsgFlags::MSG_DONTWAIT) {
                    Ok(n) => break n,
                    Err(nix::Error::EAGAIN) => {
                        guard.clear_ready();
                        continue;
                    }
                    Err(source) => return Err(NetlinkError::Recv { source }),
                }
            };

            let mut offset = 0usize;
            while offset + NLMSG_HDR_LEN <= n {
                let chunk = &buf[offset..];
                let len = u32::from_le_bytes(chunk[0..4].try_into().expect("header")) as usize;
                let msg_type = u16::from_le_bytes(chunk[4..6].try_into().expect("header"));
                let seq = u32::from_le_bytes(chunk[8..12].try_into().expect("header"));
                if len < NLMSG_HDR_LEN || offset + len > n {
                    warn!(len, "Truncated netlink message.");
                    break;
                }
                let payload = &chunk[NLMSG_HDR_LEN..len];

                match msg_type {
                    NLMSG_ERROR => {
                        let errno = if payload.len() >= 4 {
                            i32::from_le_bytes(payload[0..4].try_into().expect("errno"))
                        } else {
                            0
                        };
                        // The error message echoes the failed request's
                        // sequence in its embedded header; an errno of 0 is
                        // the ack itself.
                        let req_seq = if payload.len() >= 4 + NLMSG_HDR_LEN {
                            u32::from_le_bytes(payload[12..16].try_into().expect("seq"))
                        } else {
                            seq
                        };
                        if let Some(tx) =
                            self.pending.lock().expect("pending table lock").remove(&req_seq)
                        {
                            let result = if errno == 0 { Ok(()) } else { Err(-errno) };
                            let _ = tx.send(result);
                        } else {
                            debug!(seq = req_seq, errno, "Unmatched netlink reply.");
                        }
                    }
                    NLMSG_DONE => {}
                    t if t >= 1100 => {
                        let message = RawMessage {
                            record_type: RecordType(t as u32),
                            payload: payload.to_vec(),
                        };
                        if records.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    _ => {}
                }

                // Messages are 4-byte aligned back to back.
                offset += (len + 3) & !3;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nlmsg_layout() {
        let mut buf = BytesMut::new();
        put_nlmsg(&mut buf, AUDIT_SET, NLM_F_REQUEST | NLM_F_ACK, 7, b"abcd");
        assert_eq!(buf.len(), 20);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 20);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), AUDIT_SET);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), 0x05);
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 7);
        assert_eq!(&buf[16..], b"abcd");
    }

    #[test]
    fn audit_status_sets_mask_and_pid() {
        let payload = audit_status_payload(AUDIT_STATUS_ENABLED | AUDIT_STATUS_PID, 1, 4321);
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 0x05);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(payload[12..16].try_into().unwrap()), 4321);
    }
}
