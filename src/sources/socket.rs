//! Input listener: accepts already-built events over a local stream socket.
//!
//! Each connection carries event frames (see [`crate::codecs`]); every
//! event that validates and is handed to the pipeline gets an ack frame
//! written back. Filesystem socket paths are created mode 0600 by default
//! so only the daemon's peers can connect; paths starting with `@` bind in
//! the abstract namespace.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use futures::{SinkExt, StreamExt};
use snafu::{ResultExt, Snafu};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codecs::{AckCodec, FrameCodec};
use crate::event::Event;

#[derive(Debug, Snafu)]
pub enum ListenerError {
    #[snafu(display("failed to bind input socket {path}: {source}"))]
    BindSocket { path: String, source: io::Error },

    #[snafu(display("failed to set permissions on {path}: {source}"))]
    SocketPermissions { path: String, source: io::Error },
}

#[derive(Clone, Debug)]
pub struct InputConfig {
    /// Socket path; a leading `@` selects the abstract namespace.
    pub path: String,
    /// Mode applied to filesystem sockets.
    pub mode: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig { path: "/run/auditmux/input.sock".into(), mode: 0o600 }
    }
}

fn bind(config: &InputConfig) -> Result<UnixListener, ListenerError> {
    if let Some(name) = config.path.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
            .context(BindSocketSnafu { path: config.path.clone() })?;
        let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)
            .context(BindSocketSnafu { path: config.path.clone() })?;
        std_listener
            .set_nonblocking(true)
            .context(BindSocketSnafu { path: config.path.clone() })?;
        return UnixListener::from_std(std_listener)
            .context(BindSocketSnafu { path: config.path.clone() });
    }

    let path = Path::new(&config.path);
    if path.exists() {
        // A stale socket from a previous run; nothing can be connected to it.
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let listener =
        UnixListener::bind(path).context(BindSocketSnafu { path: config.path.clone() })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(config.mode))
        .context(SocketPermissionsSnafu { path: config.path.clone() })?;
    Ok(listener)
}

/// Accepts connections until `shutdown` flips, handing each one to its own
/// task.
pub async fn run_input_listener(
    config: InputConfig,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ListenerError> {
    let listener = bind(&config)?;
    info!(path = %config.path, "Input listener started.");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let events = events.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(error) = run_connection(stream, events, shutdown).await {
                                debug!(%error, "Input connection closed.");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "Failed to accept input connection.");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(path = %config.path, "Input listener stopped.");
                    return Ok(());
                }
            }
        }
    }
}

async fn run_connection(
    stream: UnixStream,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::default());
    let mut acks = FramedWrite::new(write_half, AckCodec);

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        let payload = match frame {
            Some(Ok(payload)) => payload,
            Some(Err(error)) => {
                warn!(%error, "Input connection framing error.");
                return Ok(());
            }
            None => return Ok(()),
        };

        let event = Event::from_bytes(payload);
        if let Err(error) = event.validate() {
            warn!(%error, "Dropping invalid event from input connection.");
            continue;
        }

        let id = event.id();
        if events.send(event).await.is_err() {
            // Pipeline is shutting down; the unacked event will be re-sent
            // by the peer on reconnect.
            return Ok(());
        }
        acks.send(id).await.map_err(io::Error::other)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::record_type::RecordType;
    use crate::event::{EventBuilder, EventId, FieldKind};
    use bytes::Bytes;
    use tokio_util::codec::Framed;

    fn sample_event(serial: u64) -> Event {
        let mut b = EventBuilder::new(4096);
        b.begin_event(50, 1, serial, 1).unwrap();
        b.begin_record(RecordType::LOGIN, "LOGIN", b"", 1).unwrap();
        b.add_field("pid", b"77", None, FieldKind::Unclassified).unwrap();
        b.end_record().unwrap();
        b.end_event().unwrap()
    }

    #[tokio::test]
    async fn events_flow_in_and_acks_flow_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.sock").to_string_lossy().into_owned();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = InputConfig { path: path.clone(), mode: 0o600 };
        let listener = tokio::spawn(run_input_listener(config, event_tx, shutdown_rx));

        // Wait for the socket to appear.
        for _ in 0..100 {
            if std::path::Path::new(&path).exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::default());

        let event = sample_event(9001);
        framed.send(Bytes::copy_from_slice(event.as_bytes())).await.unwrap();

        let received = event_rx.recv().await.unwrap();
        assert_eq!(received.id(), EventId::new(50, 1, 9001));

        // The ack comes back on the same connection.
        let mut ack_frames = FramedRead::new(framed.into_inner(), AckCodec);
        let ack = ack_frames.next().await.unwrap().unwrap();
        assert_eq!(ack, EventId::new(50, 1, 9001));

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_event_is_dropped_connection_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.sock").to_string_lossy().into_owned();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = InputConfig { path: path.clone(), mode: 0o600 };
        let listener = tokio::spawn(run_input_listener(config, event_tx, shutdown_rx));
        for _ in 0..100 {
            if std::path::Path::new(&path).exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::default());

        framed.send(Bytes::from_static(b"not an event")).await.unwrap();
        let event = sample_event(12);
        framed.send(Bytes::copy_from_slice(event.as_bytes())).await.unwrap();

        // Only the valid event arrives.
        let received = event_rx.recv().await.unwrap();
        assert_eq!(received.serial(), 12);
        assert!(event_rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap().unwrap();
    }
}
