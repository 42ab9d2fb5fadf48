//! Output worker: forwards queued events to a Unix-domain peer.
//!
//! Each configured output owns one worker and one durable queue cursor.
//! The worker keeps a connection to its peer, streaming event frames and
//! (in ack mode) holding sent events in a bounded in-flight window until
//! the peer acknowledges them. Any failure drops the connection; on
//! reconnect the cursor rewinds to the acknowledged position, so un-acked
//! events are re-sent in their original order. Duplicates on the peer side
//! are the peer's concern.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use auditmux_buffers::{Item, QueueCursor};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use snafu::Snafu;
use tokio::net::UnixStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codecs::{AckCodec, FrameCodec};
use crate::event::{Event, EventId};

#[derive(Clone, Debug)]
pub struct UnixSinkConfig {
    /// Output name; also the queue cursor name.
    pub name: String,
    /// Peer socket path; a leading `@` selects the abstract namespace.
    pub path: String,
    /// When off, events are acknowledged to the queue as soon as they are
    /// written to the socket.
    pub ack_mode: bool,
    /// Bound on sent-but-unacknowledged events.
    pub ack_queue_size: usize,
    /// How long the oldest un-acked event may wait before the connection
    /// is declared dead.
    pub ack_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl UnixSinkConfig {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> UnixSinkConfig {
        UnixSinkConfig {
            name: name.into(),
            path: path.into(),
            ack_mode: true,
            ack_queue_size: 128,
            ack_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Snafu)]
enum ConnError {
    #[snafu(display("socket I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("write timed out"))]
    WriteTimeout,

    #[snafu(display("timed out waiting for ack"))]
    AckTimeout,

    #[snafu(display("peer closed the connection"))]
    PeerClosed,
}

/// Why the send loop stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Finished {
    QueueClosed,
    Shutdown,
}

struct InflightEntry {
    id: EventId,
    deadline: Instant,
    acked: bool,
    item: Item,
}

/// The ack window shared between the send and ack halves of a connection.
struct Inflight {
    entries: Mutex<VecDeque<InflightEntry>>,
    /// Signalled when the window shrinks below its cap.
    space: Notify,
    /// Signalled when an entry is pushed or the sender finishes.
    changed: Notify,
    sender_done: AtomicBool,
}

impl Inflight {
    fn new() -> Arc<Inflight> {
        Arc::new(Inflight {
            entries: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            changed: Notify::new(),
            sender_done: AtomicBool::new(false),
        })
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("inflight lock").len()
    }

    fn push(&self, entry: InflightEntry) {
        self.entries.lock().expect("inflight lock").push_back(entry);
        self.changed.notify_waiters();
    }

    /// Marks `id` acked and drains the contiguous acked prefix.
    fn ack(&self, id: EventId) -> Vec<Item> {
        let mut entries = self.entries.lock().expect("inflight lock");
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry.acked = true,
            None => {
                debug!(%id, "Ack for event not in flight.");
                return Vec::new();
            }
        }
        let mut acked = Vec::new();
        while entries.front().map(|e| e.acked) == Some(true) {
            acked.push(entries.pop_front().expect("front just seen").item);
        }
        acked
    }

    fn oldest_deadline(&self) -> Option<Instant> {
        self.entries.lock().expect("inflight lock").front().map(|e| e.deadline)
    }

    fn mark_sender_done(&self) {
        self.sender_done.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }
}

pub struct OutputWorker {
    config: UnixSinkConfig,
    cursor: QueueCursor,
}

async fn connect(path: &str) -> std::io::Result<UnixStream> {
    if let Some(name) = path.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        return UnixStream::from_std(stream);
    }
    UnixStream::connect(path).await
}

impl OutputWorker {
    pub fn new(config: UnixSinkConfig, cursor: QueueCursor) -> OutputWorker {
        OutputWorker { config, cursor }
    }

    /// Runs until shutdown or until the queue closes and drains.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.backoff_min;
        info!(output = %self.config.name, path = %self.config.path, "Output started.");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = tokio::select! {
                result = connect(&self.config.path) => match result {
                    Ok(stream) => stream,
                    Err(error) => {
                        debug!(output = %self.config.name, %error, "Connect failed; backing off.");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                        backoff = (backoff * 2).min(self.config.backoff_max);
                        continue;
                    }
                },
                _ = shutdown.changed() => continue,
            };

            info!(output = %self.config.name, "Connected.");
            backoff = self.config.backoff_min;

            match self.run_connection(stream, shutdown.clone()).await {
                Ok(Finished::QueueClosed) => {
                    info!(output = %self.config.name, "Queue closed; output stopping.");
                    break;
                }
                Ok(Finished::Shutdown) => break,
                Err(error) => {
                    warn!(output = %self.config.name, %error, "Connection lost; will reconnect.");
                    // Anything sent but not acked is re-sent from the
                    // cursor after reconnecting.
                    self.cursor.reset().await;
                }
            }
        }

        info!(output = %self.config.name, "Output stopped.");
    }

    async fn run_connection(
        &self,
        stream: UnixStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Finished, ConnError> {
        let (read_half, write_half) = stream.into_split();
        let frames = FramedWrite::new(write_half, FrameCodec::default());
        let acks = FramedRead::new(read_half, AckCodec);
        let inflight = Inflight::new();

        if !self.config.ack_mode {
            return self.send_loop(frames, Arc::clone(&inflight), shutdown).await;
        }

        let send_fut = self.send_loop(frames, Arc::clone(&inflight), shutdown);
        let ack_fut = self.ack_loop(acks, Arc::clone(&inflight));
        tokio::pin!(send_fut);
        tokio::pin!(ack_fut);

        tokio::select! {
            result = &mut send_fut => {
                let finished = result?;
                if finished == Finished::QueueClosed {
                    // Let the peer finish acknowledging what is in flight.
                    ack_fut.await?;
                }
                Ok(finished)
            }
            result = &mut ack_fut => {
                result?;
                Ok(Finished::QueueClosed)
            }
        }
    }

    async fn send_loop(
        &self,
        mut frames: FramedWrite<tokio::net::unix::OwnedWriteHalf, FrameCodec>,
        inflight: Arc<Inflight>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Finished, ConnError> {
        loop {
            // In ack mode the window is bounded; wait for the ack loop to
            // drain it before sending more.
            if self.config.ack_mode {
                loop {
                    let notified = inflight.space.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if inflight.len() < self.config.ack_queue_size {
                        break;
                    }
                    notified.await;
                }
            }

            let item = tokio::select! {
                item = self.cursor.next() => item,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        inflight.mark_sender_done();
                        return Ok(Finished::Shutdown);
                    }
                    continue;
                }
            };
            let Some(item) = item else {
                inflight.mark_sender_done();
                return Ok(Finished::QueueClosed);
            };

            let id = Event::from_bytes(item.payload.clone()).id();
            let write = frames.send(item.payload.clone());
            match tokio::time::timeout(self.config.write_timeout, write).await {
                Err(_) => return Err(ConnError::WriteTimeout),
                Ok(Err(crate::codecs::FrameError::Io { source })) => {
                    return Err(ConnError::Io { source })
                }
                Ok(Err(error)) => {
                    // An encode-side size error; the event cannot ever be
                    // sent, so drop it rather than wedge the stream.
                    warn!(%id, %error, "Dropping unsendable event.");
                    self.cursor.ack(&item).await;
                    continue;
                }
                Ok(Ok(())) => {}
            }
            counter!("sink_sent_events", "output" => self.config.name.clone()).increment(1);

            if self.config.ack_mode {
                inflight.push(InflightEntry {
                    id,
                    deadline: Instant::now() + self.config.ack_timeout,
                    acked: false,
                    item,
                });
            } else {
                self.cursor.ack(&item).await;
            }
        }
    }

    async fn ack_loop(
        &self,
        mut acks: FramedRead<tokio::net::unix::OwnedReadHalf, AckCodec>,
        inflight: Arc<Inflight>,
    ) -> Result<(), ConnError> {
        loop {
            let notified = inflight.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(deadline) = inflight.oldest_deadline() else {
                if inflight.sender_done.load(Ordering::Acquire) {
                    return Ok(());
                }
                notified.await;
                continue;
            };

            tokio::select! {
                frame = acks.next() => {
                    let id = match frame {
                        Some(Ok(id)) => id,
                        Some(Err(crate::codecs::FrameError::Io { source })) => {
                            return Err(ConnError::Io { source })
                        }
                        Some(Err(_)) | None => return Err(ConnError::PeerClosed),
                    };
                    for item in inflight.ack(id) {
                        self.cursor.ack(&item).await;
                    }
                    inflight.space.notify_waiters();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(output = %self.config.name, "Timeout waiting for ack.");
                    counter!("sink_ack_timeouts", "output" => self.config.name.clone())
                        .increment(1);
                    return Err(ConnError::AckTimeout);
                }
            }
        }
    }
}
