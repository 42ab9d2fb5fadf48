//! The durable multi-priority queue.
//!
//! Each priority band is an append-only log of segment files rotated on a
//! size threshold. Writers append under the state lock; each registered
//! consumer holds a durable cursor per band and reads independently. The
//! oldest segment of a band is deleted once every cursor has acknowledged
//! past its last record.
//!
//! Band 0 is the highest priority: a cursor always drains the lowest
//! numbered band that has unread records before looking at the next.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use snafu::{ResultExt, Snafu};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::record::{encode_record, scan_segment, RECORD_HEADER_LEN};

/// Configuration for one on-disk queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Directory holding the band subdirectories and cursor files.
    pub data_dir: PathBuf,
    /// Number of priority bands; `put` priorities at or above this clamp
    /// to the lowest band.
    pub num_priorities: usize,
    /// Segment rotation threshold.
    pub max_segment_size: u64,
    /// Byte cap per band; a full band blocks `put` until the deadline.
    pub max_priority_bytes: u64,
    /// How often appended data and cursors are synced to disk.
    pub flush_interval: Duration,
}

impl QueueConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> QueueConfig {
        QueueConfig {
            data_dir: data_dir.into(),
            num_priorities: 8,
            max_segment_size: 4 * 1024 * 1024,
            max_priority_bytes: 64 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum OpenError {
    #[snafu(display("queue I/O error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("queue is already open in another process"))]
    LockHeld,

    #[snafu(display("queue lock error: {source}"))]
    Lock { source: std::io::Error },
}

/// Why a `put` did not enqueue.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum PutError {
    /// Every byte of the target band stayed occupied past the deadline.
    #[snafu(display("queue is full"))]
    QueueFull,

    /// The queue is shutting down.
    #[snafu(display("queue is closed"))]
    Closed,
}

/// One dequeued item. The cursor advances past it only when it is acked.
#[derive(Clone, Debug)]
pub struct Item {
    pub priority: usize,
    pub seq: u64,
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug)]
struct RecordLoc {
    segment: u64,
    offset: u64,
    len: u32,
}

#[derive(Debug)]
struct SegmentMeta {
    id: u64,
    base_seq: u64,
    last_seq: u64,
    len: u64,
}

struct Band {
    dir: PathBuf,
    segments: VecDeque<SegmentMeta>,
    index: BTreeMap<u64, RecordLoc>,
    next_seq: u64,
    total_bytes: u64,
    writer: Option<fs::File>,
    dirty: bool,
}

impl Band {
    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("segment-{id}.dat"))
    }

    fn active(&self) -> Option<&SegmentMeta> {
        self.segments.back()
    }
}

#[derive(Clone, Debug, Default)]
struct CursorState {
    acked: Vec<u64>,
    read_pos: Vec<u64>,
}

struct State {
    bands: Vec<Band>,
    cursors: HashMap<String, CursorState>,
    last_flush: Instant,
    cursors_dirty: bool,
}

struct Inner {
    config: QueueConfig,
    state: Mutex<State>,
    write_notify: Notify,
    space_notify: Notify,
    closed: AtomicBool,
    // Held for the queue's lifetime; prevents two daemons sharing a dir.
    _lock: fslock::LockFile,
}

/// Handle to a durable queue. Cloning shares the queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

/// A registered consumer's position in the queue.
#[derive(Clone)]
pub struct QueueCursor {
    inner: Arc<Inner>,
    name: String,
}

async fn load_band(dir: PathBuf) -> Result<Band, OpenError> {
    fs::create_dir_all(&dir).await.context(IoSnafu { path: dir.clone() })?;

    let mut ids = Vec::new();
    let mut entries = fs::read_dir(&dir).await.context(IoSnafu { path: dir.clone() })?;
    while let Some(entry) = entries.next_entry().await.context(IoSnafu { path: dir.clone() })? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name.strip_prefix("segment-").and_then(|r| r.strip_suffix(".dat")) {
            if let Ok(id) = id.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();

    let mut band = Band {
        dir,
        segments: VecDeque::new(),
        index: BTreeMap::new(),
        next_seq: 1,
        total_bytes: 0,
        writer: None,
        dirty: false,
    };

    for id in ids {
        let path = band.segment_path(id);
        let data = fs::read(&path).await.context(IoSnafu { path: path.clone() })?;
        let scan = scan_segment(&data);
        if scan.valid_len < data.len() as u64 {
            warn!(
                path = %path.display(),
                valid = scan.valid_len,
                total = data.len(),
                "Truncating torn tail of queue segment."
            );
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .context(IoSnafu { path: path.clone() })?;
            file.set_len(scan.valid_len).await.context(IoSnafu { path: path.clone() })?;
        }

        let base_seq = scan.records.first().map(|r| r.seq).unwrap_or(band.next_seq);
        let last_seq = scan.records.last().map(|r| r.seq).unwrap_or(base_seq.saturating_sub(1));
        for rec in &scan.records {
            band.index.insert(rec.seq, RecordLoc { segment: id, offset: rec.offset, len: rec.len });
        }
        band.total_bytes += scan.valid_len;
        band.next_seq = band.next_seq.max(last_seq + 1);
        band.segments.push_back(SegmentMeta { id, base_seq, last_seq, len: scan.valid_len });
    }

    Ok(band)
}

fn parse_cursor_file(content: &str, num_bands: usize) -> CursorState {
    let mut acked = vec![0u64; num_bands];
    for line in content.lines() {
        let mut parts = line.split(':');
        let (Some(band), Some(seq)) = (parts.next(), parts.next()) else { continue };
        let (Ok(band), Ok(seq)) = (band.trim().parse::<usize>(), seq.trim().parse::<u64>()) else {
            continue;
        };
        if band < num_bands {
            acked[band] = seq;
        }
    }
    let read_pos = acked.iter().map(|&a| a + 1).collect();
    CursorState { acked, read_pos }
}

fn render_cursor_file(state: &CursorState) -> String {
    let mut out = String::new();
    for (band, acked) in state.acked.iter().enumerate() {
        out.push_str(&format!("{band}:{acked}\n"));
    }
    out
}

impl Queue {
    /// Opens (or creates) a queue under `config.data_dir`, recovering
    /// segments and registered cursors from disk.
    pub async fn open(config: QueueConfig) -> Result<Queue, OpenError> {
        fs::create_dir_all(&config.data_dir)
            .await
            .context(IoSnafu { path: config.data_dir.clone() })?;

        let lock_path = config.data_dir.join("queue.lock");
        let mut lock = fslock::LockFile::open(&lock_path).context(LockSnafu)?;
        if !lock.try_lock().context(LockSnafu)? {
            return Err(OpenError::LockHeld);
        }

        let mut bands = Vec::with_capacity(config.num_priorities);
        for band_idx in 0..config.num_priorities {
            bands.push(load_band(config.data_dir.join(format!("prio-{band_idx}"))).await?);
        }

        let cursors_dir = config.data_dir.join("cursors");
        fs::create_dir_all(&cursors_dir)
            .await
            .context(IoSnafu { path: cursors_dir.clone() })?;
        let mut cursors = HashMap::new();
        let mut entries =
            fs::read_dir(&cursors_dir).await.context(IoSnafu { path: cursors_dir.clone() })?;
        while let Some(entry) =
            entries.next_entry().await.context(IoSnafu { path: cursors_dir.clone() })?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str().and_then(|n| n.strip_suffix(".cur")) else {
                continue;
            };
            let content = fs::read_to_string(entry.path())
                .await
                .context(IoSnafu { path: entry.path() })?;
            cursors.insert(name.to_string(), parse_cursor_file(&content, config.num_priorities));
        }

        let total: u64 = bands.iter().map(|b| b.total_bytes).sum();
        info!(
            data_dir = %config.data_dir.display(),
            bands = config.num_priorities,
            buffered_bytes = total,
            cursors = cursors.len(),
            "Queue opened."
        );

        Ok(Queue {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    bands,
                    cursors,
                    last_flush: Instant::now(),
                    cursors_dirty: false,
                }),
                write_notify: Notify::new(),
                space_notify: Notify::new(),
                closed: AtomicBool::new(false),
                _lock: lock,
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Appends one item to a band, blocking while the band is at its byte
    /// cap until `deadline` (forever when `None`).
    pub async fn put(
        &self,
        priority: usize,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), PutError> {
        let inner = &self.inner;
        let band_idx = priority.min(inner.config.num_priorities - 1);
        let rec_size = (RECORD_HEADER_LEN + payload.len()) as u64;

        loop {
            if self.is_closed() {
                return Err(PutError::Closed);
            }

            let mut state = inner.state.lock().await;
            if state.bands[band_idx].total_bytes + rec_size <= inner.config.max_priority_bytes {
                if let Err(error) = append(inner, &mut state, band_idx, payload).await {
                    // An append failure is a disk-level problem; surface it
                    // as back-pressure so the caller accounts a drop.
                    warn!(%error, band = band_idx, "Failed to append to queue segment.");
                    return Err(PutError::QueueFull);
                }
                maybe_flush(inner, &mut state).await;
                drop(state);
                counter!("queue_put_events").increment(1);
                inner.write_notify.notify_waiters();
                return Ok(());
            }

            // Band full: wait for acks to free space, re-check, repeat.
            let notified = inner.space_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        counter!("queue_full_events").increment(1);
                        return Err(PutError::QueueFull);
                    }
                }
            }
        }
    }

    /// Registers (or re-attaches) a named consumer and returns its cursor.
    pub async fn register(&self, name: &str) -> QueueCursor {
        let mut state = self.inner.state.lock().await;
        let num = self.inner.config.num_priorities;
        state.cursors.entry(name.to_string()).or_insert_with(|| CursorState {
            acked: vec![0; num],
            read_pos: vec![1; num],
        });
        state.cursors_dirty = true;
        QueueCursor { inner: Arc::clone(&self.inner), name: name.to_string() }
    }

    /// Closes the queue: wakes every waiter, syncs segments and cursors.
    /// Further `put` calls fail with [`PutError::Closed`]; readers drain
    /// what is buffered and then see the end.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut state = self.inner.state.lock().await;
        flush(&self.inner, &mut state).await;
        drop(state);
        self.inner.write_notify.notify_waiters();
        self.inner.space_notify.notify_waiters();
        info!("Queue closed.");
    }

    /// Forces segment and cursor sync.
    pub async fn sync(&self) {
        let mut state = self.inner.state.lock().await;
        flush(&self.inner, &mut state).await;
    }
}

async fn append(
    inner: &Inner,
    state: &mut State,
    band_idx: usize,
    payload: &[u8],
) -> std::io::Result<()> {
    let max_segment_size = inner.config.max_segment_size;
    let band = &mut state.bands[band_idx];
    let rec_size = (RECORD_HEADER_LEN + payload.len()) as u64;

    let rotate = match band.active() {
        Some(active) => active.len + rec_size > max_segment_size && active.len > 0,
        None => true,
    };
    if rotate {
        if let Some(writer) = band.writer.take() {
            writer.sync_all().await?;
        }
        let id = band.active().map(|s| s.id + 1).unwrap_or(0);
        band.segments.push_back(SegmentMeta {
            id,
            base_seq: band.next_seq,
            last_seq: band.next_seq - 1,
            len: 0,
        });
        debug!(band = band_idx, segment = id, "Rotated to new queue segment.");
    }

    let active_id = band.active().expect("active segment").id;
    if band.writer.is_none() {
        let path = band.segment_path(active_id);
        let file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        band.writer = Some(file);
    }

    let seq = band.next_seq;
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    encode_record(&mut buf, seq, payload);
    band.writer.as_mut().expect("writer just opened").write_all(&buf).await?;

    let active = band.segments.back_mut().expect("active segment");
    let offset = active.len;
    band.index.insert(
        seq,
        RecordLoc { segment: active.id, offset, len: payload.len() as u32 },
    );
    active.len += rec_size;
    active.last_seq = seq;
    band.total_bytes += rec_size;
    band.next_seq = seq + 1;
    band.dirty = true;
    Ok(())
}

async fn maybe_flush(inner: &Inner, state: &mut State) {
    if state.last_flush.elapsed() >= inner.config.flush_interval {
        flush(inner, state).await;
    }
}

async fn flush(inner: &Inner, state: &mut State) {
    for band in &mut state.bands {
        if band.dirty {
            if let Some(writer) = band.writer.as_mut() {
                if let Err(error) = writer.sync_all().await {
                    warn!(%error, "Failed to sync queue segment.");
                }
            }
            band.dirty = false;
        }
    }

    if state.cursors_dirty {
        let dir = inner.config.data_dir.join("cursors");
        for (name, cursor) in &state.cursors {
            let path = dir.join(format!("{name}.cur"));
            let tmp = dir.join(format!("{name}.cur.tmp"));
            let content = render_cursor_file(cursor);
            let result = async {
                fs::write(&tmp, content.as_bytes()).await?;
                fs::rename(&tmp, &path).await
            }
            .await;
            if let Err(error) = result {
                warn!(%error, cursor = %name, "Failed to persist queue cursor.");
            }
        }
        state.cursors_dirty = false;
    }

    state.last_flush = Instant::now();
}

/// Deletes segments every cursor has acked past, front to back per band.
async fn reclaim(inner: &Inner, state: &mut State) {
    if state.cursors.is_empty() {
        return;
    }

    let mut freed = false;
    for band_idx in 0..state.bands.len() {
        let min_acked = state
            .cursors
            .values()
            .map(|c| c.acked[band_idx])
            .min()
            .unwrap_or(0);

        loop {
            let band = &mut state.bands[band_idx];
            // The active (last) segment is never deleted.
            if band.segments.len() <= 1 {
                break;
            }
            let front = band.segments.front().expect("non-empty segments");
            if front.last_seq > min_acked {
                break;
            }
            let front = band.segments.pop_front().expect("front just seen");
            let path = band.segment_path(front.id);
            band.total_bytes = band.total_bytes.saturating_sub(front.len);
            let upto = front.last_seq;
            let stale: Vec<u64> =
                band.index.range(..=upto).map(|(&seq, _)| seq).collect();
            for seq in stale {
                band.index.remove(&seq);
            }
            if let Err(error) = fs::remove_file(&path).await {
                warn!(%error, path = %path.display(), "Failed to delete drained queue segment.");
            } else {
                debug!(band = band_idx, segment = front.id, "Deleted drained queue segment.");
            }
            freed = true;
        }
    }

    if freed {
        inner.space_notify.notify_waiters();
    }
}

impl QueueCursor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the next undelivered item, scanning bands from highest to
    /// lowest priority, waiting for the writer when everything at or after
    /// this cursor is drained. Returns `None` once the queue is closed and
    /// drained.
    pub async fn next(&self) -> Option<Item> {
        let inner = &self.inner;
        loop {
            let mut state = inner.state.lock().await;

            let num_bands = state.bands.len();
            for band_idx in 0..num_bands {
                let pos = state
                    .cursors
                    .get(&self.name)
                    .map(|c| c.read_pos[band_idx])
                    .unwrap_or(1);
                let Some((&seq, &loc)) = state.bands[band_idx].index.range(pos..).next() else {
                    continue;
                };

                let path = state.bands[band_idx].segment_path(loc.segment);
                match read_payload(&path, loc).await {
                    Ok(payload) => {
                        if let Some(cursor) = state.cursors.get_mut(&self.name) {
                            cursor.read_pos[band_idx] = seq + 1;
                        }
                        counter!("queue_delivered_events").increment(1);
                        return Some(Item { priority: band_idx, seq, payload });
                    }
                    Err(error) => {
                        warn!(%error, seq, path = %path.display(), "Failed to read queue record; skipping.");
                        if let Some(cursor) = state.cursors.get_mut(&self.name) {
                            cursor.read_pos[band_idx] = seq + 1;
                        }
                        continue;
                    }
                }
            }

            if inner.closed.load(Ordering::Acquire) {
                return None;
            }

            let notified = inner.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);
            notified.await;
        }
    }

    /// Acknowledges one delivered item, advancing the durable cursor and
    /// freeing drained segments.
    pub async fn ack(&self, item: &Item) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if let Some(cursor) = state.cursors.get_mut(&self.name) {
            if cursor.acked[item.priority] < item.seq {
                cursor.acked[item.priority] = item.seq;
                state.cursors_dirty = true;
            }
        }
        reclaim(inner, &mut state).await;
        maybe_flush(inner, &mut state).await;
    }

    /// Rewinds the read position to just past the acked position, so
    /// un-acked items are delivered again. Used after a connection drop.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(cursor) = state.cursors.get_mut(&self.name) {
            cursor.read_pos = cursor.acked.iter().map(|&a| a + 1).collect();
        }
    }
}

async fn read_payload(path: &PathBuf, loc: RecordLoc) -> std::io::Result<Bytes> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(loc.offset + RECORD_HEADER_LEN as u64)).await?;
    let mut payload = vec![0u8; loc.len as usize];
    file.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> QueueConfig {
        let mut config = QueueConfig::new(dir.path().join("queue"));
        config.num_priorities = 3;
        config.max_segment_size = 256;
        config.max_priority_bytes = 1024;
        config.flush_interval = Duration::from_millis(0);
        config
    }

    async fn put(queue: &Queue, priority: usize, payload: &[u8]) {
        queue.put(priority, payload, None).await.unwrap();
    }

    #[tokio::test]
    async fn fifo_within_band() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;

        put(&queue, 1, b"one").await;
        put(&queue, 1, b"two").await;
        put(&queue, 1, b"three").await;

        for expected in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            let item = cursor.next().await.unwrap();
            assert_eq!(item.payload, expected);
            cursor.ack(&item).await;
        }
    }

    #[tokio::test]
    async fn higher_priority_band_wins() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;

        put(&queue, 2, b"low").await;
        put(&queue, 0, b"high").await;
        put(&queue, 1, b"mid").await;

        let order: Vec<Bytes> = {
            let mut order = Vec::new();
            for _ in 0..3 {
                let item = cursor.next().await.unwrap();
                cursor.ack(&item).await;
                order.push(item.payload);
            }
            order
        };
        assert_eq!(order, vec![&b"high"[..], &b"mid"[..], &b"low"[..]]);
    }

    #[tokio::test]
    async fn independent_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(config(&dir)).await.unwrap();
        let a = queue.register("a").await;
        let b = queue.register("b").await;

        put(&queue, 0, b"x").await;
        put(&queue, 0, b"y").await;

        let item = a.next().await.unwrap();
        assert_eq!(item.payload, "x");
        a.ack(&item).await;

        // Cursor b still sees both.
        let item = b.next().await.unwrap();
        assert_eq!(item.payload, "x");
        b.ack(&item).await;
        let item = b.next().await.unwrap();
        assert_eq!(item.payload, "y");
    }

    #[tokio::test]
    async fn unacked_items_replay_after_reset() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;

        put(&queue, 0, b"a").await;
        put(&queue, 0, b"b").await;
        put(&queue, 0, b"c").await;

        let first = cursor.next().await.unwrap();
        cursor.ack(&first).await;
        // Read but never ack the second and third.
        let _ = cursor.next().await.unwrap();
        let _ = cursor.next().await.unwrap();

        cursor.reset().await;
        let replay = cursor.next().await.unwrap();
        assert_eq!(replay.payload, "b");
        assert_eq!(replay.seq, first.seq + 1);
    }

    #[tokio::test]
    async fn queue_full_after_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.max_priority_bytes = 64;
        let queue = Queue::open(cfg).await.unwrap();
        let _cursor = queue.register("out").await;

        put(&queue, 0, &[0u8; 40]).await;
        let deadline = Instant::now() + Duration::from_millis(50);
        let result = queue.put(0, &[0u8; 40], Some(deadline)).await;
        assert_eq!(result.unwrap_err(), PutError::QueueFull);
    }

    #[tokio::test]
    async fn put_after_close_fails_and_reader_drains() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;

        put(&queue, 0, b"last").await;
        queue.close().await;
        assert_eq!(queue.put(0, b"more", None).await.unwrap_err(), PutError::Closed);

        let item = cursor.next().await.unwrap();
        assert_eq!(item.payload, "last");
        cursor.ack(&item).await;
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn segments_rotate_and_drained_segments_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;

        // 16-byte headers + 48-byte payloads: four records exceed a
        // 256-byte segment, so several segments come and go.
        for i in 0..12u8 {
            put(&queue, 0, &[i; 48]).await;
        }

        let band_dir = dir.path().join("queue/prio-0");
        let count_segments = || {
            std::fs::read_dir(&band_dir)
                .unwrap()
                .filter(|e| {
                    e.as_ref().unwrap().file_name().to_string_lossy().starts_with("segment-")
                })
                .count()
        };
        assert!(count_segments() > 1);

        for _ in 0..12 {
            let item = cursor.next().await.unwrap();
            cursor.ack(&item).await;
        }
        // Only the active segment remains.
        assert_eq!(count_segments(), 1);
    }

    #[tokio::test]
    async fn survives_reopen_with_cursor_position() {
        let dir = tempfile::tempdir().unwrap();

        {
            let queue = Queue::open(config(&dir)).await.unwrap();
            let cursor = queue.register("out").await;
            put(&queue, 0, b"first").await;
            put(&queue, 0, b"second").await;
            put(&queue, 1, b"other-band").await;

            let item = cursor.next().await.unwrap();
            assert_eq!(item.payload, "first");
            cursor.ack(&item).await;
            queue.close().await;
        }

        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;
        // The acked item is gone; everything else is still there, in
        // priority order.
        let item = cursor.next().await.unwrap();
        assert_eq!(item.payload, "second");
        cursor.ack(&item).await;
        let item = cursor.next().await.unwrap();
        assert_eq!(item.payload, "other-band");
        assert_eq!(item.priority, 1);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let queue = Queue::open(config(&dir)).await.unwrap();
            let _cursor = queue.register("out").await;
            put(&queue, 0, b"good").await;
            put(&queue, 0, b"torn").await;
            queue.close().await;
        }

        // Chop the last few bytes off the segment, simulating a crash
        // mid-write.
        let band_dir = dir.path().join("queue/prio-0");
        let segment = std::fs::read_dir(&band_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.to_string_lossy().contains("segment-"))
            .unwrap();
        let data = std::fs::read(&segment).unwrap();
        std::fs::write(&segment, &data[..data.len() - 2]).unwrap();

        let queue = Queue::open(config(&dir)).await.unwrap();
        let cursor = queue.register("out").await;
        let item = cursor.next().await.unwrap();
        assert_eq!(item.payload, "good");
        cursor.ack(&item).await;
        queue.close().await;
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn blocked_put_resumes_when_space_frees() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.max_priority_bytes = 80;
        cfg.max_segment_size = 40;
        let queue = Queue::open(cfg).await.unwrap();
        let cursor = queue.register("out").await;

        put(&queue, 0, &[1u8; 20]).await;
        put(&queue, 0, &[2u8; 20]).await;

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(0, &[3u8; 20], None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Drain and ack both items; deleting the drained segment frees
        // space and unblocks the writer.
        for _ in 0..2 {
            let item = cursor.next().await.unwrap();
            cursor.ack(&item).await;
        }
        blocked.await.unwrap().unwrap();

        let item = cursor.next().await.unwrap();
        assert_eq!(item.payload.as_ref(), &[3u8; 20][..]);
    }
}
