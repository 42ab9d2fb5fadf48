//! Coalescing of raw audit records into whole events.
//!
//! The kernel emits multi-record events interleaved across event ids, with
//! no guarantee every record (or the terminating EOE) arrives. Entries are
//! kept in an LRU map keyed by event id; completion, age and cache pressure
//! all force an entry out through the event builder, with anything dropped
//! along the way accounted for in a trailer record.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use tracing::warn;

use crate::event::record_type::RecordType;
use crate::event::{BuildError, Event, EventBuilder, EventId, FieldKind};

use super::record::RawRecord;

/// Caps preventing runaway accumulation for one event.
pub const MAX_EVENT_SIZE: usize = 112 * 1024;
pub const MAX_EXECVE_ACCUM_SIZE: usize = 96 * 1024;
/// Leaves room in the event for the PATH/CWD records that follow EXECVE
/// records.
pub const MAX_NUM_EXECVE_RECORDS: usize = 12;
/// How many of the newest EXECVE records are preserved when over a cap.
pub const NUM_EXECVE_RH_PRESERVE: usize = 3;

/// Upper bound on concurrently accumulating events.
pub const MAX_CACHE_ENTRY: usize = 256;

/// One in-progress event.
#[derive(Debug)]
pub struct RawEvent {
    id: EventId,
    records: Vec<RawRecord>,
    execve_records: Vec<RawRecord>,
    drop_counts: BTreeMap<RecordType, u64>,
    num_execve: usize,
    num_dropped: u64,
    syscall_idx: Option<usize>,
    size: usize,
    execve_size: usize,
    touched: Instant,
}

impl RawEvent {
    pub fn new(id: EventId) -> RawEvent {
        RawEvent {
            id,
            records: Vec::new(),
            execve_records: Vec::new(),
            drop_counts: BTreeMap::new(),
            num_execve: 0,
            num_dropped: 0,
            syscall_idx: None,
            size: 0,
            execve_size: 0,
            touched: Instant::now(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Folds one record in. Returns true when the event is now complete:
    /// either an EOE sentinel arrived or the record type never composes
    /// with others.
    pub fn add_record(&mut self, record: RawRecord) -> bool {
        let rtype = record.record_type();

        if rtype == RecordType::EOE {
            return true;
        }

        if rtype == RecordType::EXECVE {
            self.num_execve += 1;
            if self.num_execve == 1 {
                self.size += record.size();
                self.execve_size += record.size();
                self.records.push(record);
            } else {
                if record.size() + self.size > MAX_EVENT_SIZE
                    || record.size() + self.execve_size > MAX_EXECVE_ACCUM_SIZE
                    || self.num_execve > MAX_NUM_EXECVE_RECORDS
                {
                    self.num_dropped += 1;
                    *self.drop_counts.entry(rtype).or_default() += 1;
                    // Evict the oldest EXECVE fragment outside the head
                    // preservation window.
                    let idx = self
                        .execve_records
                        .len()
                        .saturating_sub(NUM_EXECVE_RH_PRESERVE + 1);
                    if !self.execve_records.is_empty() {
                        let evicted = self.execve_records.remove(idx);
                        self.size -= evicted.size();
                        self.execve_size -= evicted.size();
                    }
                }
                self.size += record.size();
                self.execve_size += record.size();
                self.execve_records.push(record);
            }
            return false;
        }

        let duplicate_syscall = rtype == RecordType::SYSCALL && self.syscall_idx.is_some();
        if duplicate_syscall
            || record.size() + self.size > MAX_EVENT_SIZE
            || self.num_execve > MAX_NUM_EXECVE_RECORDS
        {
            self.num_dropped += 1;
            *self.drop_counts.entry(rtype).or_default() += 1;
        } else {
            self.size += record.size();
            if rtype == RecordType::SYSCALL && self.syscall_idx.is_none() {
                self.syscall_idx = Some(self.records.len());
            }
            self.records.push(record);
        }

        rtype.is_single_record()
    }

    /// Builds the assembled event: the SYSCALL record first, then the
    /// remaining records in arrival order (EXECVE continuations inline
    /// after the first EXECVE), then the dropped-records trailer.
    pub fn build(self, builder: &mut EventBuilder) -> Result<Option<Event>, BuildError> {
        if self.records.is_empty() && self.num_dropped == 0 {
            return Ok(None);
        }

        let mut num_records = (self.records.len() + self.execve_records.len()) as u16;
        if !self.drop_counts.is_empty() {
            num_records += 1;
        }

        builder.begin_event(self.id.sec, self.id.msec, self.id.serial, num_records)?;

        if let Some(idx) = self.syscall_idx {
            self.records[idx].append_to(builder)?;
        }
        for (idx, record) in self.records.iter().enumerate() {
            if Some(idx) == self.syscall_idx {
                continue;
            }
            record.append_to(builder)?;
            if record.record_type() == RecordType::EXECVE {
                for execve in &self.execve_records {
                    execve.append_to(builder)?;
                }
            }
        }

        if !self.drop_counts.is_empty() {
            builder.begin_record(
                RecordType::AUOMS_DROPPED_RECORDS,
                "AUOMS_DROPPED_RECORDS",
                b"",
                self.drop_counts.len() as u16,
            )?;
            for (rtype, count) in &self.drop_counts {
                builder.add_field(
                    &rtype.to_string(),
                    count.to_string().as_bytes(),
                    None,
                    FieldKind::Unclassified,
                )?;
            }
            builder.end_record()?;
        }

        builder.end_event().map(Some)
    }
}

/// Folds the raw record stream into whole events under the caps.
pub struct Accumulator {
    builder: EventBuilder,
    events: LruCache<EventId, RawEvent>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Accumulator {
        Accumulator {
            builder: EventBuilder::new(MAX_EVENT_SIZE + 16 * 1024),
            events: LruCache::new(
                NonZeroUsize::new(MAX_CACHE_ENTRY).expect("cache capacity is non-zero"),
            ),
        }
    }

    /// Adds one record, pushing any completed or evicted events into `out`.
    ///
    /// Returns false when the record was not consumed: semantically empty
    /// records and USER_TTY records (raw terminal input we refuse to carry).
    pub fn add_record(&mut self, record: RawRecord, out: &mut Vec<Event>) -> bool {
        counter!("raw_data_bytes").increment(record.size() as u64);
        counter!("raw_data_records").increment(1);

        if record.is_empty() && record.record_type() != RecordType::EOE {
            return false;
        }
        if record.record_type() == RecordType::USER_TTY {
            return false;
        }

        let id = record.event_id();
        match self.events.get_mut(&id) {
            Some(entry) => {
                entry.touched = Instant::now();
                if entry.add_record(record) {
                    let entry = self.events.pop(&id).expect("entry just accessed");
                    emit(entry, &mut self.builder, out);
                }
            }
            None => {
                let mut entry = RawEvent::new(id);
                if entry.add_record(record) {
                    emit(entry, &mut self.builder, out);
                } else if let Some((evicted_id, evicted)) = self.events.push(id, entry) {
                    // The cache was at capacity; the oldest entry gets
                    // force-assembled rather than silently lost.
                    if evicted_id != id {
                        emit(evicted, &mut self.builder, out);
                    }
                }
            }
        }
        true
    }

    /// Force-assembles every entry older than `max_age`; a zero `max_age`
    /// drains the cache entirely.
    pub fn flush(&mut self, max_age: Duration, out: &mut Vec<Event>) {
        self.flush_at(Instant::now(), max_age, out);
    }

    fn flush_at(&mut self, now: Instant, max_age: Duration, out: &mut Vec<Event>) {
        loop {
            let expired = match self.events.peek_lru() {
                Some((_, entry)) => {
                    max_age.is_zero() || now.duration_since(entry.touched) > max_age
                }
                None => break,
            };
            if !expired {
                break;
            }
            let (_, entry) = self.events.pop_lru().expect("entry just peeked");
            emit(entry, &mut self.builder, out);
        }
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    fn age_entry(&mut self, id: &EventId, age: Duration) {
        if let Some(entry) = self.events.peek_mut(id) {
            entry.touched = Instant::now().checked_sub(age).expect("clock offset in range");
        }
    }
}

fn emit(entry: RawEvent, builder: &mut EventBuilder, out: &mut Vec<Event>) {
    let id = entry.id();
    match entry.build(builder) {
        Ok(Some(event)) => {
            counter!("raw_data_events").increment(1);
            out.push(event);
        }
        Ok(None) => {}
        Err(error) => {
            warn!(%id, %error, "Event exceeded queue item size limit.");
            counter!("raw_data_dropped_events").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u64, rtype: &str, body: &str) -> RawRecord {
        let line = format!("type={rtype} msg=audit(100.000:{id}): {body}");
        RawRecord::parse(RecordType::UNKNOWN, line.as_bytes()).unwrap()
    }

    fn drain(acc: &mut Accumulator, records: Vec<RawRecord>) -> Vec<Event> {
        let mut out = Vec::new();
        for r in records {
            acc.add_record(r, &mut out);
        }
        out
    }

    #[test]
    fn single_record_event_emits_immediately() {
        let mut acc = Accumulator::new();
        let out = drain(&mut acc, vec![rec(1, "LOGIN", "pid=100 auid=1000")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].num_records(), 1);
        assert_eq!(out[0].record_at(0).unwrap().record_type(), RecordType::LOGIN);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn multi_record_event_completes_on_eoe() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        acc.add_record(rec(7, "SYSCALL", "arch=c000003e syscall=59 success=yes"), &mut out);
        acc.add_record(rec(7, "CWD", "cwd=\"/\""), &mut out);
        assert!(out.is_empty());
        assert_eq!(acc.pending(), 1);

        acc.add_record(rec(7, "EOE", ""), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(acc.pending(), 0);

        let event = &out[0];
        assert_eq!(event.id(), EventId::new(100, 0, 7));
        assert_eq!(event.num_records(), 2);
        assert_eq!(event.record_at(0).unwrap().record_type(), RecordType::SYSCALL);
        assert_eq!(event.record_at(1).unwrap().record_type(), RecordType::CWD);
    }

    #[test]
    fn syscall_record_is_emitted_first() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        acc.add_record(rec(8, "PATH", "item=0 name=\"/bin/true\""), &mut out);
        acc.add_record(rec(8, "SYSCALL", "arch=c000003e syscall=59"), &mut out);
        acc.add_record(rec(8, "EOE", ""), &mut out);

        let types: Vec<_> = out[0].records().map(|r| r.record_type()).collect();
        assert_eq!(types, vec![RecordType::SYSCALL, RecordType::PATH]);
    }

    #[test]
    fn second_syscall_is_dropped_and_counted() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        acc.add_record(rec(9, "SYSCALL", "arch=c000003e syscall=59 key=first"), &mut out);
        // A second SYSCALL for the same id would not normally happen, but a
        // lossy stream can splice two events together.
        acc.add_record(rec(9, "SYSCALL", "arch=c000003e syscall=42 key=second"), &mut out);
        acc.add_record(rec(9, "EOE", ""), &mut out);

        let event = &out[0];
        assert_eq!(event.record_at(0).unwrap().field_by_name("key").unwrap().raw(), b"first");
        let syscalls = event
            .records()
            .filter(|r| r.record_type() == RecordType::SYSCALL)
            .count();
        assert_eq!(syscalls, 1);
        let dropped = event
            .records()
            .find(|r| r.record_type() == RecordType::AUOMS_DROPPED_RECORDS)
            .expect("dropped trailer present");
        assert_eq!(dropped.field_by_name("SYSCALL").unwrap().raw(), b"1");
    }

    #[test]
    fn execve_fragments_beyond_cap_drop_oldest_past_preserve_window() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        acc.add_record(rec(10, "SYSCALL", "arch=c000003e syscall=59"), &mut out);
        for i in 0..(MAX_NUM_EXECVE_RECORDS + 3) {
            acc.add_record(rec(10, "EXECVE", &format!("a{i}=\"arg{i}\"")), &mut out);
        }
        acc.add_record(rec(10, "EOE", ""), &mut out);

        let event = &out[0];
        let dropped = event
            .records()
            .find(|r| r.record_type() == RecordType::AUOMS_DROPPED_RECORDS)
            .expect("dropped trailer present");
        let execve_drops = dropped.field_by_name("EXECVE").unwrap();
        assert_eq!(execve_drops.raw(), b"3");

        // The head preservation window keeps the newest fragments: the
        // last three EXECVE continuation records are intact.
        let execves: Vec<_> = event
            .records()
            .filter(|r| r.record_type() == RecordType::EXECVE)
            .collect();
        assert_eq!(execves.len(), MAX_NUM_EXECVE_RECORDS);
        let last = execves.last().unwrap();
        let last_arg = format!("a{}", MAX_NUM_EXECVE_RECORDS + 2);
        assert!(last.field_by_name(&last_arg).is_some());
    }

    #[test]
    fn user_tty_and_empty_records_are_refused() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        assert!(!acc.add_record(rec(11, "USER_TTY", "data=41424344"), &mut out));
        assert!(!acc.add_record(rec(12, "LOGIN", ""), &mut out));
        assert!(out.is_empty());
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn cache_overflow_force_emits_oldest() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        for serial in 0..(MAX_CACHE_ENTRY as u64 + 1) {
            acc.add_record(
                rec(serial + 1, "SYSCALL", "arch=c000003e syscall=59"),
                &mut out,
            );
        }
        // The push of entry 257 evicted and emitted entry 1.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].serial(), 1);
        assert_eq!(acc.pending(), MAX_CACHE_ENTRY);
    }

    #[test]
    fn flush_zero_drains_everything() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        acc.add_record(rec(20, "SYSCALL", "syscall=59 arch=c000003e"), &mut out);
        acc.add_record(rec(21, "SYSCALL", "syscall=42 arch=c000003e"), &mut out);
        assert!(out.is_empty());

        acc.flush(Duration::ZERO, &mut out);
        assert_eq!(out.len(), 2);
        // Oldest first.
        assert_eq!(out[0].serial(), 20);
        assert_eq!(out[1].serial(), 21);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn flush_by_age_only_emits_stale_entries() {
        let mut acc = Accumulator::new();
        let mut out = Vec::new();
        acc.add_record(rec(30, "SYSCALL", "syscall=59 arch=c000003e"), &mut out);
        acc.add_record(rec(31, "SYSCALL", "syscall=42 arch=c000003e"), &mut out);
        acc.age_entry(&EventId::new(100, 0, 30), Duration::from_secs(10));

        acc.flush(Duration::from_secs(5), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].serial(), 30);
        assert_eq!(acc.pending(), 1);
    }
}
