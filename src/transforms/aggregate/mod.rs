//! Rule-driven aggregation of matching events into summary events.
//!
//! Events matching a rule are grouped by their aggregation key (the byte
//! values of every first-record field the rule does not aggregate). Each
//! group accumulates per-event columns until a count, size or time bound
//! closes it, at which point a single `AUOMS_AGGREGATE` event is emitted.
//!
//! Ownership is deliberate: an open aggregate owns a copy of its first
//! event, its key is `(offset, len)` spans into that copy, and the age
//! indexes hold keys rather than second handles to the aggregate.

pub mod matcher;
pub mod persist;
pub mod rule;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::event::record_type::RecordType;
use crate::event::{BuildError, Event, EventBuilder, EventId, FieldKind, EVENT_FLAG_SYNTHESIZED};

use matcher::{Matcher, MatcherError};
use rule::{AggregationRule, CollectionMode, FieldMode};

/// Total-ordered eviction key: expiration deadline, then creation order.
pub type AgeKey = (Instant, u64);

/// An owned aggregation key: the length-prefixed concatenation of the
/// non-aggregated field values, comparing equal exactly when the field
/// value sequences are byte-equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggKey(Box<[u8]>);

impl AggKey {
    fn from_values<'a>(values: impl Iterator<Item = &'a [u8]>) -> AggKey {
        let mut buf = Vec::new();
        for value in values {
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        AggKey(buf.into_boxed_slice())
    }

    fn for_event(rule: &AggregationRule, event: &Event) -> Option<AggKey> {
        let record = event.record_at(0)?;
        Some(AggKey::from_values(
            record
                .fields()
                .filter(|f| !rule.has_aggregation_field(f.name()))
                .map(|f| f.raw()),
        ))
    }
}

/// One span into an aggregate's buffers; `(0, 0)` encodes an absent value.
pub type Span = (u32, u32);

/// One open or ready aggregation.
pub struct AggregatedEvent {
    rule: Arc<AggregationRule>,
    id: u64,
    expiration: Instant,
    first_event: EventId,
    last_event: EventId,
    count: u32,
    origin_event: Bytes,
    agg_key_spans: Vec<Span>,
    data: Vec<u8>,
    event_times: Vec<Span>,
    event_serials: Vec<Span>,
    field_values: Vec<Vec<Span>>,
}

fn event_millis(id: EventId) -> i64 {
    id.sec as i64 * 1000 + id.msec as i64
}

fn iso_timestamp(sec: u64, msec: u32) -> String {
    match DateTime::<Utc>::from_timestamp(sec as i64, msec * 1_000_000) {
        Some(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => format!("{sec}.{msec:03}"),
    }
}

impl AggregatedEvent {
    fn new(rule: Arc<AggregationRule>, id: u64, now: Instant) -> AggregatedEvent {
        let expiration = now + Duration::from_secs(rule.max_time as u64);
        let num_fields = rule.aggregation_fields.len();
        AggregatedEvent {
            rule,
            id,
            expiration,
            first_event: EventId::default(),
            last_event: EventId::default(),
            count: 0,
            origin_event: Bytes::new(),
            agg_key_spans: Vec::new(),
            data: Vec::new(),
            event_times: Vec::new(),
            event_serials: Vec::new(),
            field_values: vec![Vec::new(); num_fields],
        }
    }

    pub fn rule(&self) -> &Arc<AggregationRule> {
        &self.rule
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn first_event(&self) -> EventId {
        self.first_event
    }

    pub fn last_event(&self) -> EventId {
        self.last_event
    }

    pub fn age_key(&self) -> AgeKey {
        (self.expiration, self.id)
    }

    pub fn agg_key(&self) -> AggKey {
        AggKey::from_values(
            self.agg_key_spans
                .iter()
                .map(|&(off, len)| &self.origin_event[off as usize..(off + len) as usize]),
        )
    }

    fn push_data(&mut self, bytes: &[u8]) -> Span {
        if bytes.is_empty() {
            return (0, 0);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        (offset, bytes.len() as u32)
    }

    /// Folds one matching event in. Returns false when the aggregate is
    /// full (by count or size); the caller then closes it and opens a new
    /// one for the event.
    pub fn add_event(&mut self, event: &Event) -> bool {
        if self.count == 0 {
            self.origin_event = Bytes::copy_from_slice(event.as_bytes());
            let origin = Event::from_bytes(self.origin_event.clone());
            if let Some(record) = origin.record_at(0) {
                self.agg_key_spans = record
                    .fields()
                    .filter(|f| !self.rule.has_aggregation_field(f.name()))
                    .map(|f| f.raw_span())
                    .collect();
            }
            self.first_event = event.id();
        }

        if self.count >= self.rule.max_count {
            return false;
        }

        let time_value = match self.rule.time_field_mode {
            CollectionMode::Full => Some(format!("{}.{:03}", event.seconds(), event.milliseconds())),
            CollectionMode::Delta => {
                Some((event_millis(event.id()) - event_millis(self.first_event)).to_string())
            }
            CollectionMode::Drop => None,
        };
        let serial_value = match self.rule.serial_field_mode {
            CollectionMode::Full => Some(event.serial().to_string()),
            CollectionMode::Delta => {
                Some((event.serial() as i64 - self.first_event.serial as i64).to_string())
            }
            CollectionMode::Drop => None,
        };

        let record = match event.record_at(0) {
            Some(record) => record,
            None => return false,
        };
        let mut field_bytes: Vec<Option<Vec<u8>>> =
            Vec::with_capacity(self.rule.aggregation_fields.len());
        let mut added_size = time_value.as_ref().map_or(0, String::len)
            + serial_value.as_ref().map_or(0, String::len);
        for spec in &self.rule.aggregation_fields {
            if spec.mode == FieldMode::Drop {
                field_bytes.push(None);
                continue;
            }
            let value = record.field_by_name(&spec.name).map(|field| match spec.mode {
                FieldMode::Raw => field.raw().to_vec(),
                FieldMode::Interp => field.interp().unwrap_or_default().to_vec(),
                FieldMode::Dynamic | FieldMode::Drop => field.value().to_vec(),
            });
            added_size += value.as_ref().map_or(0, Vec::len);
            field_bytes.push(Some(value.unwrap_or_default()));
        }

        if self.data.len() + added_size > self.rule.max_size as usize {
            return false;
        }

        if let Some(time_value) = time_value {
            let span = self.push_data(time_value.as_bytes());
            self.event_times.push(span);
        }
        if let Some(serial_value) = serial_value {
            let span = self.push_data(serial_value.as_bytes());
            self.event_serials.push(span);
        }
        for (idx, value) in field_bytes.into_iter().enumerate() {
            if let Some(value) = value {
                let span = self.push_data(&value);
                self.field_values[idx].push(span);
            }
        }

        self.count += 1;
        if self.last_event < event.id() {
            self.last_event = event.id();
        }
        true
    }

    fn span_str(&self, span: Span) -> String {
        let (off, len) = span;
        String::from_utf8_lossy(&self.data[off as usize..(off + len) as usize]).into_owned()
    }

    fn json_array(&self, spans: &[Span]) -> String {
        let values: Vec<serde_json::Value> = spans
            .iter()
            .map(|&span| serde_json::Value::String(self.span_str(span)))
            .collect();
        serde_json::Value::Array(values).to_string()
    }

    /// Builds the summary event.
    pub fn build_event(&self, builder: &mut EventBuilder) -> Result<Event, BuildError> {
        let origin = Event::from_bytes(self.origin_event.clone());
        let origin_rec = origin.record_at(0).ok_or(BuildError::NoRecord)?;

        let mut field_count: u16 = 0;
        for field in origin_rec.fields() {
            if !self.rule.has_aggregation_field(field.name()) {
                field_count += 1;
            }
        }
        field_count +=
            (self.rule.aggregation_fields.len() - self.rule.num_drop_fields()) as u16;
        // original_record_type_code, original_record_type, first_event_time,
        // last_event_time, num_aggregated_events, event_times, serials
        field_count += 7;
        if self.rule.time_field_mode == CollectionMode::Drop {
            field_count -= 1;
        }
        match self.rule.serial_field_mode {
            CollectionMode::Drop => field_count -= 1,
            CollectionMode::Delta => field_count += 1, // first_serial
            CollectionMode::Full => {}
        }

        builder.begin_event(
            self.last_event.sec,
            self.last_event.msec,
            self.last_event.serial,
            1,
        )?;
        builder.set_event_flags(EVENT_FLAG_SYNTHESIZED);
        builder.begin_record(
            RecordType::AUOMS_AGGREGATE,
            "AUOMS_AGGREGATE",
            origin_rec.text(),
            field_count,
        )?;

        builder.add_field(
            "original_record_type_code",
            origin_rec.record_type().0.to_string().as_bytes(),
            None,
            FieldKind::Unclassified,
        )?;
        builder.add_field(
            "original_record_type",
            origin_rec.type_name().as_bytes(),
            None,
            FieldKind::Unclassified,
        )?;
        builder.add_field(
            "first_event_time",
            iso_timestamp(self.first_event.sec, self.first_event.msec).as_bytes(),
            None,
            FieldKind::Unclassified,
        )?;
        builder.add_field(
            "last_event_time",
            iso_timestamp(self.last_event.sec, self.last_event.msec).as_bytes(),
            None,
            FieldKind::Unclassified,
        )?;
        if self.rule.serial_field_mode == CollectionMode::Delta {
            builder.add_field(
                "first_serial",
                self.first_event.serial.to_string().as_bytes(),
                None,
                FieldKind::Unclassified,
            )?;
        }
        builder.add_field(
            "num_aggregated_events",
            self.count.to_string().as_bytes(),
            None,
            FieldKind::Unclassified,
        )?;

        for field in origin_rec.fields() {
            if !self.rule.has_aggregation_field(field.name()) {
                builder.add_field(field.name(), field.raw(), field.interp(), field.kind())?;
            }
        }

        if self.rule.time_field_mode != CollectionMode::Drop {
            builder.add_field(
                "event_times",
                self.json_array(&self.event_times).as_bytes(),
                None,
                FieldKind::Unclassified,
            )?;
        }
        if self.rule.serial_field_mode != CollectionMode::Drop {
            builder.add_field(
                "serials",
                self.json_array(&self.event_serials).as_bytes(),
                None,
                FieldKind::Unclassified,
            )?;
        }

        for (idx, spec) in self.rule.aggregation_fields.iter().enumerate() {
            if spec.mode == FieldMode::Drop {
                continue;
            }
            builder.add_field(
                &spec.output_name,
                self.json_array(&self.field_values[idx]).as_bytes(),
                None,
                FieldKind::Unclassified,
            )?;
        }

        builder.end_record()?;
        builder.end_event()
    }
}

struct PerRuleAgg {
    open: HashMap<AggKey, AggregatedEvent>,
    by_age: BTreeMap<AgeKey, AggKey>,
}

impl PerRuleAgg {
    fn new() -> PerRuleAgg {
        PerRuleAgg { open: HashMap::new(), by_age: BTreeMap::new() }
    }
}

/// Outcome of [`Aggregator::handle_ready`].
#[derive(Debug)]
pub enum HandleOutcome {
    /// Nothing is ready for emission.
    Empty,
    /// A ready aggregate could not be rendered; it stays queued.
    BuildFailed(BuildError),
    /// The handler ran; `consumed` reports whether it accepted the event.
    Handled { result: i64, consumed: bool },
}

pub struct Aggregator {
    rules: Vec<Arc<AggregationRule>>,
    matcher: Matcher,
    per_rule: Vec<PerRuleAgg>,
    aged: BTreeMap<AgeKey, (usize, AggKey)>,
    ready: VecDeque<AggregatedEvent>,
    next_id: u64,
    builder: EventBuilder,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Aggregator {
        Aggregator {
            rules: Vec::new(),
            matcher: Matcher::compile(&[]).expect("empty rule set compiles"),
            per_rule: Vec::new(),
            aged: BTreeMap::new(),
            ready: VecDeque::new(),
            next_id: 0,
            builder: EventBuilder::new(256 * 1024),
        }
    }

    pub fn num_ready(&self) -> usize {
        self.ready.len()
    }

    pub fn num_pending(&self) -> usize {
        self.per_rule.iter().map(|p| p.open.len()).sum()
    }

    pub fn rules(&self) -> &[Arc<AggregationRule>] {
        &self.rules
    }

    /// Installs a new rule set.
    ///
    /// Open aggregates whose rule (by canonical JSON) survives are
    /// re-indexed under the new ordering; aggregates whose rule is gone are
    /// moved wholesale to the ready queue.
    pub fn set_rules(&mut self, rules: Vec<AggregationRule>) -> Result<(), MatcherError> {
        let match_rules: Vec<_> = rules.iter().map(|r| r.match_rule.clone()).collect();
        let matcher = Matcher::compile(&match_rules)?;

        let rules: Vec<Arc<AggregationRule>> = rules.into_iter().map(Arc::new).collect();
        let new_idx: HashMap<String, usize> = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.canonical_json(), i))
            .collect();

        let old = std::mem::take(&mut self.per_rule);
        let old_rules = std::mem::replace(&mut self.rules, rules);
        self.per_rule = (0..self.rules.len()).map(|_| PerRuleAgg::new()).collect();
        self.aged.clear();

        for (old_rule, old_agg) in old_rules.iter().zip(old) {
            match new_idx.get(&old_rule.canonical_json()) {
                Some(&idx) => {
                    for (key, mut agg) in old_agg.open {
                        agg.rule = Arc::clone(&self.rules[idx]);
                        self.per_rule[idx].by_age.insert(agg.age_key(), key.clone());
                        self.aged.insert(agg.age_key(), (idx, key.clone()));
                        self.per_rule[idx].open.insert(key, agg);
                    }
                }
                None => {
                    for (_, agg) in old_agg.open {
                        self.ready.push_back(agg);
                    }
                }
            }
        }

        self.matcher = matcher;
        Ok(())
    }

    /// Offers an event to the aggregator; returns true when the event was
    /// consumed into an aggregate.
    ///
    /// Only single-record events are candidates; everything else passes
    /// through unchanged.
    pub fn add_event(&mut self, event: &Event) -> bool {
        self.add_event_at(event, Instant::now())
    }

    pub fn add_event_at(&mut self, event: &Event, now: Instant) -> bool {
        if event.num_records() != 1 {
            return false;
        }
        let Some(rule_idx) = self.matcher.matches(event) else {
            return false;
        };
        let rule = Arc::clone(&self.rules[rule_idx]);
        let Some(key) = AggKey::for_event(&rule, event) else {
            return false;
        };

        if let Some(agg) = self.per_rule[rule_idx].open.get_mut(&key) {
            if agg.add_event(event) {
                return true;
            }
            // Full: close it out and open a fresh aggregate for the event.
            let agg = self.per_rule[rule_idx]
                .open
                .remove(&key)
                .expect("aggregate just borrowed");
            self.per_rule[rule_idx].by_age.remove(&agg.age_key());
            self.aged.remove(&agg.age_key());
            self.ready.push_back(agg);
            return self.open_aggregate(rule_idx, rule, key, event, now);
        }

        // Enforce the per-rule pending cap before opening another.
        while self.per_rule[rule_idx].open.len() >= rule.max_pending as usize {
            let Some((&age_key, _)) = self.per_rule[rule_idx].by_age.first_key_value() else {
                break;
            };
            let evict_key = self.per_rule[rule_idx]
                .by_age
                .remove(&age_key)
                .expect("age entry just seen");
            self.aged.remove(&age_key);
            if let Some(agg) = self.per_rule[rule_idx].open.remove(&evict_key) {
                self.ready.push_back(agg);
            }
        }

        self.open_aggregate(rule_idx, rule, key, event, now)
    }

    fn open_aggregate(
        &mut self,
        rule_idx: usize,
        rule: Arc<AggregationRule>,
        key: AggKey,
        event: &Event,
        now: Instant,
    ) -> bool {
        let id = self.next_id;
        self.next_id += 1;
        let mut agg = AggregatedEvent::new(rule, id, now);
        if !agg.add_event(event) {
            return false;
        }
        self.per_rule[rule_idx].by_age.insert(agg.age_key(), key.clone());
        self.aged.insert(agg.age_key(), (rule_idx, key.clone()));
        self.per_rule[rule_idx].open.insert(key, agg);
        true
    }

    /// Emits at most one ready aggregate through `handler`.
    ///
    /// Expired open aggregates are first moved to the ready queue. The
    /// handler's `(result, consumed)` is passed through; a ready entry is
    /// only dequeued when the handler consumed it.
    pub fn handle_ready<F>(&mut self, handler: F) -> HandleOutcome
    where
        F: FnOnce(&Event) -> (i64, bool),
    {
        self.handle_ready_at(Instant::now(), handler)
    }

    pub fn handle_ready_at<F>(&mut self, now: Instant, handler: F) -> HandleOutcome
    where
        F: FnOnce(&Event) -> (i64, bool),
    {
        while let Some((&age_key, _)) = self.aged.first_key_value() {
            if age_key.0 >= now {
                break;
            }
            let (rule_idx, key) = self.aged.remove(&age_key).expect("age entry just seen");
            self.per_rule[rule_idx].by_age.remove(&age_key);
            if let Some(agg) = self.per_rule[rule_idx].open.remove(&key) {
                self.ready.push_back(agg);
            }
        }

        let Some(agg) = self.ready.front() else {
            return HandleOutcome::Empty;
        };

        let event = match agg.build_event(&mut self.builder) {
            Ok(event) => event,
            Err(error) => return HandleOutcome::BuildFailed(error),
        };

        let (result, consumed) = handler(&event);
        if consumed {
            self.ready.pop_front();
        }
        HandleOutcome::Handled { result, consumed }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::event::EventBuilder as TestBuilder;

    pub(crate) const TEST_RULE: &str = r#"{
        "match_rule": {
            "record_types": ["AUOMS_EXECVE"],
            "field_rules": [
                { "name": "syscall", "op": "eq", "value": "execve" },
                { "name": "cmdline", "op": "eq", "value": "testcmd" }
            ]
        },
        "aggregation_fields": {
            "pid": {},
            "test_r": { "mode": "raw", "output_name": "raw_test" },
            "test_i": { "mode": "interp", "output_name": "interp_test" },
            "test_d": { "mode": "dynamic", "output_name": "dyn_test" },
            "test_null": { "mode": "interp" },
            "test_drop": { "mode": "drop" },
            "test_a": { "mode": "raw" }
        },
        "max_count": 3
    }"#;

    pub(crate) fn test_event(i: u64, pid: &str) -> Event {
        test_event_with_syscall(i, pid, b"59", Some(b"execve"))
    }

    /// Same match outcome, different aggregation key: the raw syscall value
    /// is part of the key, the matcher sees the interp (or raw fallback).
    pub(crate) fn test_event_alt_key(i: u64, pid: &str) -> Event {
        test_event_with_syscall(i, pid, b"execve", None)
    }

    fn test_event_with_syscall(
        i: u64,
        pid: &str,
        syscall_raw: &[u8],
        syscall_interp: Option<&[u8]>,
    ) -> Event {
        let mut b = TestBuilder::new(64 * 1024);
        b.begin_event(i, 0, i, 1).unwrap();
        let with_test_a = i % 2 == 0;
        let num_fields = if with_test_a { 7 } else { 6 };
        b.begin_record(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE", b"", num_fields).unwrap();
        b.add_field("syscall", syscall_raw, syscall_interp, FieldKind::Syscall).unwrap();
        b.add_field("cmdline", b"testcmd", None, FieldKind::Unclassified).unwrap();
        b.add_field("pid", pid.as_bytes(), None, FieldKind::Unclassified).unwrap();
        b.add_field(
            "test_r",
            format!("raw{i}").as_bytes(),
            Some(format!("interp_r{i}").as_bytes()),
            FieldKind::Unclassified,
        )
        .unwrap();
        b.add_field(
            "test_i",
            format!("x{i}").as_bytes(),
            Some(format!("interp{i}").as_bytes()),
            FieldKind::Unclassified,
        )
        .unwrap();
        b.add_field("test_d", format!("test{i}").as_bytes(), None, FieldKind::Unclassified)
            .unwrap();
        if with_test_a {
            b.add_field("test_a", format!("test{i}").as_bytes(), None, FieldKind::Unclassified)
                .unwrap();
        }
        b.end_record().unwrap();
        b.end_event().unwrap()
    }
}
