//! Save/load of aggregator state across restarts.
//!
//! The state file is text-framed with embedded binary bodies: a header
//! line, the rule set as JSON blobs, then one framed block per ready and
//! open aggregate. Expiration deadlines are persisted as wall-clock epoch
//! seconds together with the save-time wall clock, so a load can
//! reconstruct the remaining monotonic lifetime deterministically.
//!
//! A load refuses any frame whose spans leave the referenced buffer, whose
//! counts or sizes exceed the owning rule's caps, or whose rule index is
//! unknown.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use snafu::{ResultExt, Snafu};

use crate::event::Event;

use super::rule::{AggregationRule, RuleParseError};
use super::{AggregatedEvent, Aggregator, Span};

#[derive(Debug, Snafu)]
pub enum PersistError {
    #[snafu(display("state file I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("invalid state file: {reason}"))]
    Malformed { reason: String },

    #[snafu(display("state file rule is invalid: {source}"))]
    Rule { source: RuleParseError },

    #[snafu(display("aggregate references unknown rule index {index}"))]
    UnknownRule { index: usize },

    #[snafu(display("aggregate span {offset}:{len} leaves its buffer of {buffer} bytes"))]
    SpanOutOfRange { offset: u64, len: u64, buffer: usize },

    #[snafu(display("aggregate count {count} exceeds the rule cap {cap}"))]
    CountExceedsCap { count: u64, cap: u32 },

    #[snafu(display("aggregate size {size} exceeds the rule cap {cap}"))]
    SizeExceedsCap { size: u64, cap: u32 },

    #[snafu(display("failed to re-compile rules from the state file: {reason}"))]
    Compile { reason: String },
}

fn malformed(reason: impl Into<String>) -> PersistError {
    PersistError::Malformed { reason: reason.into() }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn instant_to_epoch(instant: Instant, now: Instant, now_epoch: i64) -> i64 {
    if instant >= now {
        now_epoch + (instant - now).as_secs() as i64
    } else {
        now_epoch - (now - instant).as_secs() as i64
    }
}

fn epoch_to_instant(epoch: i64, now: Instant, now_epoch: i64) -> Instant {
    if epoch > now_epoch {
        now + Duration::from_secs((epoch - now_epoch) as u64)
    } else {
        // Already expired; it will move to ready on the next handle pass.
        now
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn line(&mut self) -> Result<&'a str, PersistError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| malformed("unexpected end of file"))?;
        self.pos += end + 1;
        std::str::from_utf8(&rest[..end]).map_err(|_| malformed("non-utf8 text line"))
    }

    fn exact(&mut self, len: usize) -> Result<&'a [u8], PersistError> {
        if self.pos + len > self.buf.len() {
            return Err(malformed("truncated binary section"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn prefix(&mut self, tag: &str) -> Result<(), PersistError> {
        let bytes = tag.as_bytes();
        if self.buf[self.pos..].starts_with(bytes) {
            self.pos += bytes.len();
            Ok(())
        } else {
            Err(malformed(format!("missing '{tag}' marker")))
        }
    }
}

fn parse_fields<const N: usize>(line: &str, prefix: &str) -> Result<[u64; N], PersistError> {
    let rest = line
        .strip_prefix(prefix)
        .ok_or_else(|| malformed(format!("missing '{prefix}' header")))?;
    let mut out = [0u64; N];
    let mut parts = rest.split(':');
    for slot in out.iter_mut() {
        let part = parts.next().ok_or_else(|| malformed("short header"))?;
        *slot = part
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad header number '{part}'")))?;
    }
    if parts.next().is_some() {
        return Err(malformed("long header"));
    }
    Ok(out)
}

fn parse_signed_fields(line: &str, prefix: &str) -> Result<Vec<i64>, PersistError> {
    let rest = line
        .strip_prefix(prefix)
        .ok_or_else(|| malformed(format!("missing '{prefix}' header")))?;
    rest.split(':')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| malformed(format!("bad header number '{part}'")))
        })
        .collect()
}

fn write_spans(out: &mut Vec<u8>, spans: &[Span]) {
    out.extend_from_slice(format!("AGGFIELD: {}\n", spans.len()).as_bytes());
    for &(off, len) in spans {
        out.extend_from_slice(format!("{off}:{len}\n").as_bytes());
    }
}

fn read_spans(
    reader: &mut Reader<'_>,
    buffer_len: usize,
    max_values: u32,
) -> Result<Vec<Span>, PersistError> {
    let [count] = parse_fields::<1>(reader.line()?, "AGGFIELD: ")?;
    if count > max_values as u64 {
        return Err(PersistError::CountExceedsCap { count, cap: max_values });
    }
    let mut spans = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let line = reader.line()?;
        let mut parts = line.split(':');
        let offset: u64 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| malformed("bad span"))?;
        let len: u64 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| malformed("bad span"))?;
        if offset + len > buffer_len as u64 {
            return Err(PersistError::SpanOutOfRange { offset, len, buffer: buffer_len });
        }
        spans.push((offset as u32, len as u32));
    }
    Ok(spans)
}

impl AggregatedEvent {
    fn write_frame(&self, out: &mut Vec<u8>, rule_idx: usize, now: Instant, now_epoch: i64) {
        let exp_epoch = instant_to_epoch(self.expiration, now, now_epoch);
        out.extend_from_slice(
            format!(
                "AggregatedEvent:HEADER: {}:{}:{}:{}:{}:{}:{}:{}:{}\n",
                rule_idx,
                self.origin_event.len(),
                self.data.len(),
                self.count,
                exp_epoch,
                now_epoch,
                self.last_event.sec,
                self.last_event.msec,
                self.last_event.serial,
            )
            .as_bytes(),
        );
        out.extend_from_slice(b"ORIGIN:");
        out.extend_from_slice(&self.origin_event);
        out.extend_from_slice(b"DATA:");
        out.extend_from_slice(&self.data);

        out.extend_from_slice(format!("AGGKEY: {}\n", self.agg_key_spans.len()).as_bytes());
        for &(off, len) in &self.agg_key_spans {
            out.extend_from_slice(format!("{off}:{len}\n").as_bytes());
        }

        out.extend_from_slice(format!("AGGFIELDS: {}\n", self.field_values.len()).as_bytes());
        write_spans(out, &self.event_times);
        write_spans(out, &self.event_serials);
        for spans in &self.field_values {
            write_spans(out, spans);
        }
    }

    fn read_frame(
        reader: &mut Reader<'_>,
        rules: &[std::sync::Arc<AggregationRule>],
        id: u64,
        now: Instant,
        now_epoch: i64,
    ) -> Result<(usize, AggregatedEvent), PersistError> {
        let header = parse_signed_fields(reader.line()?, "AggregatedEvent:HEADER: ")?;
        if header.len() != 9 {
            return Err(malformed("aggregate header field count"));
        }
        let rule_idx = header[0] as usize;
        let origin_size = header[1] as usize;
        let data_size = header[2] as u64;
        let count = header[3] as u64;
        let exp_epoch = header[4];
        let _save_epoch = header[5];
        let last_event = crate::event::EventId::new(
            header[6] as u64,
            header[7] as u32,
            header[8] as u64,
        );

        let rule = rules
            .get(rule_idx)
            .ok_or(PersistError::UnknownRule { index: rule_idx })?;
        if count > rule.max_count as u64 {
            return Err(PersistError::CountExceedsCap { count, cap: rule.max_count });
        }
        if data_size > rule.max_size as u64 {
            return Err(PersistError::SizeExceedsCap { size: data_size, cap: rule.max_size });
        }

        reader.prefix("ORIGIN:")?;
        let origin = Bytes::copy_from_slice(reader.exact(origin_size)?);
        reader.prefix("DATA:")?;
        let data = reader.exact(data_size as usize)?.to_vec();

        let [key_count] = parse_fields::<1>(reader.line()?, "AGGKEY: ")?;
        if key_count > u16::MAX as u64 {
            return Err(malformed("aggregate key span count"));
        }
        let mut agg_key_spans = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            let line = reader.line()?;
            let mut parts = line.split(':');
            let offset: u64 = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| malformed("bad key span"))?;
            let len: u64 = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| malformed("bad key span"))?;
            if offset + len > origin.len() as u64 {
                return Err(PersistError::SpanOutOfRange {
                    offset,
                    len,
                    buffer: origin.len(),
                });
            }
            agg_key_spans.push((offset as u32, len as u32));
        }

        let [num_fields] = parse_fields::<1>(reader.line()?, "AGGFIELDS: ")?;
        if num_fields as usize > rule.aggregation_fields.len() {
            return Err(malformed("aggregate field count exceeds rule"));
        }

        let event_times = read_spans(reader, data.len(), rule.max_count)?;
        let event_serials = read_spans(reader, data.len(), rule.max_count)?;
        let mut field_values = Vec::with_capacity(rule.aggregation_fields.len());
        for _ in 0..num_fields {
            field_values.push(read_spans(reader, data.len(), rule.max_count)?);
        }
        field_values.resize(rule.aggregation_fields.len(), Vec::new());

        let origin_event = Event::from_bytes(origin.clone());
        let first_event = origin_event.id();

        Ok((
            rule_idx,
            AggregatedEvent {
                rule: std::sync::Arc::clone(rule),
                id,
                expiration: epoch_to_instant(exp_epoch, now, now_epoch),
                first_event,
                last_event,
                count: count as u32,
                origin_event: origin,
                agg_key_spans,
                data,
                event_times,
                event_serials,
                field_values,
            },
        ))
    }
}

impl Aggregator {
    /// Writes the full aggregator state to `path`, mode 0600.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let now = Instant::now();
        let now_epoch = epoch_secs();

        let num_partial: usize = self.per_rule.iter().map(|p| p.open.len()).sum();
        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "EventAggregator::HEADER: {}:{}:{}\n",
                self.rules.len(),
                self.ready.len(),
                num_partial,
            )
            .as_bytes(),
        );

        for rule in &self.rules {
            let json = rule.canonical_json();
            out.extend_from_slice(format!("RULE HEADER: {}\n", json.len() + 1).as_bytes());
            out.extend_from_slice(json.as_bytes());
            out.push(b'\n');
        }

        let rule_idx = |agg: &AggregatedEvent| {
            self.rules
                .iter()
                .position(|r| std::sync::Arc::ptr_eq(r, &agg.rule))
                .unwrap_or(0)
        };

        for agg in &self.ready {
            agg.write_frame(&mut out, rule_idx(agg), now, now_epoch);
        }
        for per in &self.per_rule {
            for agg in per.open.values() {
                agg.write_frame(&mut out, rule_idx(agg), now, now_epoch);
            }
        }

        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .context(IoSnafu)?
        };
        file.write_all(&out).context(IoSnafu)?;
        file.sync_all().context(IoSnafu)?;
        Ok(())
    }

    /// Loads aggregator state from `path`. Any state in `self` is replaced.
    pub fn load(path: &Path) -> Result<Aggregator, PersistError> {
        let buf = std::fs::read(path).context(IoSnafu)?;
        let mut reader = Reader::new(&buf);
        let now = Instant::now();
        let now_epoch = epoch_secs();

        let [num_rules, num_ready, num_partial] =
            parse_fields::<3>(reader.line()?, "EventAggregator::HEADER: ")?;

        let mut rules = Vec::with_capacity(num_rules as usize);
        for _ in 0..num_rules {
            let [len] = parse_fields::<1>(reader.line()?, "RULE HEADER: ")?;
            let raw = reader.exact(len as usize)?;
            let json = std::str::from_utf8(raw)
                .map_err(|_| malformed("non-utf8 rule JSON"))?
                .trim_end_matches(['\n', '\0']);
            rules.push(AggregationRule::from_json_str(json).context(RuleSnafu)?);
        }

        let mut aggregator = Aggregator::new();
        aggregator
            .set_rules(rules)
            .map_err(|e| PersistError::Compile { reason: e.to_string() })?;

        for _ in 0..num_ready {
            let id = aggregator.next_id;
            aggregator.next_id += 1;
            let (_, agg) =
                AggregatedEvent::read_frame(&mut reader, &aggregator.rules, id, now, now_epoch)?;
            aggregator.ready.push_back(agg);
        }

        for _ in 0..num_partial {
            let id = aggregator.next_id;
            aggregator.next_id += 1;
            let (rule_idx, agg) =
                AggregatedEvent::read_frame(&mut reader, &aggregator.rules, id, now, now_epoch)?;
            let key = agg.agg_key();
            aggregator.per_rule[rule_idx].by_age.insert(agg.age_key(), key.clone());
            aggregator.aged.insert(agg.age_key(), (rule_idx, key.clone()));
            aggregator.per_rule[rule_idx].open.insert(key, agg);
        }

        Ok(aggregator)
    }
}
