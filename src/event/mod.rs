//! The binary event format.
//!
//! An event is a self-contained, length-prefixed, immutable byte buffer
//! holding one or more records that share a `(sec, msec, serial)` identity.
//! Events are cheap to clone (the payload is refcounted [`Bytes`]) and are
//! read through zero-copy views; every string and index lives inside the
//! one buffer.
//!
//! Layout, all little-endian:
//!
//! ```text
//! size: u32 | version: u8 | flags: u32 | pid: i32 |
//! sec: u64 | msec: u32 | serial: u64 | num_records: u16 |
//! record_offset[num_records]: u32
//! ```
//!
//! Each record block: `type_code: u32 | name (u16 len) | text (u16 len) |
//! num_fields: u16 | field_offset[num_fields]: u32 |
//! sorted_offset[num_fields]: u32`, where the second offset table is the
//! first, sorted by field name. Each field block: `kind: u16 |
//! name (u16 len) | raw (u32 len) | interp (u32 len, MAX = absent)`.

pub mod builder;
pub mod field_kind;
pub mod record_type;

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use snafu::Snafu;

pub use builder::{BuildError, EventBuilder};
pub use field_kind::FieldKind;
pub use record_type::RecordType;

/// Flag set on events synthesized by the daemon itself (consolidated
/// syscall records, aggregates, process inventory) rather than assembled
/// verbatim from kernel records.
pub const EVENT_FLAG_SYNTHESIZED: u32 = 1;

/// The wire format version written into every event header.
pub const EVENT_VERSION: u8 = 1;

/// Hard cap on the total size of one event; the size field is carried in
/// 24 bits on the wire.
pub const MAX_EVENT_BYTES: usize = 0xFF_FFFF;

pub(crate) const OFF_SIZE: usize = 0;
pub(crate) const OFF_VERSION: usize = 4;
pub(crate) const OFF_FLAGS: usize = 5;
pub(crate) const OFF_PID: usize = 9;
pub(crate) const OFF_SEC: usize = 13;
pub(crate) const OFF_MSEC: usize = 21;
pub(crate) const OFF_SERIAL: usize = 25;
pub(crate) const OFF_NUM_RECORDS: usize = 33;
pub(crate) const HEADER_LEN: usize = 35;

/// Absent-interp sentinel for the field interp length.
pub(crate) const NO_INTERP: u32 = u32::MAX;

/// The identity of an event: the `audit(sec.msec:serial)` triple.
///
/// The serial alone is not unique; the full triple is the key used for
/// acknowledgements, dedup and cache entries. The zero triple means
/// "unset".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub sec: u64,
    pub msec: u32,
    pub serial: u64,
}

impl EventId {
    pub const fn new(sec: u64, msec: u32, serial: u64) -> Self {
        EventId { sec, msec, serial }
    }

    pub fn is_unset(&self) -> bool {
        self.sec == 0 && self.msec == 0 && self.serial == 0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}:{}", self.sec, self.msec, self.serial)
    }
}

/// Error found while validating an event buffer received from an untrusted
/// source.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidateError {
    #[snafu(display("event buffer too small for header ({len} bytes)"))]
    Truncated { len: usize },
    #[snafu(display("event version {version} is not supported"))]
    BadVersion { version: u8 },
    #[snafu(display("event size field {size} does not match buffer length {len}"))]
    SizeMismatch { size: usize, len: usize },
    #[snafu(display("offset {offset} is out of bounds in record {record}"))]
    BadOffset { record: usize, offset: usize },
    #[snafu(display("record {record} is malformed"))]
    BadRecord { record: usize },
    #[snafu(display("record {record} has zero fields"))]
    EmptyRecord { record: usize },
    #[snafu(display("record {record} sorted index is not a permutation"))]
    BadSortedIndex { record: usize },
}

fn get_u16(data: &[u8], off: usize) -> u16 {
    match data.get(off..off + 2) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

fn get_u32(data: &[u8], off: usize) -> u32 {
    match data.get(off..off + 4) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

fn get_u64(data: &[u8], off: usize) -> u64 {
    match data.get(off..off + 8) {
        Some(b) => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        None => 0,
    }
}

fn get_bytes(data: &[u8], off: usize, len: usize) -> &[u8] {
    data.get(off..off + len).unwrap_or(&[])
}

/// An immutable, validated-or-trusted event buffer.
#[derive(Clone)]
pub struct Event {
    data: Bytes,
}

impl Event {
    /// Wraps raw bytes without validation. Callers holding bytes from an
    /// untrusted source must call [`Event::validate`] before reading
    /// records.
    pub fn from_bytes(data: Bytes) -> Event {
        Event { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn size(&self) -> usize {
        get_u32(&self.data, OFF_SIZE) as usize
    }

    pub fn version(&self) -> u8 {
        self.data.get(OFF_VERSION).copied().unwrap_or(0)
    }

    pub fn flags(&self) -> u32 {
        get_u32(&self.data, OFF_FLAGS)
    }

    pub fn pid(&self) -> i32 {
        get_u32(&self.data, OFF_PID) as i32
    }

    pub fn seconds(&self) -> u64 {
        get_u64(&self.data, OFF_SEC)
    }

    pub fn milliseconds(&self) -> u32 {
        get_u32(&self.data, OFF_MSEC)
    }

    pub fn serial(&self) -> u64 {
        get_u64(&self.data, OFF_SERIAL)
    }

    pub fn id(&self) -> EventId {
        EventId::new(self.seconds(), self.milliseconds(), self.serial())
    }

    pub fn num_records(&self) -> u16 {
        get_u16(&self.data, OFF_NUM_RECORDS)
    }

    pub fn record_at(&self, index: u16) -> Option<EventRecord<'_>> {
        if index >= self.num_records() {
            return None;
        }
        let offset = get_u32(&self.data, HEADER_LEN + 4 * index as usize) as usize;
        if offset == 0 || offset >= self.data.len() {
            return None;
        }
        Some(EventRecord { data: &self.data, offset })
    }

    pub fn records(&self) -> impl Iterator<Item = EventRecord<'_>> + '_ {
        (0..self.num_records()).filter_map(move |i| self.record_at(i))
    }

    /// Checks that every offset in the buffer is intra-buffer and the
    /// structural invariants hold. Must be run on any event that arrived
    /// over a socket before its records are read.
    pub fn validate(&self) -> Result<(), ValidateError> {
        let data = &self.data;
        if data.len() < HEADER_LEN {
            return Err(ValidateError::Truncated { len: data.len() });
        }
        if self.version() != EVENT_VERSION {
            return Err(ValidateError::BadVersion { version: self.version() });
        }
        if self.size() != data.len() || self.size() > MAX_EVENT_BYTES {
            return Err(ValidateError::SizeMismatch { size: self.size(), len: data.len() });
        }

        let num_records = self.num_records() as usize;
        let table_end = HEADER_LEN + 4 * num_records;
        if table_end > data.len() {
            return Err(ValidateError::Truncated { len: data.len() });
        }

        for rec_idx in 0..num_records {
            let roff = get_u32(data, HEADER_LEN + 4 * rec_idx) as usize;
            self.validate_record(rec_idx, roff)?;
        }

        Ok(())
    }

    fn validate_record(&self, rec_idx: usize, roff: usize) -> Result<(), ValidateError> {
        let data = &self.data;
        let len = data.len();
        let bad = |offset| ValidateError::BadOffset { record: rec_idx, offset };

        // type code, name, text, field count
        let mut off = roff.checked_add(4).ok_or_else(|| bad(roff))?;
        if off + 2 > len {
            return Err(bad(off));
        }
        let name_len = get_u16(data, off) as usize;
        off += 2 + name_len;
        if off + 2 > len {
            return Err(bad(off));
        }
        let text_len = get_u16(data, off) as usize;
        off += 2 + text_len;
        if off + 2 > len {
            return Err(bad(off));
        }
        let num_fields = get_u16(data, off) as usize;
        off += 2;

        let rtype = RecordType(get_u32(data, roff));
        if num_fields == 0 && rtype != RecordType::EOE {
            return Err(ValidateError::EmptyRecord { record: rec_idx });
        }

        let decl_off = off;
        let sorted_off = off + 4 * num_fields;
        if sorted_off + 4 * num_fields > len {
            return Err(bad(sorted_off));
        }

        let mut decl = Vec::with_capacity(num_fields);
        for i in 0..num_fields {
            let foff = get_u32(data, decl_off + 4 * i) as usize;
            self.validate_field(rec_idx, foff)?;
            decl.push(foff);
        }

        let mut sorted = Vec::with_capacity(num_fields);
        for i in 0..num_fields {
            sorted.push(get_u32(data, sorted_off + 4 * i) as usize);
        }
        let mut decl_check = decl.clone();
        let mut sorted_check = sorted.clone();
        decl_check.sort_unstable();
        sorted_check.sort_unstable();
        if decl_check != sorted_check {
            return Err(ValidateError::BadSortedIndex { record: rec_idx });
        }

        Ok(())
    }

    fn validate_field(&self, rec_idx: usize, foff: usize) -> Result<(), ValidateError> {
        let data = &self.data;
        let len = data.len();
        let bad = |offset| ValidateError::BadOffset { record: rec_idx, offset };

        let mut off = foff.checked_add(2).ok_or_else(|| bad(foff))?;
        if off + 2 > len {
            return Err(bad(off));
        }
        let name_len = get_u16(data, off) as usize;
        off += 2 + name_len;
        if off + 4 > len {
            return Err(bad(off));
        }
        let raw_len = get_u32(data, off) as usize;
        off += 4 + raw_len;
        if off + 4 > len {
            return Err(bad(off));
        }
        let interp_len = get_u32(data, off);
        off += 4;
        if interp_len != NO_INTERP {
            off += interp_len as usize;
        }
        if off > len {
            return Err(bad(off));
        }
        Ok(())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id().to_string())
            .field("flags", &self.flags())
            .field("pid", &self.pid())
            .field("num_records", &self.num_records())
            .field("size", &self.size())
            .finish()
    }
}

/// A zero-copy view over one record block of an [`Event`].
#[derive(Clone, Copy)]
pub struct EventRecord<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> EventRecord<'a> {
    pub fn record_type(&self) -> RecordType {
        RecordType(get_u32(self.data, self.offset))
    }

    fn name_off(&self) -> usize {
        self.offset + 4
    }

    pub fn type_name(&self) -> &'a str {
        let off = self.name_off();
        let len = get_u16(self.data, off) as usize;
        std::str::from_utf8(get_bytes(self.data, off + 2, len)).unwrap_or("")
    }

    fn text_off(&self) -> usize {
        let off = self.name_off();
        off + 2 + get_u16(self.data, off) as usize
    }

    pub fn text(&self) -> &'a [u8] {
        let off = self.text_off();
        let len = get_u16(self.data, off) as usize;
        get_bytes(self.data, off + 2, len)
    }

    fn fields_off(&self) -> usize {
        let off = self.text_off();
        off + 2 + get_u16(self.data, off) as usize
    }

    pub fn num_fields(&self) -> u16 {
        get_u16(self.data, self.fields_off())
    }

    fn decl_table(&self) -> usize {
        self.fields_off() + 2
    }

    fn sorted_table(&self) -> usize {
        self.decl_table() + 4 * self.num_fields() as usize
    }

    pub fn field_at(&self, index: u16) -> Option<EventField<'a>> {
        if index >= self.num_fields() {
            return None;
        }
        let foff = get_u32(self.data, self.decl_table() + 4 * index as usize) as usize;
        if foff == 0 || foff >= self.data.len() {
            return None;
        }
        Some(EventField { data: self.data, offset: foff })
    }

    fn sorted_field_at(&self, index: u16) -> Option<EventField<'a>> {
        if index >= self.num_fields() {
            return None;
        }
        let foff = get_u32(self.data, self.sorted_table() + 4 * index as usize) as usize;
        if foff == 0 || foff >= self.data.len() {
            return None;
        }
        Some(EventField { data: self.data, offset: foff })
    }

    pub fn fields(&self) -> impl Iterator<Item = EventField<'a>> + '_ {
        let this = *self;
        (0..self.num_fields()).filter_map(move |i| this.field_at(i))
    }

    pub fn sorted_fields(&self) -> impl Iterator<Item = EventField<'a>> + '_ {
        let this = *self;
        (0..self.num_fields()).filter_map(move |i| this.sorted_field_at(i))
    }

    /// Finds a field by name through the sorted index.
    ///
    /// Raw audit records may carry duplicate field names; the first field in
    /// declaration order wins, which the stable sort in the builder
    /// guarantees is the leftmost match here.
    pub fn field_by_name(&self, name: &str) -> Option<EventField<'a>> {
        let num = self.num_fields();
        let mut lo = 0u16;
        let mut hi = num;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let field = self.sorted_field_at(mid)?;
            match field.name().as_bytes().cmp(name.as_bytes()) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        if lo < num {
            let field = self.sorted_field_at(lo)?;
            if field.name() == name {
                return Some(field);
            }
        }
        None
    }
}

impl fmt::Debug for EventRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("type", &self.record_type())
            .field("num_fields", &self.num_fields())
            .finish()
    }
}

/// A zero-copy view over one field of a record.
#[derive(Clone, Copy)]
pub struct EventField<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> EventField<'a> {
    pub fn kind(&self) -> FieldKind {
        FieldKind::from_u16(get_u16(self.data, self.offset))
    }

    fn name_off(&self) -> usize {
        self.offset + 2
    }

    pub fn name(&self) -> &'a str {
        let off = self.name_off();
        let len = get_u16(self.data, off) as usize;
        std::str::from_utf8(get_bytes(self.data, off + 2, len)).unwrap_or("")
    }

    fn raw_off(&self) -> usize {
        let off = self.name_off();
        off + 2 + get_u16(self.data, off) as usize
    }

    pub fn raw(&self) -> &'a [u8] {
        let off = self.raw_off();
        let len = get_u32(self.data, off) as usize;
        get_bytes(self.data, off + 4, len)
    }

    pub fn raw_str(&self) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.raw())
    }

    /// The byte range of the raw value within the event buffer.
    pub fn raw_span(&self) -> (u32, u32) {
        let off = self.raw_off();
        let len = get_u32(self.data, off);
        ((off + 4) as u32, len)
    }

    fn interp_off(&self) -> usize {
        let off = self.raw_off();
        off + 4 + get_u32(self.data, off) as usize
    }

    pub fn interp(&self) -> Option<&'a [u8]> {
        let off = self.interp_off();
        let len = get_u32(self.data, off);
        if len == NO_INTERP {
            None
        } else {
            Some(get_bytes(self.data, off + 4, len as usize))
        }
    }

    pub fn interp_str(&self) -> Option<std::borrow::Cow<'a, str>> {
        self.interp().map(String::from_utf8_lossy)
    }

    /// The value used for matching and dynamic aggregation: the interpreted
    /// value when present and non-empty, the raw value otherwise.
    pub fn value(&self) -> &'a [u8] {
        match self.interp() {
            Some(interp) if !interp.is_empty() => interp,
            _ => self.raw(),
        }
    }
}

impl fmt::Debug for EventField<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventField")
            .field("name", &self.name())
            .field("raw", &self.raw_str())
            .field("interp", &self.interp_str())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_ordering() {
        let a = EventId::new(10, 100, 5);
        let b = EventId::new(10, 100, 6);
        let c = EventId::new(10, 101, 0);
        let d = EventId::new(11, 0, 0);
        assert!(a < b && b < c && c < d);
        assert_eq!(a, EventId::new(10, 100, 5));
    }

    #[test]
    fn event_id_display_and_unset() {
        assert_eq!(EventId::new(1521757638, 392, 262332).to_string(), "1521757638.392:262332");
        assert!(EventId::default().is_unset());
        assert!(!EventId::new(0, 0, 1).is_unset());
    }

    #[test]
    fn validate_rejects_garbage() {
        let ev = Event::from_bytes(Bytes::from_static(b"short"));
        assert!(matches!(ev.validate(), Err(ValidateError::Truncated { .. })));
    }
}
