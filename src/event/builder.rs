//! Incremental construction of binary events.
//!
//! The builder writes records and fields straight into the output buffer,
//! patching the header and the per-record sorted field index as sections
//! close. Any failure (size cap, call-sequence violation) drops the
//! in-progress event atomically and leaves the builder ready for the next
//! one.

use bytes::{BufMut, BytesMut};
use snafu::Snafu;

use super::record_type::RecordType;
use super::{
    Event, FieldKind, EVENT_VERSION, HEADER_LEN, MAX_EVENT_BYTES, NO_INTERP, OFF_FLAGS,
    OFF_MSEC, OFF_NUM_RECORDS, OFF_PID, OFF_SEC, OFF_SERIAL, OFF_SIZE, OFF_VERSION,
};

/// Error raised by [`EventBuilder`] calls.
///
/// Every variant fails the current event; the builder itself stays usable.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum BuildError {
    /// The event would exceed the builder's size limit. The caller treats
    /// this as "drop the event".
    #[snafu(display("event would exceed the size limit of {limit} bytes"))]
    SizeExceeded { limit: usize },

    #[snafu(display("no event is being built"))]
    NoEvent,

    #[snafu(display("an event is already being built"))]
    EventOpen,

    #[snafu(display("no record is open"))]
    NoRecord,

    #[snafu(display("a record is still open"))]
    RecordOpen,

    #[snafu(display("event declared {declared} records but {built} were built"))]
    RecordCount { declared: u16, built: u16 },

    #[snafu(display("record declared {declared} fields but {added} were added"))]
    FieldCount { declared: u16, added: u16 },

    #[snafu(display("a record must declare at least one field"))]
    EmptyRecord,

    #[snafu(display("string of {len} bytes is too long for the field layout"))]
    StringTooLong { len: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    InEvent,
    InRecord,
}

/// Builds events into an internal buffer bounded by a size limit.
pub struct EventBuilder {
    max_size: usize,
    buf: BytesMut,
    state: State,
    num_records: u16,
    record_idx: u16,
    record_offset: usize,
    num_fields: u16,
    field_idx: u16,
    flags: u32,
    pid: i32,
}

impl EventBuilder {
    /// Creates a builder that fails events larger than `max_size` bytes
    /// (clamped to the format's 24-bit cap).
    pub fn new(max_size: usize) -> EventBuilder {
        EventBuilder {
            max_size: max_size.min(MAX_EVENT_BYTES),
            buf: BytesMut::new(),
            state: State::Idle,
            num_records: 0,
            record_idx: 0,
            record_offset: 0,
            num_fields: 0,
            field_idx: 0,
            flags: 0,
            pid: -1,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Idle;
        self.num_records = 0;
        self.record_idx = 0;
        self.record_offset = 0;
        self.num_fields = 0;
        self.field_idx = 0;
        self.flags = 0;
        self.pid = -1;
    }

    fn fail<T>(&mut self, err: BuildError) -> Result<T, BuildError> {
        self.reset();
        Err(err)
    }

    fn ensure(&mut self, additional: usize) -> Result<(), BuildError> {
        if self.buf.len() + additional > self.max_size {
            let limit = self.max_size;
            self.reset();
            return Err(BuildError::SizeExceeded { limit });
        }
        Ok(())
    }

    fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn begin_event(
        &mut self,
        sec: u64,
        msec: u32,
        serial: u64,
        num_records: u16,
    ) -> Result<(), BuildError> {
        if self.state != State::Idle {
            return self.fail(BuildError::EventOpen);
        }
        self.ensure(HEADER_LEN + 4 * num_records as usize)?;

        self.buf.put_u32_le(0); // size, patched in end_event
        self.buf.put_u8(EVENT_VERSION);
        self.buf.put_u32_le(0); // flags, patched in end_event
        self.buf.put_i32_le(-1); // pid, patched in end_event
        self.buf.put_u64_le(sec);
        self.buf.put_u32_le(msec);
        self.buf.put_u64_le(serial);
        self.buf.put_u16_le(num_records);
        self.buf.put_bytes(0, 4 * num_records as usize);

        debug_assert_eq!(self.buf.len(), HEADER_LEN + 4 * num_records as usize);
        debug_assert_eq!(OFF_SIZE, 0);
        debug_assert_eq!(OFF_VERSION, 4);
        debug_assert_eq!(OFF_SEC, OFF_PID + 4);
        debug_assert_eq!(OFF_SERIAL, OFF_MSEC + 4);

        self.state = State::InEvent;
        self.num_records = num_records;
        self.record_idx = 0;
        self.flags = 0;
        self.pid = -1;
        Ok(())
    }

    pub fn set_event_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn event_flags(&self) -> u32 {
        self.flags
    }

    pub fn set_event_pid(&mut self, pid: i32) {
        self.pid = pid;
    }

    pub fn begin_record(
        &mut self,
        record_type: RecordType,
        type_name: &str,
        text: &[u8],
        num_fields: u16,
    ) -> Result<(), BuildError> {
        if self.state != State::InEvent {
            let err = if self.state == State::Idle {
                BuildError::NoEvent
            } else {
                BuildError::RecordOpen
            };
            return self.fail(err);
        }
        if self.record_idx >= self.num_records {
            let declared = self.num_records;
            return self.fail(BuildError::RecordCount { declared, built: declared + 1 });
        }
        if num_fields == 0 && record_type != RecordType::EOE {
            return self.fail(BuildError::EmptyRecord);
        }
        if type_name.len() > u16::MAX as usize || text.len() > u16::MAX as usize {
            let len = type_name.len().max(text.len());
            return self.fail(BuildError::StringTooLong { len });
        }

        let needed = 4 + 2 + type_name.len() + 2 + text.len() + 2 + 8 * num_fields as usize;
        self.ensure(needed)?;

        let offset = self.buf.len();
        self.buf.put_u32_le(record_type.0);
        self.buf.put_u16_le(type_name.len() as u16);
        self.buf.put_slice(type_name.as_bytes());
        self.buf.put_u16_le(text.len() as u16);
        self.buf.put_slice(text);
        self.buf.put_u16_le(num_fields);
        self.buf.put_bytes(0, 8 * num_fields as usize);

        let slot = HEADER_LEN + 4 * self.record_idx as usize;
        self.patch_u32(slot, offset as u32);

        self.state = State::InRecord;
        self.record_offset = offset;
        self.num_fields = num_fields;
        self.field_idx = 0;
        Ok(())
    }

    pub fn add_field(
        &mut self,
        name: &str,
        raw: &[u8],
        interp: Option<&[u8]>,
        kind: FieldKind,
    ) -> Result<(), BuildError> {
        if self.state != State::InRecord {
            return self.fail(BuildError::NoRecord);
        }
        if self.field_idx >= self.num_fields {
            let declared = self.num_fields;
            return self.fail(BuildError::FieldCount { declared, added: declared + 1 });
        }
        if name.len() > u16::MAX as usize {
            return self.fail(BuildError::StringTooLong { len: name.len() });
        }

        let interp_len = interp.map_or(0, <[u8]>::len);
        let needed = 2 + 2 + name.len() + 4 + raw.len() + 4 + interp_len;
        self.ensure(needed)?;

        let offset = self.buf.len();
        self.buf.put_u16_le(kind as u16);
        self.buf.put_u16_le(name.len() as u16);
        self.buf.put_slice(name.as_bytes());
        self.buf.put_u32_le(raw.len() as u32);
        self.buf.put_slice(raw);
        match interp {
            Some(interp) => {
                self.buf.put_u32_le(interp.len() as u32);
                self.buf.put_slice(interp);
            }
            None => self.buf.put_u32_le(NO_INTERP),
        }

        // Record the field offset in the declaration-order index. The
        // sorted index is filled in by end_record.
        let decl_table = self.record_fields_table();
        self.patch_u32(decl_table + 4 * self.field_idx as usize, offset as u32);
        self.field_idx += 1;
        Ok(())
    }

    fn record_fields_table(&self) -> usize {
        // Skip type code, name and text to reach the index tables.
        let mut off = self.record_offset + 4;
        let name_len = u16::from_le_bytes([self.buf[off], self.buf[off + 1]]) as usize;
        off += 2 + name_len;
        let text_len = u16::from_le_bytes([self.buf[off], self.buf[off + 1]]) as usize;
        off += 2 + text_len;
        off + 2
    }

    fn field_name_at(&self, field_offset: usize) -> &[u8] {
        let off = field_offset + 2;
        let len = u16::from_le_bytes([self.buf[off], self.buf[off + 1]]) as usize;
        &self.buf[off + 2..off + 2 + len]
    }

    pub fn end_record(&mut self) -> Result<(), BuildError> {
        if self.state != State::InRecord {
            return self.fail(BuildError::NoRecord);
        }
        if self.field_idx != self.num_fields {
            let (declared, added) = (self.num_fields, self.field_idx);
            return self.fail(BuildError::FieldCount { declared, added });
        }

        let decl_table = self.record_fields_table();
        let num = self.num_fields as usize;
        let mut offsets: Vec<u32> = (0..num)
            .map(|i| {
                let off = decl_table + 4 * i;
                u32::from_le_bytes([
                    self.buf[off],
                    self.buf[off + 1],
                    self.buf[off + 2],
                    self.buf[off + 3],
                ])
            })
            .collect();
        // Stable sort keeps declaration order among duplicate names, which
        // is what makes field_by_name return the first declared duplicate.
        offsets.sort_by(|a, b| {
            self.field_name_at(*a as usize)
                .cmp(self.field_name_at(*b as usize))
        });
        let sorted_table = decl_table + 4 * num;
        for (i, off) in offsets.into_iter().enumerate() {
            self.patch_u32(sorted_table + 4 * i, off);
        }

        self.state = State::InEvent;
        self.record_idx += 1;
        Ok(())
    }

    /// Commits the event, producing the immutable buffer.
    pub fn end_event(&mut self) -> Result<Event, BuildError> {
        if self.state != State::InEvent {
            let err = if self.state == State::Idle {
                BuildError::NoEvent
            } else {
                BuildError::RecordOpen
            };
            return self.fail(err);
        }
        if self.record_idx != self.num_records {
            let (declared, built) = (self.num_records, self.record_idx);
            return self.fail(BuildError::RecordCount { declared, built });
        }

        let size = self.buf.len();
        self.patch_u32(OFF_SIZE, size as u32);
        self.patch_u32(OFF_FLAGS, self.flags);
        self.patch_u32(OFF_PID, self.pid as u32);
        debug_assert_eq!(OFF_NUM_RECORDS + 2, HEADER_LEN);

        let data = self.buf.split().freeze();
        self.reset();
        Ok(Event::from_bytes(data))
    }

    /// Drops the in-progress event, if any.
    pub fn cancel_event(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_FLAG_SYNTHESIZED;

    fn build_simple() -> Event {
        let mut b = EventBuilder::new(64 * 1024);
        b.begin_event(100, 5, 42, 2).unwrap();
        b.set_event_flags(EVENT_FLAG_SYNTHESIZED);
        b.set_event_pid(1234);

        b.begin_record(RecordType::SYSCALL, "SYSCALL", b"raw text", 3).unwrap();
        b.add_field("syscall", b"59", Some(b"execve"), FieldKind::Syscall).unwrap();
        b.add_field("uid", b"0", Some(b"root"), FieldKind::Uid).unwrap();
        b.add_field("exit", b"0", None, FieldKind::Exit).unwrap();
        b.end_record().unwrap();

        b.begin_record(RecordType::CWD, "CWD", b"", 1).unwrap();
        b.add_field("cwd", b"\"/\"", None, FieldKind::Escaped).unwrap();
        b.end_record().unwrap();

        b.end_event().unwrap()
    }

    #[test]
    fn build_and_read_back() {
        let event = build_simple();
        event.validate().unwrap();

        assert_eq!(event.id(), crate::event::EventId::new(100, 5, 42));
        assert_eq!(event.flags(), EVENT_FLAG_SYNTHESIZED);
        assert_eq!(event.pid(), 1234);
        assert_eq!(event.num_records(), 2);
        assert_eq!(event.size(), event.as_bytes().len());

        let rec = event.record_at(0).unwrap();
        assert_eq!(rec.record_type(), RecordType::SYSCALL);
        assert_eq!(rec.type_name(), "SYSCALL");
        assert_eq!(rec.text(), b"raw text");
        assert_eq!(rec.num_fields(), 3);

        let syscall = rec.field_by_name("syscall").unwrap();
        assert_eq!(syscall.raw(), b"59");
        assert_eq!(syscall.interp(), Some(&b"execve"[..]));
        assert_eq!(syscall.kind(), FieldKind::Syscall);
        assert_eq!(syscall.value(), b"execve");

        let exit = rec.field_by_name("exit").unwrap();
        assert_eq!(exit.interp(), None);
        assert_eq!(exit.value(), b"0");

        assert!(rec.field_by_name("nope").is_none());

        let cwd = event.record_at(1).unwrap();
        assert_eq!(cwd.record_type(), RecordType::CWD);
        assert_eq!(cwd.field_at(0).unwrap().raw(), b"\"/\"");
    }

    #[test]
    fn sorted_iteration_and_duplicates() {
        let mut b = EventBuilder::new(4096);
        b.begin_event(1, 0, 1, 1).unwrap();
        b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 4).unwrap();
        b.add_field("zeta", b"z", None, FieldKind::Unclassified).unwrap();
        b.add_field("dup", b"first", None, FieldKind::Unclassified).unwrap();
        b.add_field("alpha", b"a", None, FieldKind::Unclassified).unwrap();
        b.add_field("dup", b"second", None, FieldKind::Unclassified).unwrap();
        b.end_record().unwrap();
        let event = b.end_event().unwrap();
        event.validate().unwrap();

        let rec = event.record_at(0).unwrap();
        let sorted: Vec<_> = rec.sorted_fields().map(|f| f.name().to_string()).collect();
        assert_eq!(sorted, vec!["alpha", "dup", "dup", "zeta"]);

        // Declaration order wins among duplicates.
        assert_eq!(rec.field_by_name("dup").unwrap().raw(), b"first");
        // Declaration order itself is preserved.
        let decl: Vec<_> = rec.fields().map(|f| f.name().to_string()).collect();
        assert_eq!(decl, vec!["zeta", "dup", "alpha", "dup"]);
    }

    #[test]
    fn size_limit_fails_event_atomically() {
        let mut b = EventBuilder::new(128);
        b.begin_event(1, 0, 1, 1).unwrap();
        b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 1).unwrap();
        let big = vec![b'x'; 4096];
        assert!(matches!(
            b.add_field("data", &big, None, FieldKind::Unclassified),
            Err(BuildError::SizeExceeded { .. })
        ));

        // The builder is usable again immediately.
        b.begin_event(2, 0, 2, 1).unwrap();
        b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 1).unwrap();
        b.add_field("ok", b"1", None, FieldKind::Unclassified).unwrap();
        b.end_record().unwrap();
        let event = b.end_event().unwrap();
        assert_eq!(event.serial(), 2);
    }

    #[test]
    fn sequence_violations() {
        let mut b = EventBuilder::new(4096);
        assert_eq!(b.end_event().unwrap_err(), BuildError::NoEvent);

        b.begin_event(1, 0, 1, 1).unwrap();
        assert_eq!(b.end_record().unwrap_err(), BuildError::NoRecord);

        b.begin_event(1, 0, 1, 1).unwrap();
        b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 2).unwrap();
        b.add_field("one", b"1", None, FieldKind::Unclassified).unwrap();
        // Closing the record before the declared field count fails it.
        assert!(matches!(b.end_record(), Err(BuildError::FieldCount { declared: 2, added: 1 })));

        // end_event with a still-open record fails.
        b.begin_event(1, 0, 1, 1).unwrap();
        b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 1).unwrap();
        assert_eq!(b.end_event().unwrap_err(), BuildError::RecordOpen);
    }

    #[test]
    fn zero_field_record_rejected() {
        let mut b = EventBuilder::new(4096);
        b.begin_event(1, 0, 1, 1).unwrap();
        assert_eq!(
            b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 0).unwrap_err(),
            BuildError::EmptyRecord
        );
    }

    #[test]
    fn cancel_then_reuse() {
        let mut b = EventBuilder::new(4096);
        b.begin_event(1, 0, 1, 5).unwrap();
        b.cancel_event();
        let event = {
            b.begin_event(3, 0, 3, 1).unwrap();
            b.begin_record(RecordType::USER_CMD, "USER_CMD", b"", 1).unwrap();
            b.add_field("k", b"v", None, FieldKind::Unclassified).unwrap();
            b.end_record().unwrap();
            b.end_event().unwrap()
        };
        assert_eq!(event.serial(), 3);
        assert_eq!(event.num_records(), 1);
    }
}
