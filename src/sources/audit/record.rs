//! Parsing of one textual audit record line.
//!
//! Record lines come in three prefixes, depending on whether they arrive
//! from the dispatcher or straight from the kernel:
//!
//! ```text
//! node=<h> type=<t> msg=audit(<sec>.<msec>:<serial>): k1=v1 k2=v2 ...
//! type=<t> msg=audit(<sec>.<msec>:<serial>): k1=v1 k2=v2 ...
//! audit(<sec>.<msec>:<serial>): k1=v1 k2=v2 ...
//! ```
//!
//! For certain record types the key/value data is wrapped in a
//! `msg='...'` envelope, which the tokenizer unwraps in place.

use std::ops::Range;

use snafu::Snafu;

use crate::event::record_type::RecordType;
use crate::event::{BuildError, EventBuilder, EventId, FieldKind};

/// The kernel's MAX_AUDIT_MESSAGE_LENGTH is 8970; lines are capped a little
/// above it.
pub const MAX_RECORD_SIZE: usize = 9 * 1024;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum RecordParseError {
    #[snafu(display("record line is empty"))]
    Empty,
    #[snafu(display("record line has no audit(...) event id"))]
    MissingEventId,
    #[snafu(display("record line has a malformed audit(...) event id"))]
    BadEventId,
    #[snafu(display("record line of {len} bytes exceeds the {MAX_RECORD_SIZE} byte cap"))]
    TooLong { len: usize },
}

/// One parsed audit record line, transient until folded into an event.
#[derive(Debug)]
pub struct RawRecord {
    line: Box<[u8]>,
    record_type: RecordType,
    type_name: Option<String>,
    node: Option<Range<usize>>,
    event_id: EventId,
    fields: Vec<(Range<usize>, Range<usize>)>,
}

struct Tokenizer<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(line: &'a [u8]) -> Self {
        Tokenizer { line, pos: 0 }
    }

    fn next(&mut self) -> Option<Range<usize>> {
        while self.pos < self.line.len()
            && matches!(self.line[self.pos], b' ' | b'\n' | b'\r' | 0)
        {
            self.pos += 1;
        }
        if self.pos >= self.line.len() {
            return None;
        }
        let start = self.pos;
        while self.pos < self.line.len()
            && !matches!(self.line[self.pos], b' ' | b'\n' | b'\r' | 0)
        {
            self.pos += 1;
        }
        let mut range = start..self.pos;

        // Some record types wrap their payload in msg='...'; unwrap the
        // envelope and tokenize its contents.
        if self.line[range.clone()].starts_with(b"msg='") {
            self.pos = start + 5;
            return self.next();
        }
        if self.line[range.end - 1] == b'\'' && range.len() > 1 {
            range.end -= 1;
        }
        Some(range)
    }
}

fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 19 {
        return None;
    }
    let mut val: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        val = val * 10 + (b - b'0') as u64;
    }
    Some(val)
}

impl RawRecord {
    /// Parses one record line. `hint` is the record type carried out of
    /// band (the netlink message type); `RecordType::UNKNOWN` when the line
    /// is expected to carry its own `type=` token.
    pub fn parse(hint: RecordType, line: &[u8]) -> Result<RawRecord, RecordParseError> {
        if line.len() > MAX_RECORD_SIZE {
            return Err(RecordParseError::TooLong { len: line.len() });
        }
        let line: Box<[u8]> = line.into();
        let mut tok = Tokenizer::new(&line);

        let mut token = tok.next().ok_or(RecordParseError::Empty)?;

        let mut node = None;
        if line[token.clone()].starts_with(b"node=") {
            node = Some(token.start + 5..token.end);
            token = tok.next().ok_or(RecordParseError::MissingEventId)?;
        }

        let mut record_type = hint;
        let mut type_name = None;
        if line[token.clone()].starts_with(b"type=") {
            let name = String::from_utf8_lossy(&line[token.start + 5..token.end]).into_owned();
            if record_type == RecordType::UNKNOWN {
                record_type = RecordType::from_name(&name).unwrap_or(RecordType::UNKNOWN);
            }
            type_name = Some(name);
            token = tok.next().ok_or(RecordParseError::MissingEventId)?;
        }
        if type_name.is_none() && record_type != RecordType::UNKNOWN {
            type_name = record_type.name().map(str::to_owned);
        }

        let mut id_tok = &line[token.clone()];
        if let Some(stripped) = id_tok.strip_prefix(b"msg=") {
            id_tok = stripped;
        }
        let id_body = id_tok
            .strip_prefix(b"audit(")
            .and_then(|rest| rest.strip_suffix(b"):"))
            .ok_or(RecordParseError::MissingEventId)?;

        let dot = id_body
            .iter()
            .position(|&b| b == b'.')
            .ok_or(RecordParseError::BadEventId)?;
        let colon = id_body[dot..]
            .iter()
            .position(|&b| b == b':')
            .map(|i| i + dot)
            .ok_or(RecordParseError::BadEventId)?;

        let sec = parse_decimal(&id_body[..dot]).ok_or(RecordParseError::BadEventId)?;
        let msec_end = (dot + 4).min(colon);
        let msec = parse_decimal(&id_body[dot + 1..msec_end]).ok_or(RecordParseError::BadEventId)?;
        let serial = parse_decimal(&id_body[colon + 1..]).ok_or(RecordParseError::BadEventId)?;
        let event_id = EventId::new(sec, msec as u32, serial);

        let mut fields = Vec::with_capacity(16);
        while let Some(range) = tok.next() {
            let token = &line[range.clone()];
            match token.iter().position(|&b| b == b'=') {
                Some(eq) => {
                    fields.push((range.start..range.start + eq, range.start + eq + 1..range.end))
                }
                None => fields.push((range.clone(), range.end..range.end)),
            }
        }

        Ok(RawRecord { line, record_type, type_name, node, event_id, fields })
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn type_name(&self) -> &str {
        match &self.type_name {
            Some(name) => name,
            None => "",
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn node(&self) -> Option<&[u8]> {
        self.node.clone().map(|r| &self.line[r])
    }

    /// The size this record accounts for against the event caps.
    pub fn size(&self) -> usize {
        self.line.len()
    }

    /// A record with no key/value payload at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.fields
            .iter()
            .map(|(k, v)| (&self.line[k.clone()], &self.line[v.clone()]))
    }

    /// Appends this record, fields untyped and uninterpreted, to an event
    /// under construction.
    pub fn append_to(&self, builder: &mut EventBuilder) -> Result<(), BuildError> {
        let mut num_fields = self.fields.len() as u16;
        if self.node.is_some() {
            num_fields += 1;
        }

        let type_name = match &self.type_name {
            Some(name) => name.clone(),
            None => self.record_type.to_string(),
        };
        builder.begin_record(self.record_type, &type_name, &self.line, num_fields)?;
        if let Some(node) = self.node() {
            builder.add_field("node", node, None, FieldKind::Unclassified)?;
        }
        for (key, value) in self.fields() {
            let key = String::from_utf8_lossy(key);
            builder.add_field(&key, value, None, FieldKind::Unclassified)?;
        }
        builder.end_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dispatcher_line() {
        let line = b"type=SYSCALL msg=audit(1521757638.392:262332): arch=c000003e syscall=59 success=yes exit=0";
        let rec = RawRecord::parse(RecordType::UNKNOWN, line).unwrap();
        assert_eq!(rec.record_type(), RecordType::SYSCALL);
        assert_eq!(rec.type_name(), "SYSCALL");
        assert_eq!(rec.event_id(), EventId::new(1521757638, 392, 262332));
        assert!(rec.node().is_none());

        let fields: Vec<_> = rec
            .fields()
            .map(|(k, v)| {
                (String::from_utf8_lossy(k).into_owned(), String::from_utf8_lossy(v).into_owned())
            })
            .collect();
        assert_eq!(
            fields,
            vec![
                ("arch".into(), "c000003e".into()),
                ("syscall".into(), "59".into()),
                ("success".into(), "yes".into()),
                ("exit".into(), "0".into()),
            ]
        );
    }

    #[test]
    fn parse_node_prefix() {
        let line = b"node=host1 type=LOGIN msg=audit(2.003:4): pid=100 uid=0";
        let rec = RawRecord::parse(RecordType::UNKNOWN, line).unwrap();
        assert_eq!(rec.node(), Some(&b"host1"[..]));
        assert_eq!(rec.record_type(), RecordType::LOGIN);
        assert_eq!(rec.event_id(), EventId::new(2, 3, 4));
    }

    #[test]
    fn parse_kernel_line_with_hint() {
        let line = b"audit(100.001:7): cwd=\"/tmp\"";
        let rec = RawRecord::parse(RecordType::CWD, line).unwrap();
        assert_eq!(rec.record_type(), RecordType::CWD);
        assert_eq!(rec.type_name(), "CWD");
        let (k, v) = rec.fields().next().unwrap();
        assert_eq!(k, b"cwd");
        assert_eq!(v, b"\"/tmp\"");
    }

    #[test]
    fn parse_msg_envelope() {
        let line = b"type=USER_LOGIN msg=audit(5.000:9): pid=321 uid=0 msg='op=login acct=\"root\" res=success'";
        let rec = RawRecord::parse(RecordType::UNKNOWN, line).unwrap();
        let keys: Vec<_> = rec.fields().map(|(k, _)| String::from_utf8_lossy(k).into_owned()).collect();
        assert_eq!(keys, vec!["pid", "uid", "op", "acct", "res"]);
        let res = rec.fields().last().unwrap();
        // The trailing quote of the envelope is stripped.
        assert_eq!(res.1, b"success");
    }

    #[test]
    fn parse_eoe() {
        let line = b"type=EOE msg=audit(1.000:2): ";
        let rec = RawRecord::parse(RecordType::UNKNOWN, line).unwrap();
        assert_eq!(rec.record_type(), RecordType::EOE);
        assert!(rec.is_empty());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(
            RawRecord::parse(RecordType::UNKNOWN, b"").unwrap_err(),
            RecordParseError::Empty
        );
        assert_eq!(
            RawRecord::parse(RecordType::UNKNOWN, b"type=SYSCALL no-id-here").unwrap_err(),
            RecordParseError::MissingEventId
        );
        assert_eq!(
            RawRecord::parse(RecordType::UNKNOWN, b"type=SYSCALL msg=audit(xx.392:1): a=b")
                .unwrap_err(),
            RecordParseError::BadEventId
        );
    }

    #[test]
    fn append_to_builder() {
        let line = b"node=n1 type=LOGIN msg=audit(2.003:4): pid=100 auid=1000";
        let rec = RawRecord::parse(RecordType::UNKNOWN, line).unwrap();

        let mut builder = EventBuilder::new(64 * 1024);
        builder.begin_event(2, 3, 4, 1).unwrap();
        rec.append_to(&mut builder).unwrap();
        let event = builder.end_event().unwrap();
        event.validate().unwrap();

        let record = event.record_at(0).unwrap();
        assert_eq!(record.record_type(), RecordType::LOGIN);
        assert_eq!(record.num_fields(), 3);
        assert_eq!(record.field_by_name("node").unwrap().raw(), b"n1");
        assert_eq!(record.field_by_name("pid").unwrap().raw(), b"100");
        assert_eq!(record.field_by_name("auid").unwrap().raw(), b"1000");
        assert_eq!(record.text(), &line[..]);
    }
}
