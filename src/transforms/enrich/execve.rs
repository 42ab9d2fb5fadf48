//! Reconstruction of a command line from EXECVE records.
//!
//! The kernel splits long argvs across multiple EXECVE records, and splits
//! long single args into `aN_len=<len>` plus `aN[<idx>]=<piece>` runs. The
//! audit stream is lossy, so any of those pieces can be missing: gaps
//! between whole args render as `<N...M>`, and missing pieces of a split
//! arg render as `<...>`.

use crate::event::EventRecord;
use crate::strings::{bash_escape_append, unescape_raw_field};

/// How one EXECVE field participates in the argv.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgPart {
    /// `aN=<value>`: one whole argument.
    Whole { num: u32 },
    /// `aN_len=<len>`: announces a split argument's total raw length.
    Len { num: u32, len: u32 },
    /// `aN[<idx>]=<piece>`: one piece of a split argument.
    Piece { num: u32, idx: u32 },
}

fn parse_u32_prefix(bytes: &[u8]) -> Option<(u32, usize)> {
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || digits > 9 {
        return None;
    }
    let mut val = 0u32;
    for &b in &bytes[..digits] {
        val = val * 10 + (b - b'0') as u32;
    }
    Some((val, digits))
}

/// Parses one EXECVE field name (`aN`, `aN_len`, `aN[idx]`); anything else
/// (including `argc`) is `None`.
pub fn parse_arg_field(name: &str, value: &[u8]) -> Option<ArgPart> {
    let bytes = name.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'a' || !bytes[1].is_ascii_digit() {
        return None;
    }
    let (num, digits) = parse_u32_prefix(&bytes[1..])?;
    let rest = &bytes[1 + digits..];
    if rest.is_empty() {
        return Some(ArgPart::Whole { num });
    }
    if rest == b"_len" {
        let (len, used) = parse_u32_prefix(value)?;
        if used == value.len() {
            return Some(ArgPart::Len { num, len });
        }
        return None;
    }
    if rest.first() == Some(&b'[') && rest.last() == Some(&b']') {
        let (idx, used) = parse_u32_prefix(&rest[1..])?;
        if 1 + used + 1 == rest.len() {
            return Some(ArgPart::Piece { num, idx });
        }
    }
    None
}

/// The ordinal of the first argument a record carries, used to order
/// EXECVE records by `aN` ascending.
pub fn record_first_arg(record: &EventRecord<'_>) -> u32 {
    record
        .fields()
        .find_map(|f| match parse_arg_field(f.name(), f.raw()) {
            Some(ArgPart::Whole { num })
            | Some(ArgPart::Len { num, .. })
            | Some(ArgPart::Piece { num, .. }) => Some(num),
            None => None,
        })
        .unwrap_or(0)
}

const MISSING_PIECE: &str = "<...>";

/// Rebuilds the bash-escaped command line from EXECVE records.
///
/// Records must already be sorted ascending by their first `aN`.
#[derive(Default)]
pub struct ExecveConverter {
    pieces: Vec<u8>,
    unescaped: Vec<u8>,
}

impl ExecveConverter {
    fn flush_pieces(&mut self, cmdline: &mut String) {
        if !self.pieces.is_empty() {
            unescape_raw_field(&mut self.unescaped, &self.pieces);
            bash_escape_append(cmdline, &self.unescaped);
        }
    }

    pub fn convert(&mut self, records: &[EventRecord<'_>], cmdline: &mut String) {
        cmdline.clear();
        self.pieces.clear();
        self.unescaped.clear();

        // next_arg is the argument number we expect to see next; a split
        // argument is "open" while expected_len > 0.
        let mut next_arg = 0u32;
        let mut expected_len = 0u32;
        let mut accumulated = 0u32;
        let mut next_idx = 0u32;

        for record in records {
            for field in record.fields() {
                let Some(part) = parse_arg_field(field.name(), field.raw()) else {
                    continue;
                };
                let arg_num = match part {
                    ArgPart::Whole { num }
                    | ArgPart::Len { num, .. }
                    | ArgPart::Piece { num, .. } => num,
                };

                // A later argument arrived while a split argument was still
                // open: close out what we have.
                if next_arg < arg_num && expected_len > 0 {
                    if accumulated > 0 {
                        self.flush_pieces(cmdline);
                        if expected_len > accumulated {
                            cmdline.push_str(MISSING_PIECE);
                        }
                        next_arg += 1;
                    }
                    expected_len = 0;
                    accumulated = 0;
                    next_idx = 0;
                    self.pieces.clear();
                    self.unescaped.clear();
                }

                // Whole arguments went missing: placeholder for the range.
                if next_arg < arg_num {
                    if !cmdline.is_empty() {
                        cmdline.push(' ');
                    }
                    cmdline.push('<');
                    cmdline.push_str(&next_arg.to_string());
                    cmdline.push_str("...");
                    cmdline.push_str(&(arg_num - 1).to_string());
                    cmdline.push('>');
                    next_arg = arg_num;
                }

                match part {
                    ArgPart::Whole { .. } => {
                        // The previous argument's pieces never completed.
                        if expected_len > 0 {
                            self.flush_pieces(cmdline);
                            cmdline.push_str(MISSING_PIECE);
                            expected_len = 0;
                            accumulated = 0;
                            next_idx = 0;
                            self.pieces.clear();
                        }
                        self.unescaped.clear();
                        if !cmdline.is_empty() {
                            cmdline.push(' ');
                        }
                        unescape_raw_field(&mut self.unescaped, field.raw());
                        bash_escape_append(cmdline, &self.unescaped);
                        next_arg += 1;
                    }
                    ArgPart::Len { len, .. } => {
                        expected_len = len;
                        accumulated = 0;
                        next_idx = 0;
                        self.pieces.clear();
                        self.unescaped.clear();
                    }
                    ArgPart::Piece { idx, .. } => {
                        if expected_len == 0 {
                            // No aN_len seen for this argument; pieces
                            // cannot be sized, skip them.
                            continue;
                        }
                        if next_idx == 0 && !cmdline.is_empty() {
                            cmdline.push(' ');
                        }
                        if next_idx < idx {
                            // A gap in the pieces.
                            self.flush_pieces(cmdline);
                            cmdline.push_str(MISSING_PIECE);
                            self.pieces.clear();
                            self.unescaped.clear();
                            next_idx = idx;
                        }
                        self.pieces.extend_from_slice(field.raw());
                        accumulated += field.raw().len() as u32;
                        next_idx += 1;
                        if expected_len <= accumulated {
                            self.flush_pieces(cmdline);
                            expected_len = 0;
                            accumulated = 0;
                            next_idx = 0;
                            self.pieces.clear();
                            self.unescaped.clear();
                            next_arg += 1;
                        }
                    }
                }
            }
        }

        // The last argument may still be an open split.
        if expected_len > 0 {
            self.flush_pieces(cmdline);
            if expected_len > accumulated {
                cmdline.push_str(MISSING_PIECE);
            }
        }
    }
}

/// Renders a NUL-delimited argv (e.g. a decoded proctitle or a
/// `/proc/<pid>/cmdline` image) as a bash-escaped command line.
pub fn convert_raw_cmdline(raw: &[u8], out: &mut String) {
    out.clear();
    let mut rest = raw;
    while !rest.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        let used = bash_escape_append(out, rest);
        rest = &rest[used..];
        while rest.first() == Some(&0) {
            rest = &rest[1..];
        }
    }
}
