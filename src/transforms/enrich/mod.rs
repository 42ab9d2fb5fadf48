//! Event enrichment: syscall/execve consolidation and field interpretation.
//!
//! Multi-record syscall events are rewritten into one synthesized record
//! carrying every field of interest (PATH fields folded into JSON arrays,
//! the execve argv folded into one `cmdline`), and every field whose kind
//! is interpretable gets a human-readable sidecar value. Original raw
//! values are always preserved.

pub mod execve;
pub mod interpret;
pub mod inventory;

use std::sync::Arc;

use tracing::warn;

use crate::event::field_kind::field_kind_for;
use crate::event::record_type::RecordType;
use crate::event::{
    BuildError, Event, EventBuilder, EventField, EventRecord, EVENT_FLAG_SYNTHESIZED,
};
use crate::sources::audit::accumulator::MAX_EVENT_SIZE;

use execve::{record_first_arg, ExecveConverter};
use interpret::{interpret_field, UserDb};

#[derive(Clone, Debug)]
pub struct EnrichConfig {
    /// Replacement for NUL bytes inside decoded escaped values.
    pub null_placeholder: String,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        EnrichConfig { null_placeholder: " ".into() }
    }
}

pub struct Enricher {
    builder: EventBuilder,
    user_db: Arc<dyn UserDb>,
    converter: ExecveConverter,
    null_placeholder: String,
}

impl Enricher {
    pub fn new(config: EnrichConfig, user_db: Arc<dyn UserDb>) -> Enricher {
        Enricher {
            builder: EventBuilder::new(MAX_EVENT_SIZE + 16 * 1024),
            user_db,
            converter: ExecveConverter::default(),
            null_placeholder: config.null_placeholder,
        }
    }

    /// Enriches one assembled event, pushing the result into `out`. Events
    /// the enricher cannot rebuild are dropped with a warning; the stream
    /// continues.
    pub fn process(&mut self, event: &Event, out: &mut Vec<Event>) {
        let Some(first) = event.record_at(0) else {
            return;
        };
        let consolidate = matches!(
            first.record_type(),
            RecordType::SYSCALL
                | RecordType::EXECVE
                | RecordType::CWD
                | RecordType::PATH
                | RecordType::SOCKADDR
        );

        let result = if consolidate {
            self.consolidate_syscall_event(event)
        } else {
            self.rebuild_event(event)
        };

        match result {
            Ok(enriched) => out.push(enriched),
            Err(error) => {
                warn!(id = %event.id(), %error, "Dropping event the enricher could not rebuild.");
            }
        }
    }

    fn add_field(
        &mut self,
        record: &EventRecord<'_>,
        field: &EventField<'_>,
        prefix: Option<&str>,
    ) -> Result<(), BuildError> {
        let kind = field_kind_for(record.record_type(), field.name(), field.raw());
        let interp = interpret_field(
            self.user_db.as_ref(),
            record,
            field,
            kind,
            &self.null_placeholder,
        );
        let name = match prefix {
            Some(prefix) => format!("{prefix}_{}", field.name()),
            None => field.name().to_string(),
        };
        self.builder
            .add_field(&name, field.raw(), interp.as_deref().map(str::as_bytes), kind)
    }

    /// Rebuilds an event record for record, attaching interpretations and
    /// leaving the structure alone.
    fn rebuild_event(&mut self, event: &Event) -> Result<Event, BuildError> {
        self.builder
            .begin_event(event.seconds(), event.milliseconds(), event.serial(), event.num_records())?;
        self.builder.set_event_flags(event.flags());

        for record in event.records() {
            self.builder.begin_record(
                record.record_type(),
                record.type_name(),
                record.text(),
                record.num_fields(),
            )?;
            if let Some(pid_field) = record.field_by_name("pid") {
                if let Ok(pid) = pid_field.raw_str().trim().parse() {
                    self.builder.set_event_pid(pid);
                }
            }
            for field in record.fields() {
                self.add_field(&record, &field, None)?;
            }
            self.builder.end_record()?;
        }

        self.builder.end_event()
    }

    fn consolidate_syscall_event(&mut self, event: &Event) -> Result<Event, BuildError> {
        let mut syscall_rec: Option<EventRecord<'_>> = None;
        let mut cwd_rec: Option<EventRecord<'_>> = None;
        let mut sockaddr_rec: Option<EventRecord<'_>> = None;
        let mut dropped_rec: Option<EventRecord<'_>> = None;
        let mut argc_rec: Option<EventRecord<'_>> = None;
        let mut path_recs: Vec<EventRecord<'_>> = Vec::new();
        let mut execve_recs: Vec<EventRecord<'_>> = Vec::new();
        let mut other_recs: Vec<EventRecord<'_>> = Vec::new();

        let mut num_fields: u16 = 0;

        for record in event.records() {
            match record.record_type() {
                RecordType::SYSCALL => {
                    if syscall_rec.is_some() {
                        continue;
                    }
                    for field in record.fields() {
                        if !is_excluded_syscall_field(field.name()) {
                            num_fields += 1;
                        }
                    }
                    syscall_rec = Some(record);
                }
                RecordType::EXECVE => {
                    if record.num_fields() == 0 {
                        continue;
                    }
                    if execve_recs.is_empty() {
                        num_fields += 1; // cmdline
                    }
                    if argc_rec.is_none() {
                        // argc should lead the record; scan the first few
                        // fields in case the kernel reordered.
                        for i in 0..record.num_fields().min(3) {
                            if record.field_at(i).map(|f| f.name() == "argc") == Some(true) {
                                num_fields += 1;
                                argc_rec = Some(record);
                                break;
                            }
                        }
                    }
                    execve_recs.push(record);
                }
                RecordType::CWD => {
                    if cwd_rec.is_none()
                        && record.num_fields() > 0
                        && record.field_at(0).map(|f| f.name() == "cwd") == Some(true)
                    {
                        num_fields += 1;
                        cwd_rec = Some(record);
                    }
                }
                RecordType::PATH => {
                    if record.num_fields() > 0 {
                        if path_recs.is_empty() {
                            num_fields += 5; // name, nametype, mode, ouid, ogid
                        }
                        path_recs.push(record);
                    }
                }
                RecordType::SOCKADDR => {
                    if sockaddr_rec.is_none()
                        && record.num_fields() > 0
                        && record.field_at(0).map(|f| f.name() == "saddr") == Some(true)
                    {
                        num_fields += 1;
                        sockaddr_rec = Some(record);
                    }
                }
                RecordType::AUOMS_DROPPED_RECORDS => {
                    num_fields += record.num_fields();
                    dropped_rec = Some(record);
                }
                _ => {
                    if record.num_fields() > 0 {
                        num_fields += record.num_fields();
                        other_recs.push(record);
                    }
                }
            }
        }

        // Argv fragments in aN-ascending order, PATH records in item order
        // (missing or unparsable items sort last, stably).
        execve_recs.sort_by_key(record_first_arg);
        path_recs.sort_by_key(path_item_ordinal);

        let rec_type = match (&syscall_rec, execve_recs.is_empty()) {
            (Some(_), false) => RecordType::AUOMS_EXECVE,
            (Some(_), true) => RecordType::AUOMS_SYSCALL,
            (None, _) => RecordType::AUOMS_SYSCALL_FRAGMENT,
        };
        let type_name = rec_type.name().unwrap_or_default();

        self.builder
            .begin_event(event.seconds(), event.milliseconds(), event.serial(), 1)?;
        self.builder.set_event_flags(EVENT_FLAG_SYNTHESIZED);
        self.builder.begin_record(rec_type, type_name, b"", num_fields)?;

        if let Some(record) = syscall_rec {
            for field in record.fields() {
                if field.name() == "pid" {
                    if let Ok(pid) = field.raw_str().trim().parse() {
                        self.builder.set_event_pid(pid);
                    }
                }
                if !is_excluded_syscall_field(field.name()) {
                    self.add_field(&record, &field, None)?;
                }
            }
        }

        if let Some(record) = cwd_rec {
            if let Some(field) = record.field_by_name("cwd") {
                self.add_field(&record, &field, None)?;
            }
        }

        if !path_recs.is_empty() {
            self.add_path_arrays(&path_recs)?;
        }

        if let Some(record) = argc_rec {
            if let Some(field) = record.field_by_name("argc") {
                self.add_field(&record, &field, None)?;
            }
        }

        if !execve_recs.is_empty() {
            let mut cmdline = String::new();
            self.converter.convert(&execve_recs, &mut cmdline);
            self.builder.add_field(
                "cmdline",
                cmdline.as_bytes(),
                None,
                crate::event::FieldKind::Unclassified,
            )?;
        }

        if let Some(record) = sockaddr_rec {
            if let Some(field) = record.field_by_name("saddr") {
                self.add_field(&record, &field, Some("sockaddr"))?;
            }
        }

        for record in &other_recs {
            let prefix = record.type_name().to_string();
            for field in record.fields() {
                self.add_field(record, &field, Some(&prefix))?;
            }
        }

        if let Some(record) = dropped_rec {
            for field in record.fields() {
                let name = format!("dropped_{}", field.name());
                self.builder.add_field(
                    &name,
                    field.raw(),
                    None,
                    crate::event::FieldKind::Unclassified,
                )?;
            }
        }

        self.builder.end_record()?;
        self.builder.end_event()
    }

    fn add_path_arrays(&mut self, path_recs: &[EventRecord<'_>]) -> Result<(), BuildError> {
        let mut name = Vec::from(&b"["[..]);
        let mut nametype = String::from("[\"");
        let mut mode = String::from("[\"");
        let mut ouid = String::from("[\"");
        let mut ogid = String::from("[\"");

        for (i, record) in path_recs.iter().enumerate() {
            if i != 0 {
                name.push(b',');
                nametype.push_str("\",\"");
                mode.push_str("\",\"");
                ouid.push_str("\",\"");
                ogid.push_str("\",\"");
            }
            for field in record.fields() {
                match field.name() {
                    "name" => name.extend_from_slice(field.raw()),
                    "nametype" => nametype.push_str(&field.raw_str()),
                    "mode" => mode.push_str(&field.raw_str()),
                    "ouid" => ouid.push_str(&field.raw_str()),
                    "ogid" => ogid.push_str(&field.raw_str()),
                    _ => {}
                }
            }
        }

        name.push(b']');
        nametype.push_str("\"]");
        mode.push_str("\"]");
        ouid.push_str("\"]");
        ogid.push_str("\"]");

        let kind = crate::event::FieldKind::Unclassified;
        self.builder.add_field("path_name", &name, None, kind)?;
        self.builder.add_field("path_nametype", nametype.as_bytes(), None, kind)?;
        self.builder.add_field("path_mode", mode.as_bytes(), None, kind)?;
        self.builder.add_field("path_ouid", ouid.as_bytes(), None, kind)?;
        self.builder.add_field("path_ogid", ogid.as_bytes(), None, kind)?;
        Ok(())
    }
}

fn is_excluded_syscall_field(name: &str) -> bool {
    match name {
        "type" | "items" => true,
        _ => {
            let b = name.as_bytes();
            b.len() == 2 && b[0] == b'a' && (b'0'..=b'3').contains(&b[1])
        }
    }
}

fn path_item_ordinal(record: &EventRecord<'_>) -> i64 {
    record
        .field_by_name("item")
        .and_then(|f| f.raw_str().trim().parse().ok())
        .unwrap_or(i64::MAX)
}
