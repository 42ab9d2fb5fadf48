//! Assigns each event a queue priority band from its record type.

use std::collections::HashMap;

use tracing::warn;

use crate::config::PrioritySection;
use crate::event::record_type::RecordType;
use crate::event::Event;

pub struct Prioritizer {
    default: usize,
    by_record_type: HashMap<RecordType, usize>,
}

impl Prioritizer {
    /// Builds the prioritizer from config; unknown record-type names are
    /// skipped with a warning.
    pub fn from_config(section: &PrioritySection, num_priorities: usize) -> Prioritizer {
        let mut by_record_type = HashMap::new();

        // Synthesized summary traffic defaults to the low bands so live
        // audit events win when the queue is contended.
        by_record_type.insert(RecordType::AUOMS_AGGREGATE, num_priorities.saturating_sub(2));
        by_record_type
            .insert(RecordType::AUOMS_PROCESS_INVENTORY, num_priorities.saturating_sub(1));
        by_record_type.insert(RecordType::AUOMS_SYSCALL, 3.min(num_priorities - 1));
        by_record_type.insert(RecordType::AUOMS_EXECVE, 3.min(num_priorities - 1));
        by_record_type.insert(RecordType::AUOMS_SYSCALL_FRAGMENT, 3.min(num_priorities - 1));
        by_record_type.insert(RecordType::LOGIN, 2.min(num_priorities - 1));
        by_record_type.insert(RecordType::USER_LOGIN, 2.min(num_priorities - 1));

        for (name, &priority) in &section.by_record_type {
            match RecordType::from_name(name) {
                Some(rtype) => {
                    by_record_type.insert(rtype, priority.min(num_priorities - 1));
                }
                None => warn!(record_type = %name, "Unknown record type in priority config."),
            }
        }

        Prioritizer { default: section.default.min(num_priorities - 1), by_record_type }
    }

    pub fn priority(&self, event: &Event) -> usize {
        let Some(record) = event.record_at(0) else {
            return self.default;
        };
        self.by_record_type
            .get(&record.record_type())
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, FieldKind};

    fn event_of(rtype: RecordType, name: &str) -> Event {
        let mut b = EventBuilder::new(4096);
        b.begin_event(1, 0, 1, 1).unwrap();
        b.begin_record(rtype, name, b"", 1).unwrap();
        b.add_field("k", b"v", None, FieldKind::Unclassified).unwrap();
        b.end_record().unwrap();
        b.end_event().unwrap()
    }

    #[test]
    fn defaults_and_overrides() {
        let mut section = PrioritySection::default();
        section.by_record_type.insert("AVC".into(), 1);
        section.by_record_type.insert("NOT_A_TYPE".into(), 0);
        let prioritizer = Prioritizer::from_config(&section, 8);

        assert_eq!(prioritizer.priority(&event_of(RecordType::AVC, "AVC")), 1);
        assert_eq!(prioritizer.priority(&event_of(RecordType::AUOMS_AGGREGATE, "AUOMS_AGGREGATE")), 6);
        assert_eq!(
            prioritizer.priority(&event_of(RecordType::AUOMS_PROCESS_INVENTORY, "AUOMS_PROCESS_INVENTORY")),
            7
        );
        assert_eq!(prioritizer.priority(&event_of(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE")), 3);
        // Unmapped types take the default band.
        assert_eq!(prioritizer.priority(&event_of(RecordType::SECCOMP, "SECCOMP")), 4);
    }

    #[test]
    fn bands_clamp_to_configured_count() {
        let mut section = PrioritySection::default();
        section.default = 10;
        section.by_record_type.insert("AVC".into(), 9);
        let prioritizer = Prioritizer::from_config(&section, 2);
        assert_eq!(prioritizer.priority(&event_of(RecordType::AVC, "AVC")), 1);
        assert_eq!(prioritizer.priority(&event_of(RecordType::SECCOMP, "SECCOMP")), 1);
    }
}
