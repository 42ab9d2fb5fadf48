//! Compiled event matcher.
//!
//! All rules' predicates for one field name compile into a single
//! [`RegexSet`], so each candidate field is scanned once no matter how many
//! rules reference it. Per rule, a bitmask records which of its fields
//! matched; the rule matches when every required field bit is set and the
//! record type is in the rule's set.

use std::collections::HashMap;

use regex::RegexSet;
use snafu::Snafu;

use crate::event::record_type::RecordType;
use crate::event::Event;

use super::rule::EventMatchRule;

/// Fields are tracked in a u32 bitmask, so a rule set may reference at most
/// 32 distinct field names.
pub const MAX_MATCH_FIELDS: usize = 32;

#[derive(Debug, Snafu)]
pub enum MatcherError {
    #[snafu(display("rule set references {count} field names, more than the limit of {MAX_MATCH_FIELDS}"))]
    TooManyFields { count: usize },

    #[snafu(display("invalid pattern for field '{field}': {reason}"))]
    BadPattern { field: String, reason: String },
}

#[derive(Clone, Copy)]
struct PerRulePredicate {
    min_match: u32,
    negated: bool,
}

struct FieldProgram {
    name: String,
    index: usize,
    set: RegexSet,
    /// Maps a pattern index in `set` to the rule it belongs to.
    pattern_rule: Vec<usize>,
    per_rule: Vec<Option<PerRulePredicate>>,
}

impl FieldProgram {
    /// Evaluates this field against `value`, OR-ing each rule's outcome bit
    /// into `rule_bits`.
    fn evaluate(&self, value: &str, rule_bits: &mut [u32]) {
        let matches = self.set.matches(value);
        let mut counts = vec![0u32; self.per_rule.len()];
        for idx in matches.iter() {
            counts[self.pattern_rule[idx]] += 1;
        }
        for (rule_idx, predicate) in self.per_rule.iter().enumerate() {
            let Some(predicate) = predicate else {
                continue;
            };
            let satisfied = counts[rule_idx] >= predicate.min_match;
            if satisfied != predicate.negated {
                rule_bits[rule_idx] |= 1 << self.index;
            }
        }
    }
}

/// An immutable matcher compiled from a rule set.
pub struct Matcher {
    programs: Vec<FieldProgram>,
    /// Per rule: the field bits that must all be set.
    required_bits: Vec<u32>,
    /// Per record type: the union of field bits any rule with that type
    /// references; types absent here cannot match at all.
    record_type_bits: HashMap<RecordType, u32>,
    record_types: Vec<Vec<RecordType>>,
}

impl Matcher {
    pub fn compile(rules: &[EventMatchRule]) -> Result<Matcher, MatcherError> {
        struct Builder {
            name: String,
            index: usize,
            patterns: Vec<String>,
            pattern_rule: Vec<usize>,
            per_rule: Vec<Option<PerRulePredicate>>,
        }

        let mut builders: Vec<Builder> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut required_bits = vec![0u32; rules.len()];
        let mut record_type_bits: HashMap<RecordType, u32> = HashMap::new();

        for (rule_idx, rule) in rules.iter().enumerate() {
            for field_rule in &rule.field_rules {
                let builder_idx = match by_name.get(&field_rule.name) {
                    Some(&idx) => idx,
                    None => {
                        if builders.len() >= MAX_MATCH_FIELDS {
                            return Err(MatcherError::TooManyFields {
                                count: builders.len() + 1,
                            });
                        }
                        let idx = builders.len();
                        builders.push(Builder {
                            name: field_rule.name.clone(),
                            index: idx,
                            patterns: Vec::new(),
                            pattern_rule: Vec::new(),
                            per_rule: vec![None; rules.len()],
                        });
                        by_name.insert(field_rule.name.clone(), idx);
                        idx
                    }
                };

                let builder = &mut builders[builder_idx];
                for pattern in field_rule.patterns() {
                    builder.patterns.push(pattern);
                    builder.pattern_rule.push(rule_idx);
                }
                builder.per_rule[rule_idx] = Some(PerRulePredicate {
                    min_match: field_rule.min_match() as u32,
                    negated: field_rule.op.is_negated(),
                });

                required_bits[rule_idx] |= 1 << builder.index;
                for &rtype in &rule.record_types {
                    *record_type_bits.entry(rtype).or_default() |= 1 << builder.index;
                }
            }
        }

        let mut programs = Vec::with_capacity(builders.len());
        for builder in builders {
            let set = RegexSet::new(&builder.patterns).map_err(|e| MatcherError::BadPattern {
                field: builder.name.clone(),
                reason: e.to_string(),
            })?;
            programs.push(FieldProgram {
                name: builder.name,
                index: builder.index,
                set,
                pattern_rule: builder.pattern_rule,
                per_rule: builder.per_rule,
            });
        }

        Ok(Matcher {
            programs,
            required_bits,
            record_type_bits,
            record_types: rules.iter().map(|r| r.record_types.iter().copied().collect()).collect(),
        })
    }

    /// Matches a single-record event against the rule set, returning the
    /// lowest-indexed matching rule.
    pub fn matches(&self, event: &Event) -> Option<usize> {
        let record = event.record_at(0)?;
        let rtype = record.record_type();
        let candidate_bits = *self.record_type_bits.get(&rtype)?;
        if candidate_bits == 0 {
            return None;
        }

        let mut rule_bits = vec![0u32; self.required_bits.len()];
        for program in &self.programs {
            if candidate_bits & (1 << program.index) == 0 {
                continue;
            }
            let Some(field) = record.field_by_name(&program.name) else {
                // A missing field contributes nothing, so rules requiring
                // it (negated or not) cannot match.
                continue;
            };
            let value = String::from_utf8_lossy(field.value());
            program.evaluate(&value, &mut rule_bits);
        }

        (0..self.required_bits.len()).find(|&i| {
            rule_bits[i] & self.required_bits[i] == self.required_bits[i]
                && self.record_types[i].contains(&rtype)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, FieldKind};
    use crate::transforms::aggregate::rule::AggregationRule;

    fn compile(rule_jsons: &[&str]) -> Matcher {
        let rules: Vec<_> = rule_jsons
            .iter()
            .map(|j| AggregationRule::from_json_str(j).unwrap().match_rule)
            .collect();
        Matcher::compile(&rules).unwrap()
    }

    fn event(rtype: RecordType, name: &str, fields: &[(&str, &str, Option<&str>)]) -> Event {
        let mut b = EventBuilder::new(64 * 1024);
        b.begin_event(1, 0, 1, 1).unwrap();
        b.begin_record(rtype, name, b"", fields.len() as u16).unwrap();
        for (fname, raw, interp) in fields {
            b.add_field(fname, raw.as_bytes(), interp.map(str::as_bytes), FieldKind::Unclassified)
                .unwrap();
        }
        b.end_record().unwrap();
        b.end_event().unwrap()
    }

    fn rule(record_type: &str, field_rules: &str) -> String {
        format!(
            r#"{{"match_rule": {{"record_types": ["{record_type}"], "field_rules": {field_rules}}},
                 "aggregation_fields": {{"pid": {{}}}}}}"#
        )
    }

    #[test]
    fn eq_matches_and_record_type_gates() {
        let matcher = compile(&[&rule(
            "AUOMS_EXECVE",
            r#"[{"name": "syscall", "op": "eq", "value": "execve"}]"#,
        )]);

        let hit = event(
            RecordType::AUOMS_EXECVE,
            "AUOMS_EXECVE",
            &[("syscall", "59", Some("execve"))],
        );
        assert_eq!(matcher.matches(&hit), Some(0));

        // Wrong record type.
        let wrong_type =
            event(RecordType::AUOMS_SYSCALL, "AUOMS_SYSCALL", &[("syscall", "59", Some("execve"))]);
        assert_eq!(matcher.matches(&wrong_type), None);

        // Wrong value.
        let wrong_value =
            event(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE", &[("syscall", "2", Some("open"))]);
        assert_eq!(matcher.matches(&wrong_value), None);

        // eq anchors: a substring is not a match.
        let substring = event(
            RecordType::AUOMS_EXECVE,
            "AUOMS_EXECVE",
            &[("syscall", "59", Some("execveat"))],
        );
        assert_eq!(matcher.matches(&substring), None);
    }

    #[test]
    fn interp_preferred_over_raw() {
        let matcher = compile(&[&rule(
            "AUOMS_EXECVE",
            r#"[{"name": "syscall", "op": "eq", "value": "execve"}]"#,
        )]);
        // Raw alone matches when no interp is present.
        let raw_only =
            event(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE", &[("syscall", "execve", None)]);
        assert_eq!(matcher.matches(&raw_only), Some(0));
    }

    #[test]
    fn in_and_not_in() {
        let matcher = compile(&[
            &rule("LOGIN", r#"[{"name": "uid", "op": "in", "values": ["0", "1000"]}]"#),
            &rule("LOGIN", r#"[{"name": "uid", "op": "!in", "values": ["0", "1000"]}]"#),
        ]);

        let root = event(RecordType::LOGIN, "LOGIN", &[("uid", "0", None)]);
        assert_eq!(matcher.matches(&root), Some(0));

        let other = event(RecordType::LOGIN, "LOGIN", &[("uid", "42", None)]);
        assert_eq!(matcher.matches(&other), Some(1));
    }

    #[test]
    fn re_all_patterns_must_match() {
        let matcher = compile(&[&rule(
            "AUOMS_EXECVE",
            r#"[{"name": "cmdline", "op": "re", "values": ["^/usr", "logger"]}]"#,
        )]);

        let both =
            event(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE", &[("cmdline", "/usr/bin/logger -t x", None)]);
        assert_eq!(matcher.matches(&both), Some(0));

        let one =
            event(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE", &[("cmdline", "/usr/bin/true", None)]);
        assert_eq!(matcher.matches(&one), None);
    }

    #[test]
    fn all_field_rules_are_anded() {
        let matcher = compile(&[&rule(
            "AUOMS_EXECVE",
            r#"[{"name": "syscall", "op": "eq", "value": "execve"},
                {"name": "cmdline", "op": "re", "value": "testcmd"}]"#,
        )]);

        let both = event(
            RecordType::AUOMS_EXECVE,
            "AUOMS_EXECVE",
            &[("syscall", "execve", None), ("cmdline", "run testcmd now", None)],
        );
        assert_eq!(matcher.matches(&both), Some(0));

        let missing_field =
            event(RecordType::AUOMS_EXECVE, "AUOMS_EXECVE", &[("syscall", "execve", None)]);
        assert_eq!(matcher.matches(&missing_field), None);
    }

    #[test]
    fn lowest_rule_index_wins() {
        let matcher = compile(&[
            &rule("LOGIN", r#"[{"name": "uid", "op": "re", "value": "."}]"#),
            &rule("LOGIN", r#"[{"name": "uid", "op": "eq", "value": "0"}]"#),
        ]);
        let ev = event(RecordType::LOGIN, "LOGIN", &[("uid", "0", None)]);
        assert_eq!(matcher.matches(&ev), Some(0));
    }

    #[test]
    fn too_many_fields_is_an_error() {
        let field_rules: Vec<String> = (0..33)
            .map(|i| format!(r#"{{"name": "f{i}", "op": "eq", "value": "x"}}"#))
            .collect();
        let json = rule("LOGIN", &format!("[{}]", field_rules.join(",")));
        let rules =
            vec![AggregationRule::from_json_str(&json).unwrap().match_rule];
        assert!(matches!(
            Matcher::compile(&rules),
            Err(MatcherError::TooManyFields { .. })
        ));
    }
}
