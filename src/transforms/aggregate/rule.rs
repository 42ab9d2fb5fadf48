//! Aggregation rules and their JSON form.
//!
//! A rule pairs a match rule (record types plus ANDed field predicates)
//! with the set of fields to aggregate and the bounds of one aggregate.
//! Rule identity is the canonical JSON rendering: persistence and rule
//! reloads compare rules by that string.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{json, Map, Value};
use snafu::Snafu;

use crate::event::record_type::RecordType;

pub const DEFAULT_MAX_PENDING: u32 = 1024;
pub const MIN_MAX_PENDING: u32 = 1;
pub const MAX_MAX_PENDING: u32 = 10240;
pub const DEFAULT_MAX_SIZE: u32 = 8192;
pub const MIN_MAX_SIZE: u32 = 128;
pub const MAX_MAX_SIZE: u32 = 128 * 1024;
pub const DEFAULT_MAX_COUNT: u32 = 1024;
pub const MIN_MAX_COUNT: u32 = 2;
pub const MAX_MAX_COUNT: u32 = 128 * 1024;
/// 15 minutes.
pub const DEFAULT_MAX_TIME: u32 = 900;
pub const MIN_MAX_TIME: u32 = 1;
/// 1 hour.
pub const MAX_MAX_TIME: u32 = 3600;
pub const DEFAULT_SEND_FIRST: bool = false;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum RuleParseError {
    #[snafu(display("{context}: expected a JSON {expected}"))]
    WrongType { context: &'static str, expected: &'static str },

    #[snafu(display("{context}: missing '{name}'"))]
    MissingMember { context: &'static str, name: &'static str },

    #[snafu(display("{context}: '{what}' is empty"))]
    EmptyMember { context: &'static str, what: &'static str },

    #[snafu(display("{context}: invalid value '{value}'"))]
    BadValue { context: &'static str, value: String },

    #[snafu(display("rule JSON is not parsable: {reason}"))]
    Json { reason: String },
}

/// Comparison operator of one field predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    NotEq,
    In,
    NotIn,
    Re,
    NotRe,
}

impl MatchOp {
    fn parse(name: &str) -> Option<MatchOp> {
        Some(match name.to_ascii_lowercase().as_str() {
            "eq" => MatchOp::Eq,
            "!eq" => MatchOp::NotEq,
            "in" => MatchOp::In,
            "!in" => MatchOp::NotIn,
            "re" => MatchOp::Re,
            "!re" => MatchOp::NotRe,
            _ => return None,
        })
    }

    pub fn is_negated(self) -> bool {
        matches!(self, MatchOp::NotEq | MatchOp::NotIn | MatchOp::NotRe)
    }
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchOp::Eq => "eq",
            MatchOp::NotEq => "!eq",
            MatchOp::In => "in",
            MatchOp::NotIn => "!in",
            MatchOp::Re => "re",
            MatchOp::NotRe => "!re",
        })
    }
}

/// One field predicate of a match rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMatchRule {
    pub name: String,
    pub op: MatchOp,
    pub values: Vec<String>,
}

impl FieldMatchRule {
    /// The regex patterns this predicate compiles to. `eq`/`in` values are
    /// anchored; `re` values are used as written.
    pub fn patterns(&self) -> Vec<String> {
        match self.op {
            MatchOp::Eq | MatchOp::NotEq => {
                self.values.iter().take(1).map(|v| format!("^{v}$")).collect()
            }
            MatchOp::In | MatchOp::NotIn => {
                let mut patterns: Vec<_> =
                    self.values.iter().map(|v| format!("^{v}$")).collect();
                patterns.sort();
                patterns
            }
            MatchOp::Re | MatchOp::NotRe => {
                let mut patterns = self.values.clone();
                patterns.sort();
                patterns
            }
        }
    }

    /// How many distinct patterns must match for the predicate to hold:
    /// 1 for `eq`/`in` (any-of), all of them for `re`.
    pub fn min_match(&self) -> usize {
        match self.op {
            MatchOp::Re | MatchOp::NotRe => self.values.len(),
            _ => 1,
        }
    }

    fn from_json(value: &Value) -> Result<FieldMatchRule, RuleParseError> {
        const CTX: &str = "field rule";
        let obj = value
            .as_object()
            .ok_or(RuleParseError::WrongType { context: CTX, expected: "object" })?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or(RuleParseError::MissingMember { context: CTX, name: "name" })?
            .to_string();
        let op_name = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or(RuleParseError::MissingMember { context: CTX, name: "op" })?;
        let op = MatchOp::parse(op_name).ok_or_else(|| RuleParseError::BadValue {
            context: CTX,
            value: op_name.to_string(),
        })?;

        let values = match (obj.get("value"), obj.get("values")) {
            (Some(_), Some(_)) => {
                return Err(RuleParseError::BadValue {
                    context: CTX,
                    value: "both 'value' and 'values'".into(),
                })
            }
            (Some(value), None) => {
                let v = value.as_str().ok_or(RuleParseError::WrongType {
                    context: CTX,
                    expected: "string",
                })?;
                vec![v.to_string()]
            }
            (None, Some(values)) => {
                let arr = values.as_array().ok_or(RuleParseError::WrongType {
                    context: CTX,
                    expected: "array",
                })?;
                if arr.is_empty() {
                    return Err(RuleParseError::EmptyMember { context: CTX, what: "values" });
                }
                arr.iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or(RuleParseError::WrongType {
                            context: CTX,
                            expected: "string",
                        })
                    })
                    .collect::<Result<_, _>>()?
            }
            (None, None) => {
                return Err(RuleParseError::MissingMember { context: CTX, name: "value" })
            }
        };

        Ok(FieldMatchRule { name, op, values })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".into(), json!(self.name));
        obj.insert("op".into(), json!(self.op.to_string()));
        if self.values.len() < 2 {
            obj.insert("value".into(), json!(self.values.first().cloned().unwrap_or_default()));
        } else {
            obj.insert("values".into(), json!(self.values));
        }
        Value::Object(obj)
    }
}

/// The match half of an aggregation rule: an allowed record-type set plus
/// field predicates, all ANDed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMatchRule {
    pub record_types: BTreeSet<RecordType>,
    pub field_rules: Vec<FieldMatchRule>,
}

impl EventMatchRule {
    pub fn from_json(value: &Value) -> Result<EventMatchRule, RuleParseError> {
        const CTX: &str = "match rule";
        let obj = value
            .as_object()
            .ok_or(RuleParseError::WrongType { context: CTX, expected: "object" })?;

        let types = obj
            .get("record_types")
            .and_then(Value::as_array)
            .ok_or(RuleParseError::MissingMember { context: CTX, name: "record_types" })?;
        if types.is_empty() {
            return Err(RuleParseError::EmptyMember { context: CTX, what: "record_types" });
        }
        let mut record_types = BTreeSet::new();
        for t in types {
            let name = t.as_str().ok_or(RuleParseError::WrongType {
                context: CTX,
                expected: "string",
            })?;
            let rtype = RecordType::from_name(name).ok_or_else(|| RuleParseError::BadValue {
                context: CTX,
                value: name.to_string(),
            })?;
            record_types.insert(rtype);
        }

        let rules = obj
            .get("field_rules")
            .and_then(Value::as_array)
            .ok_or(RuleParseError::MissingMember { context: CTX, name: "field_rules" })?;
        if rules.is_empty() {
            return Err(RuleParseError::EmptyMember { context: CTX, what: "field_rules" });
        }
        let mut field_rules: Vec<FieldMatchRule> = Vec::with_capacity(rules.len());
        for r in rules {
            let rule = FieldMatchRule::from_json(r)?;
            // The first predicate for a name wins; duplicates are dropped.
            if !field_rules.iter().any(|existing| existing.name == rule.name) {
                field_rules.push(rule);
            }
        }

        Ok(EventMatchRule { record_types, field_rules })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        let names: Vec<String> = self.record_types.iter().map(|t| t.to_string()).collect();
        obj.insert("record_types".into(), json!(names));
        obj.insert(
            "field_rules".into(),
            Value::Array(self.field_rules.iter().map(FieldMatchRule::to_json).collect()),
        );
        Value::Object(obj)
    }
}

/// How one aggregated field's values are collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldMode {
    Raw,
    Interp,
    Dynamic,
    Drop,
}

impl FieldMode {
    fn parse(name: &str) -> Option<FieldMode> {
        Some(match name {
            "raw" => FieldMode::Raw,
            "interp" => FieldMode::Interp,
            "dynamic" => FieldMode::Dynamic,
            "drop" => FieldMode::Drop,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            FieldMode::Raw => "raw",
            FieldMode::Interp => "interp",
            FieldMode::Dynamic => "dynamic",
            FieldMode::Drop => "drop",
        }
    }
}

/// How the per-event time and serial columns are collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionMode {
    Full,
    Delta,
    Drop,
}

impl CollectionMode {
    fn parse(name: &str) -> Option<CollectionMode> {
        Some(match name {
            "full" => CollectionMode::Full,
            "delta" => CollectionMode::Delta,
            "drop" => CollectionMode::Drop,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            CollectionMode::Full => "full",
            CollectionMode::Delta => "delta",
            CollectionMode::Drop => "drop",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregationField {
    pub name: String,
    pub mode: FieldMode,
    pub output_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregationRule {
    pub match_rule: EventMatchRule,
    pub aggregation_fields: Vec<AggregationField>,
    pub time_field_mode: CollectionMode,
    pub serial_field_mode: CollectionMode,
    pub max_pending: u32,
    pub max_count: u32,
    pub max_size: u32,
    pub max_time: u32,
    pub send_first: bool,
}

impl AggregationRule {
    /// Parses one rule, clamping every bound into its allowed range.
    pub fn from_json(value: &Value) -> Result<AggregationRule, RuleParseError> {
        const CTX: &str = "aggregation rule";
        let obj = value
            .as_object()
            .ok_or(RuleParseError::WrongType { context: CTX, expected: "object" })?;

        let match_rule = EventMatchRule::from_json(
            obj.get("match_rule")
                .ok_or(RuleParseError::MissingMember { context: CTX, name: "match_rule" })?,
        )?;

        let fields = obj
            .get("aggregation_fields")
            .and_then(Value::as_object)
            .ok_or(RuleParseError::MissingMember { context: CTX, name: "aggregation_fields" })?;
        if fields.is_empty() {
            return Err(RuleParseError::EmptyMember { context: CTX, what: "aggregation_fields" });
        }
        let mut aggregation_fields = Vec::with_capacity(fields.len());
        for (name, spec) in fields {
            let mut mode = FieldMode::Dynamic;
            let mut output_name = name.clone();
            if let Some(spec) = spec.as_object() {
                if let Some(m) = spec.get("mode") {
                    let m = m.as_str().ok_or(RuleParseError::WrongType {
                        context: CTX,
                        expected: "string",
                    })?;
                    mode = FieldMode::parse(m).ok_or_else(|| RuleParseError::BadValue {
                        context: CTX,
                        value: m.to_string(),
                    })?;
                }
                if let Some(o) = spec.get("output_name") {
                    output_name = o
                        .as_str()
                        .ok_or(RuleParseError::WrongType { context: CTX, expected: "string" })?
                        .to_string();
                }
            }
            aggregation_fields.push(AggregationField { name: name.clone(), mode, output_name });
        }

        let collection_mode = |name: &'static str| -> Result<CollectionMode, RuleParseError> {
            match obj.get(name) {
                None => Ok(CollectionMode::Full),
                Some(v) => {
                    let s = v.as_str().ok_or(RuleParseError::WrongType {
                        context: CTX,
                        expected: "string",
                    })?;
                    CollectionMode::parse(s).ok_or_else(|| RuleParseError::BadValue {
                        context: CTX,
                        value: s.to_string(),
                    })
                }
            }
        };
        let bound = |name: &'static str, default: u32| -> Result<u32, RuleParseError> {
            match obj.get(name) {
                None => Ok(default),
                Some(v) => v
                    .as_u64()
                    .map(|v| v as u32)
                    .ok_or(RuleParseError::WrongType { context: CTX, expected: "unsigned integer" }),
            }
        };

        let time_field_mode = collection_mode("time_field_mode")?;
        let serial_field_mode = collection_mode("serial_field_mode")?;
        let max_pending =
            bound("max_pending", DEFAULT_MAX_PENDING)?.clamp(MIN_MAX_PENDING, MAX_MAX_PENDING);
        let max_count =
            bound("max_count", DEFAULT_MAX_COUNT)?.clamp(MIN_MAX_COUNT, MAX_MAX_COUNT);
        let max_size = bound("max_size", DEFAULT_MAX_SIZE)?.clamp(MIN_MAX_SIZE, MAX_MAX_SIZE);
        let max_time = bound("max_time", DEFAULT_MAX_TIME)?.clamp(MIN_MAX_TIME, MAX_MAX_TIME);

        let send_first = match obj.get("send_first") {
            None => DEFAULT_SEND_FIRST,
            Some(v) => v
                .as_bool()
                .ok_or(RuleParseError::WrongType { context: CTX, expected: "bool" })?,
        };

        Ok(AggregationRule {
            match_rule,
            aggregation_fields,
            time_field_mode,
            serial_field_mode,
            max_pending,
            max_count,
            max_size,
            max_time,
            send_first,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<AggregationRule, RuleParseError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| RuleParseError::Json { reason: e.to_string() })?;
        AggregationRule::from_json(&value)
    }

    /// Parses a JSON array of rules.
    pub fn rules_from_json(value: &Value) -> Result<Vec<AggregationRule>, RuleParseError> {
        let arr = value.as_array().ok_or(RuleParseError::WrongType {
            context: "rule set",
            expected: "array",
        })?;
        arr.iter().map(AggregationRule::from_json).collect()
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("match_rule".into(), self.match_rule.to_json());

        let mut fields = Map::new();
        for field in &self.aggregation_fields {
            let mut spec = Map::new();
            spec.insert("mode".into(), json!(field.mode.name()));
            spec.insert("output_name".into(), json!(field.output_name));
            fields.insert(field.name.clone(), Value::Object(spec));
        }
        obj.insert("aggregation_fields".into(), Value::Object(fields));

        obj.insert("time_field_mode".into(), json!(self.time_field_mode.name()));
        obj.insert("serial_field_mode".into(), json!(self.serial_field_mode.name()));
        obj.insert("max_pending".into(), json!(self.max_pending));
        obj.insert("max_count".into(), json!(self.max_count));
        obj.insert("max_size".into(), json!(self.max_size));
        obj.insert("max_time".into(), json!(self.max_time));
        obj.insert("send_first".into(), json!(self.send_first));
        Value::Object(obj)
    }

    /// The canonical identity string used to recognize a rule across
    /// restarts and reloads.
    pub fn canonical_json(&self) -> String {
        self.to_json().to_string()
    }

    pub fn field_spec(&self, name: &str) -> Option<&AggregationField> {
        self.aggregation_fields.iter().find(|f| f.name == name)
    }

    pub fn has_aggregation_field(&self, name: &str) -> bool {
        self.field_spec(name).is_some()
    }

    pub fn num_drop_fields(&self) -> usize {
        self.aggregation_fields
            .iter()
            .filter(|f| f.mode == FieldMode::Drop)
            .count()
    }
}
