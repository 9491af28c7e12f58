//! Filter evaluation over materialized records.
//!
//! The in-memory and key/value backends load records and evaluate filters here. The
//! relational backend compiles the same semantics to SQL, so any change to the ordering
//! below has to be mirrored there.
//!
//! Values order first by kind (number < string < boolean < array < object), then by
//! value. Unset values (missing fields and `null`) behave as positive infinity. Arrays
//! and objects of the same kind order bytewise by their [`canonical_json`] text, and
//! are equal when that text is.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::{
    error::StorageError,
    query::{Comparison, Filter, FilterVisitor, PaginationRule},
    record::Record,
};

/// Comparable view of an optional JSON value.
#[derive(Debug, Clone, Copy)]
pub enum Comparable<'a> {
    Number(f64),
    String(&'a str),
    Bool(bool),
    Array(&'a [Value]),
    Object(&'a Map<String, Value>),
    /// Missing field or `null`.
    Unset,
}

impl<'a> From<Option<&'a Value>> for Comparable<'a> {
    fn from(value: Option<&'a Value>) -> Self {
        match value {
            None | Some(Value::Null) => Comparable::Unset,
            Some(Value::Bool(value)) => Comparable::Bool(*value),
            Some(Value::Number(value)) => Comparable::Number(value.as_f64().unwrap_or(f64::NAN)),
            Some(Value::String(value)) => Comparable::String(value),
            Some(Value::Array(values)) => Comparable::Array(values),
            Some(Value::Object(map)) => Comparable::Object(map),
        }
    }
}

impl<'a> From<&'a Value> for Comparable<'a> {
    fn from(value: &'a Value) -> Self {
        Comparable::from(Some(value))
    }
}

impl<'a> Comparable<'a> {
    /// Position of the value kind in the total order.
    pub fn rank(&self) -> u8 {
        match self {
            Comparable::Number(_) => 0,
            Comparable::String(_) => 1,
            Comparable::Bool(_) => 2,
            Comparable::Array(_) => 3,
            Comparable::Object(_) => 4,
            Comparable::Unset => 5,
        }
    }

    /// Ordering used for sorting and for inequality filters.
    pub fn order(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Comparable::Number(a), Comparable::Number(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Comparable::String(a), Comparable::String(b)) => a.cmp(b),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.cmp(b),
            (Comparable::Array(_), Comparable::Array(_))
            | (Comparable::Object(_), Comparable::Object(_)) => {
                self.canonical().cmp(&other.canonical())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Equality used by `EQ`/`NOT` filters, consistent with [`order`](Self::order).
    pub fn equals(&self, other: &Self) -> bool {
        self.rank() == other.rank() && self.order(other) == Ordering::Equal
    }

    fn canonical(&self) -> String {
        let mut out = String::new();
        match self {
            Comparable::Array(values) => write_array(values, &mut out),
            Comparable::Object(map) => write_object(map, &mut out),
            _ => {}
        }
        out
    }
}

/// Canonical text of a JSON value, as PostgreSQL prints `jsonb`.
///
/// Object keys are sorted by length, then bytewise. Separators are `", "` and `": "`.
/// Numbers are written in plain decimal notation, keeping the fractional digits of
/// their JSON form (`1.0` stays `1.0`, `1e2` becomes `100`).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(&canonical_number(number)),
        Value::String(string) => write_string(string, out),
        Value::Array(values) => write_array(values, out),
        Value::Object(map) => write_object(map, out),
    }
}

fn write_string(string: &str, out: &mut String) {
    out.push_str(&Value::from(string).to_string());
}

fn write_array(values: &[Value], out: &mut String) {
    out.push('[');
    for (position, value) in values.iter().enumerate() {
        if position > 0 {
            out.push_str(", ");
        }
        write_value(value, out);
    }
    out.push(']');
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    out.push('{');
    for (position, (key, value)) in entries.into_iter().enumerate() {
        if position > 0 {
            out.push_str(", ");
        }
        write_string(key, out);
        out.push_str(": ");
        write_value(value, out);
    }
    out.push('}');
}

fn canonical_number(number: &Number) -> String {
    let text = number.to_string();
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let (mantissa, exponent) = match unsigned.split_once(|c: char| c == 'e' || c == 'E') {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i64>().unwrap_or(0)),
        None => (unsigned, 0),
    };
    let (integer, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let digits = format!("{integer}{fraction}");
    let scale = fraction.len() as i64 - exponent;
    let (integer, fraction) = if scale <= 0 {
        (format!("{digits}{}", "0".repeat(scale.unsigned_abs() as usize)), String::new())
    } else if digits.len() > scale as usize {
        let split = digits.len() - scale as usize;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        (
            String::new(),
            format!("{}{digits}", "0".repeat(scale as usize - digits.len())),
        )
    };

    let integer = match integer.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    let zero = integer == "0" && fraction.bytes().all(|digit| digit == b'0');
    let sign = if negative && !zero { "-" } else { "" };

    if fraction.is_empty() {
        format!("{sign}{integer}")
    } else {
        format!("{sign}{integer}.{fraction}")
    }
}

/// Evaluates filters against one record.
pub struct RecordEvaluator<'a> {
    record: &'a Record,
}

impl<'a> RecordEvaluator<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    /// Whether the record matches every filter.
    pub fn matches_all(record: &'a Record, filters: &[Filter]) -> bool {
        RecordEvaluator::new(record)
            .visit_all(filters)
            .unwrap_or(false)
    }

    /// Whether the record matches at least one rule.
    pub fn matches_any(record: &'a Record, rules: &[PaginationRule]) -> bool {
        RecordEvaluator::new(record)
            .visit_any(rules)
            .unwrap_or(false)
    }
}

/// Evaluates a single comparison between a record value and a filter value.
pub fn compare(left: Comparable<'_>, operator: Comparison, right: Comparable<'_>) -> bool {
    match operator {
        Comparison::Eq => left.equals(&right),
        Comparison::Not => !left.equals(&right),
        Comparison::Lt => left.order(&right) == Ordering::Less,
        Comparison::Gt => left.order(&right) == Ordering::Greater,
        Comparison::Min => left.order(&right) != Ordering::Less,
        Comparison::Max => left.order(&right) != Ordering::Greater,
    }
}

impl<'a> FilterVisitor for RecordEvaluator<'a> {
    type Output = bool;
    type Error = StorageError;

    fn visit_filter(&mut self, filter: &Filter) -> Result<Self::Output, Self::Error> {
        Ok(compare(
            Comparable::from(self.record.resolve(&filter.field)),
            filter.operator,
            Comparable::from(&filter.value),
        ))
    }

    fn combine_all(&mut self, outputs: Vec<Self::Output>) -> Result<Self::Output, Self::Error> {
        Ok(outputs.into_iter().all(|matched| matched))
    }

    fn combine_any(&mut self, outputs: Vec<Self::Output>) -> Result<Self::Output, Self::Error> {
        Ok(outputs.into_iter().any(|matched| matched))
    }
}

/// Keeps the records matching every filter.
pub fn apply_filters<'r>(
    records: impl IntoIterator<Item = &'r Record>,
    filters: &[Filter],
) -> Vec<&'r Record> {
    records
        .into_iter()
        .filter(|record| RecordEvaluator::matches_all(record, filters))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn check(value: Value, filter: Filter) -> bool {
        RecordEvaluator::matches_all(&record(value), &[filter])
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(check(json!({"n": 1}), Filter::eq("n", 1.0)));
        assert!(check(json!({"n": 2}), Filter::gt("n", 1.5)));
        assert!(check(json!({"n": 2}), Filter::min("n", 2)));
        assert!(!check(json!({"n": 2}), Filter::lt("n", 2)));
    }

    #[test]
    fn unset_values_behave_as_infinity() {
        assert!(check(json!({}), Filter::gt("n", 10)));
        assert!(check(json!({"n": null}), Filter::min("n", 10)));
        assert!(!check(json!({}), Filter::lt("n", 10)));
        assert!(!check(json!({}), Filter::max("n", 10)));
        assert!(!check(json!({}), Filter::eq("n", 10)));
        assert!(check(json!({}), Filter::ne("n", 10)));
        assert!(check(json!({}), Filter::eq("n", Value::Null)));
        assert!(!check(json!({}), Filter::gt("n", Value::Null)));
        assert!(check(json!({"n": 3}), Filter::lt("n", Value::Null)));
    }

    #[test]
    fn kinds_are_ordered() {
        assert!(check(json!({"v": "a"}), Filter::gt("v", 100)));
        assert!(check(json!({"v": true}), Filter::gt("v", "zzz")));
        assert!(check(json!({"v": [1]}), Filter::gt("v", false)));
        assert!(check(json!({"v": {"a": 1}}), Filter::gt("v", json!([1, 2]))));
    }

    #[test]
    fn strings_compare_bytewise() {
        assert!(check(json!({"s": "B"}), Filter::lt("s", "a")));
        assert!(check(json!({"s": "abc"}), Filter::gt("s", "ab")));
    }

    #[test]
    fn containers_order_by_canonical_text() {
        assert!(check(json!({"tags": ["a", "b"]}), Filter::eq("tags", json!(["a", "b"]))));
        assert!(check(json!({"tags": ["a"]}), Filter::ne("tags", json!(["a", "b"]))));
        assert!(check(json!({"tags": ["b"]}), Filter::gt("tags", json!(["a"]))));
        assert!(!check(json!({"tags": ["a", "b"]}), Filter::gt("tags", json!(["b"]))));
        assert!(check(json!({"tags": [10]}), Filter::lt("tags", json!([9]))));
        assert!(check(json!({"meta": {"b": 1, "a": 2}}), Filter::eq("meta", json!({"a": 2, "b": 1}))));
        assert!(!check(json!({"tags": [1]}), Filter::eq("tags", json!([1.0]))));
    }

    #[test]
    fn canonical_text_matches_jsonb_output() {
        assert_eq!(
            canonical_json(&json!({"bb": [1, 2.5, null], "a": {"c": "x\ny"}, "ccc": true})),
            r#"{"a": {"c": "x\ny"}, "bb": [1, 2.5, null], "ccc": true}"#
        );
        assert_eq!(canonical_json(&json!([])), "[]");
        assert_eq!(canonical_json(&json!({})), "{}");
    }

    #[test]
    fn canonical_numbers_use_plain_notation() {
        assert_eq!(canonical_json(&json!(1.0)), "1.0");
        assert_eq!(canonical_json(&json!(-3)), "-3");
        assert_eq!(canonical_json(&json!(1e20)), "100000000000000000000");
        assert_eq!(canonical_json(&json!(1.5e-7)), "0.00000015");
        assert_eq!(canonical_json(&json!(-0.0)), "0.0");
    }

    #[test]
    fn rules_are_combined_with_or() {
        let r = record(json!({"a": 1, "b": 2}));
        let rules = vec![
            vec![Filter::eq("a", 2)],
            vec![Filter::eq("a", 1), Filter::gt("b", 1)],
        ];

        assert!(RecordEvaluator::matches_any(&r, &rules));
        assert!(!RecordEvaluator::matches_any(&r, &[]));
    }
}
