//! Filter model and execution
//!
//! A filter is either an arbitrary predicate function, a boolean
//! combination (`$and` / `$or`), or a field-condition map in the
//! MongoDB style: `{"age": {"$gte": 21}, "name": "A"}` (bare values are
//! implicit `$eq`). JSON-shaped filters are planned into the [`Filter`]
//! tree once and then executed per record.
//!
//! Missing-field semantics (fixed, pinned by tests below): every operator
//! is false on a missing field, except `$nin` (vacuously true) and `$ne`
//! (true unless the comparand is null).

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::{ErrorCode, Result, StoreError};
use crate::types::{value_cmp, value_eq, Record};

/// One operator applied to one field
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    /// `%` wildcards, case-insensitive
    Like(String),
}

/// All conditions on one field (implicitly ANDed)
#[derive(Debug, Clone)]
pub struct FieldConditions {
    pub field: String,
    pub conditions: Vec<Condition>,
}

/// A planned filter tree
#[derive(Clone)]
pub enum Filter {
    /// Arbitrary predicate; not serializable, so results are never cached
    Func(Arc<dyn Fn(&Record) -> bool + Send + Sync>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// field-condition map (implicit AND across fields)
    Fields(Vec<FieldConditions>),
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Func(_) => write!(f, "Filter::Func(..)"),
            Filter::And(inner) => f.debug_tuple("Filter::And").field(inner).finish(),
            Filter::Or(inner) => f.debug_tuple("Filter::Or").field(inner).finish(),
            Filter::Fields(inner) => f.debug_tuple("Filter::Fields").field(inner).finish(),
        }
    }
}

impl Filter {
    /// A filter from an arbitrary predicate
    pub fn func<F>(predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Filter::Func(Arc::new(predicate))
    }

    /// The match-everything filter (an empty condition map)
    pub fn all() -> Self {
        Filter::Fields(Vec::new())
    }

    /// Shorthand for a single-field equality filter
    pub fn eq(field: &str, value: Value) -> Self {
        Filter::Fields(vec![FieldConditions {
            field: field.to_string(),
            conditions: vec![Condition::Eq(value)],
        }])
    }

    /// Plan a JSON-shaped filter into a filter tree
    pub fn from_value(value: &Value) -> Result<Filter> {
        let obj = value.as_object().ok_or_else(|| {
            StoreError::new(
                ErrorCode::QueryFailed,
                "filter must be a JSON object",
            )
        })?;
        Self::from_object(obj)
    }

    fn from_object(obj: &Map<String, Value>) -> Result<Filter> {
        if let Some(clauses) = obj.get("$and") {
            return Ok(Filter::And(Self::plan_clause_list("$and", clauses)?));
        }
        if let Some(clauses) = obj.get("$or") {
            return Ok(Filter::Or(Self::plan_clause_list("$or", clauses)?));
        }

        let mut fields = Vec::with_capacity(obj.len());
        for (field, spec) in obj {
            if field.starts_with('$') {
                return Err(StoreError::new(
                    ErrorCode::QueryFailed,
                    format!("unsupported filter operator '{}'", field),
                ));
            }
            fields.push(FieldConditions {
                field: field.clone(),
                conditions: Self::plan_conditions(field, spec)?,
            });
        }
        Ok(Filter::Fields(fields))
    }

    fn plan_clause_list(op: &str, clauses: &Value) -> Result<Vec<Filter>> {
        let list = clauses.as_array().ok_or_else(|| {
            StoreError::new(
                ErrorCode::QueryFailed,
                format!("{} expects an array of filters", op),
            )
        })?;
        list.iter().map(Filter::from_value).collect()
    }

    fn plan_conditions(field: &str, spec: &Value) -> Result<Vec<Condition>> {
        let obj = match spec.as_object() {
            Some(obj) if obj.keys().any(|k| k.starts_with('$')) => obj,
            // A bare value (including a plain object) is implicit equality.
            _ => return Ok(vec![Condition::Eq(spec.clone())]),
        };

        let mut conditions = Vec::with_capacity(obj.len());
        for (op, operand) in obj {
            let condition = match op.as_str() {
                "$eq" => Condition::Eq(operand.clone()),
                "$ne" => Condition::Ne(operand.clone()),
                "$gt" => Condition::Gt(operand.clone()),
                "$gte" => Condition::Gte(operand.clone()),
                "$lt" => Condition::Lt(operand.clone()),
                "$lte" => Condition::Lte(operand.clone()),
                "$in" => Condition::In(operand_list(field, op, operand)?),
                "$nin" => Condition::Nin(operand_list(field, op, operand)?),
                "$like" => Condition::Like(
                    operand
                        .as_str()
                        .ok_or_else(|| {
                            StoreError::new(
                                ErrorCode::QueryFailed,
                                format!("$like on '{}' expects a string pattern", field),
                            )
                        })?
                        .to_string(),
                ),
                other => {
                    return Err(StoreError::new(
                        ErrorCode::QueryFailed,
                        format!("unsupported operator '{}' on field '{}'", other, field),
                    ))
                }
            };
            conditions.push(condition);
        }
        Ok(conditions)
    }

    /// Whether a record matches the filter
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Func(predicate) => predicate(record),
            Filter::And(clauses) => clauses.iter().all(|c| c.matches(record)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches(record)),
            Filter::Fields(fields) => fields.iter().all(|fc| {
                let value = record.get(&fc.field);
                fc.conditions.iter().all(|cond| eval(cond, value))
            }),
        }
    }

    /// Serialize back to the JSON filter shape. `None` for predicate
    /// filters, which have no canonical form (and therefore no cache key).
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Filter::Func(_) => None,
            Filter::And(clauses) => {
                let parts: Option<Vec<Value>> = clauses.iter().map(|c| c.to_value()).collect();
                Some(json!({ "$and": parts? }))
            }
            Filter::Or(clauses) => {
                let parts: Option<Vec<Value>> = clauses.iter().map(|c| c.to_value()).collect();
                Some(json!({ "$or": parts? }))
            }
            Filter::Fields(fields) => {
                let mut obj = Map::new();
                for fc in fields {
                    let mut ops = Map::new();
                    for cond in &fc.conditions {
                        let (op, operand) = match cond {
                            Condition::Eq(v) => ("$eq", v.clone()),
                            Condition::Ne(v) => ("$ne", v.clone()),
                            Condition::Gt(v) => ("$gt", v.clone()),
                            Condition::Gte(v) => ("$gte", v.clone()),
                            Condition::Lt(v) => ("$lt", v.clone()),
                            Condition::Lte(v) => ("$lte", v.clone()),
                            Condition::In(v) => ("$in", Value::Array(v.clone())),
                            Condition::Nin(v) => ("$nin", Value::Array(v.clone())),
                            Condition::Like(p) => ("$like", Value::String(p.clone())),
                        };
                        ops.insert(op.to_string(), operand);
                    }
                    obj.insert(fc.field.clone(), Value::Object(ops));
                }
                Some(Value::Object(obj))
            }
        }
    }

    /// When the filter is exactly one `$eq` on one field, expose it so the
    /// reader can consult an index. Composite filters do not qualify.
    pub fn single_field_equality(&self) -> Option<(&str, &Value)> {
        match self {
            Filter::Fields(fields) if fields.len() == 1 => {
                let fc = &fields[0];
                match fc.conditions.as_slice() {
                    [Condition::Eq(value)] => Some((fc.field.as_str(), value)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn operand_list(field: &str, op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| {
            StoreError::new(
                ErrorCode::QueryFailed,
                format!("{} on '{}' expects an array", op, field),
            )
        })
}

/// Ordering comparisons apply only within one type family; a number is
/// never greater than a string.
fn ordered_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_)) => Some(value_cmp(a, b)),
        _ => None,
    }
}

fn eval(condition: &Condition, value: Option<&Value>) -> bool {
    let value = match value {
        Some(v) => v,
        None => {
            // Missing-field rules; see module docs.
            return match condition {
                Condition::Nin(_) => true,
                Condition::Ne(comparand) => !comparand.is_null(),
                _ => false,
            };
        }
    };

    match condition {
        Condition::Eq(comparand) => value_eq(value, comparand),
        Condition::Ne(comparand) => !value_eq(value, comparand),
        Condition::Gt(comparand) => ordered_cmp(value, comparand) == Some(Ordering::Greater),
        Condition::Gte(comparand) => matches!(
            ordered_cmp(value, comparand),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        Condition::Lt(comparand) => ordered_cmp(value, comparand) == Some(Ordering::Less),
        Condition::Lte(comparand) => matches!(
            ordered_cmp(value, comparand),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        Condition::In(list) => list.iter().any(|candidate| value_eq(value, candidate)),
        Condition::Nin(list) => !list.iter().any(|candidate| value_eq(value, candidate)),
        Condition::Like(pattern) => match value.as_str() {
            Some(text) => like_match(text, pattern),
            None => false,
        },
    }
}

/// Case-insensitive `%`-wildcard match. The pattern is split on `%`; the
/// segments must appear in order, anchored at the start/end when the
/// pattern does not begin/end with a wildcard.
fn like_match(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();

    if !pattern.contains('%') {
        return text == pattern;
    }

    let segments: Vec<&str> = pattern.split('%').collect();
    let mut position = 0usize;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        let found = match text[position..].find(segment) {
            Some(offset) => position + offset,
            None => return false,
        };
        // First segment must anchor at the start unless the pattern
        // begins with a wildcard.
        if i == 0 && found != 0 {
            return false;
        }
        position = found + segment.len();
    }

    // Last segment must anchor at the end unless the pattern ends with
    // a wildcard.
    if let Some(last) = segments.last() {
        if !last.is_empty() && !text.ends_with(*last) {
            return false;
        }
    }
    position <= text.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn plan(v: Value) -> Filter {
        Filter::from_value(&v).unwrap()
    }

    #[test]
    fn test_implicit_equality() {
        let filter = plan(json!({"name": "Ada", "age": 36}));
        assert!(filter.matches(&record(json!({"name": "Ada", "age": 36}))));
        assert!(!filter.matches(&record(json!({"name": "Ada", "age": 37}))));
    }

    #[test]
    fn test_comparison_operators() {
        let filter = plan(json!({"age": {"$gte": 21, "$lt": 65}}));
        assert!(filter.matches(&record(json!({"age": 21}))));
        assert!(filter.matches(&record(json!({"age": 64.5}))));
        assert!(!filter.matches(&record(json!({"age": 65}))));
        assert!(!filter.matches(&record(json!({"age": 20}))));
    }

    #[test]
    fn test_ordering_never_crosses_types() {
        let filter = plan(json!({"age": {"$gt": 5}}));
        assert!(!filter.matches(&record(json!({"age": "100"}))));
        assert!(!filter.matches(&record(json!({"age": null}))));
    }

    #[test]
    fn test_strict_type_equality() {
        let filter = plan(json!({"n": 1}));
        assert!(filter.matches(&record(json!({"n": 1.0}))));
        assert!(!filter.matches(&record(json!({"n": "1"}))));
    }

    #[test]
    fn test_in_nin() {
        let filter = plan(json!({"color": {"$in": ["red", "blue"]}}));
        assert!(filter.matches(&record(json!({"color": "red"}))));
        assert!(!filter.matches(&record(json!({"color": "green"}))));

        let filter = plan(json!({"color": {"$nin": ["red", "blue"]}}));
        assert!(filter.matches(&record(json!({"color": "green"}))));
        assert!(!filter.matches(&record(json!({"color": "blue"}))));
    }

    #[test]
    fn test_like_wildcards_case_insensitive() {
        let starts = plan(json!({"name": {"$like": "al%"}}));
        assert!(starts.matches(&record(json!({"name": "Alice"}))));
        assert!(!starts.matches(&record(json!({"name": "Malice"}))));

        let ends = plan(json!({"name": {"$like": "%ce"}}));
        assert!(ends.matches(&record(json!({"name": "ALICE"}))));
        assert!(!ends.matches(&record(json!({"name": "cecil"}))));

        let contains = plan(json!({"name": {"$like": "%lic%"}}));
        assert!(contains.matches(&record(json!({"name": "alice"}))));

        let exact = plan(json!({"name": {"$like": "bob"}}));
        assert!(exact.matches(&record(json!({"name": "BOB"}))));
        assert!(!exact.matches(&record(json!({"name": "bobby"}))));
    }

    #[test]
    fn test_and_or_combinations() {
        let filter = plan(json!({
            "$or": [
                {"role": "admin"},
                {"$and": [{"age": {"$gte": 18}}, {"verified": true}]}
            ]
        }));
        assert!(filter.matches(&record(json!({"role": "admin", "age": 2}))));
        assert!(filter.matches(&record(json!({"role": "user", "age": 30, "verified": true}))));
        assert!(!filter.matches(&record(json!({"role": "user", "age": 30, "verified": false}))));
    }

    #[test]
    fn test_missing_field_semantics() {
        let empty = record(json!({"other": 1}));

        assert!(!plan(json!({"x": {"$eq": 1}})).matches(&empty));
        assert!(!plan(json!({"x": {"$gt": 1}})).matches(&empty));
        assert!(!plan(json!({"x": {"$lte": 1}})).matches(&empty));
        assert!(!plan(json!({"x": {"$in": [1]}})).matches(&empty));
        assert!(!plan(json!({"x": {"$like": "%a%"}})).matches(&empty));

        // The two exceptions: $nin is vacuously true, $ne is true unless
        // the comparand is null.
        assert!(plan(json!({"x": {"$nin": [1, 2]}})).matches(&empty));
        assert!(plan(json!({"x": {"$ne": 1}})).matches(&empty));
        assert!(!plan(json!({"x": {"$ne": null}})).matches(&empty));
    }

    #[test]
    fn test_predicate_filter() {
        let filter = Filter::func(|r| r.get("n").and_then(|v| v.as_i64()).unwrap_or(0) % 2 == 0);
        assert!(filter.matches(&record(json!({"n": 4}))));
        assert!(!filter.matches(&record(json!({"n": 3}))));
        assert!(filter.to_value().is_none());
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = plan(json!({}));
        assert!(filter.matches(&record(json!({"anything": 1}))));
    }

    #[test]
    fn test_single_field_equality_extraction() {
        let filter = plan(json!({"name": "Ada"}));
        let (field, value) = filter.single_field_equality().unwrap();
        assert_eq!(field, "name");
        assert_eq!(value, &json!("Ada"));

        assert!(plan(json!({"a": 1, "b": 2})).single_field_equality().is_none());
        assert!(plan(json!({"a": {"$gt": 1}})).single_field_equality().is_none());
    }

    #[test]
    fn test_round_trip_to_value() {
        let source = json!({"age": {"$gte": 21}, "name": {"$eq": "Ada"}});
        let filter = plan(source);
        let serialized = filter.to_value().unwrap();
        let replanned = Filter::from_value(&serialized).unwrap();

        let r = record(json!({"age": 30, "name": "Ada"}));
        assert_eq!(filter.matches(&r), replanned.matches(&r));
    }

    #[test]
    fn test_unknown_operator_is_query_failed() {
        let err = Filter::from_value(&json!({"x": {"$regex": "a"}})).unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryFailed);
    }
}
