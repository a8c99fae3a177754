//! Pagination and aggregation
//!
//! Numeric aggregates skip nulls and non-numeric values; `min`/`max` rank
//! any value by the store's total order. Empty input yields the numeric
//! identities (sum = 0, avg = 0) and `None` for min/max.

use std::cmp::Ordering;

use serde_json::Value;

use crate::types::{value_cmp, value_eq, Record};

/// Apply `skip` and optional `limit`. Short-circuits: a skip past the end
/// returns empty, and skip 0 with a covering limit returns the input
/// unchanged.
pub fn paginate(records: Vec<Record>, skip: usize, limit: Option<usize>) -> Vec<Record> {
    if skip >= records.len() {
        return Vec::new();
    }
    if skip == 0 && limit.map(|l| l >= records.len()).unwrap_or(true) {
        return records;
    }
    records
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn numeric(record: &Record, field: &str) -> Option<f64> {
    record.get(field).and_then(Value::as_f64)
}

/// Sum of the numeric values of `field`; 0 for empty input
pub fn sum(records: &[Record], field: &str) -> f64 {
    records.iter().filter_map(|r| numeric(r, field)).sum()
}

/// Average of the numeric values of `field`; 0 when no value is numeric
pub fn avg(records: &[Record], field: &str) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for record in records {
        if let Some(n) = numeric(record, field) {
            total += n;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Smallest present value of `field` under the total order
pub fn min(records: &[Record], field: &str) -> Option<Value> {
    extreme(records, field, Ordering::Less)
}

/// Largest present value of `field` under the total order
pub fn max(records: &[Record], field: &str) -> Option<Value> {
    extreme(records, field, Ordering::Greater)
}

fn extreme(records: &[Record], field: &str, keep: Ordering) -> Option<Value> {
    let mut best: Option<&Value> = None;
    for record in records {
        if let Some(value) = record.get(field) {
            match best {
                Some(current) if value_cmp(value, current) != keep => {}
                _ => best = Some(value),
            }
        }
    }
    best.cloned()
}

/// One group produced by [`group_by`]
#[derive(Debug, Clone)]
pub struct Group {
    /// The grouping-field values, in field order
    pub key: Vec<Value>,
    pub records: Vec<Record>,
}

/// Group records by one or more fields, preserving first-seen group order
/// and in-group record order. A missing field groups as null.
pub fn group_by(records: &[Record], fields: &[&str]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for record in records {
        let key: Vec<Value> = fields
            .iter()
            .map(|f| record.get(*f).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|g| {
            g.key.len() == key.len() && g.key.iter().zip(&key).all(|(a, b)| value_eq(a, b))
        }) {
            Some(group) => group.records.push(record.clone()),
            None => groups.push(Group {
                key,
                records: vec![record.clone()],
            }),
        }
    }
    groups
}
