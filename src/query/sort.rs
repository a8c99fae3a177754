//! Multi-algorithm stable sort
//!
//! All algorithms produce the same ordering: multi-field, per-field
//! direction, nulls first (a missing field sorts as null), and stable for
//! equal keys. The only difference is how they get there:
//!
//! - `default`: the standard library's stable sort, for small inputs
//! - `counting`: bucket sort on one field, for low-cardinality keys
//! - `merge`: bottom-up merge sort, for large or multi-field sorts
//! - `fast`: key-precomputing variant of the stable sort
//! - `slow`: binary insertion sort, kept for diagnostics baselines
//!
//! `Auto` picks by input size and sampled key cardinality.

use std::cmp::Ordering;

use serde_json::Value;

use crate::types::{value_cmp, Record};

/// Per-field sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Asc
    }
}

/// One field of a multi-field sort
#[derive(Debug, Clone)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

impl SortField {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Desc,
        }
    }
}

/// Which sort implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortAlgorithm {
    /// Choose by size and cardinality
    Auto,
    Default,
    Counting,
    Merge,
    Fast,
    Slow,
}

impl Default for SortAlgorithm {
    fn default() -> Self {
        SortAlgorithm::Auto
    }
}

impl SortAlgorithm {
    /// Parse the wire name (`"counting"`, `"merge"`, ...)
    pub fn parse(name: &str) -> Option<SortAlgorithm> {
        match name {
            "auto" => Some(SortAlgorithm::Auto),
            "default" => Some(SortAlgorithm::Default),
            "counting" => Some(SortAlgorithm::Counting),
            "merge" => Some(SortAlgorithm::Merge),
            "fast" => Some(SortAlgorithm::Fast),
            "slow" => Some(SortAlgorithm::Slow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortAlgorithm::Auto => "auto",
            SortAlgorithm::Default => "default",
            SortAlgorithm::Counting => "counting",
            SortAlgorithm::Merge => "merge",
            SortAlgorithm::Fast => "fast",
            SortAlgorithm::Slow => "slow",
        }
    }
}

/// Inputs below this length always take the standard sort
const SMALL_INPUT: usize = 100;
/// Counting sort applies when sampled distinct keys are under this share
const CARDINALITY_RATIO: f64 = 0.10;
/// How many records to sample for the cardinality estimate
const CARDINALITY_SAMPLE: usize = 128;

fn field_value<'a>(record: &'a Record, field: &str) -> &'a Value {
    record.get(field).unwrap_or(&Value::Null)
}

/// Compare two records on the sort fields, nulls first per field
pub fn record_cmp(a: &Record, b: &Record, fields: &[SortField]) -> Ordering {
    for sort_field in fields {
        let ordering = value_cmp(
            field_value(a, &sort_field.field),
            field_value(b, &sort_field.field),
        );
        let ordering = match sort_field.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Sort records in place with the requested algorithm
pub fn sort_records(records: &mut Vec<Record>, fields: &[SortField], algorithm: SortAlgorithm) {
    if fields.is_empty() || records.len() < 2 {
        return;
    }

    let algorithm = match algorithm {
        SortAlgorithm::Auto => choose_algorithm(records, fields),
        explicit => explicit,
    };

    match algorithm {
        SortAlgorithm::Default | SortAlgorithm::Auto => {
            records.sort_by(|a, b| record_cmp(a, b, fields));
        }
        SortAlgorithm::Counting => counting_sort(records, fields),
        SortAlgorithm::Merge => merge_sort(records, fields),
        SortAlgorithm::Fast => fast_sort(records, fields),
        SortAlgorithm::Slow => insertion_sort(records, fields),
    }
}

/// Size/cardinality heuristic for `Auto`
fn choose_algorithm(records: &[Record], fields: &[SortField]) -> SortAlgorithm {
    if records.len() < SMALL_INPUT {
        return SortAlgorithm::Default;
    }
    if fields.len() == 1 {
        let sample = records.len().min(CARDINALITY_SAMPLE);
        let mut seen: Vec<&Value> = Vec::new();
        for record in &records[..sample] {
            let value = field_value(record, &fields[0].field);
            if !seen.iter().any(|v| value_cmp(v, value) == Ordering::Equal) {
                seen.push(value);
            }
        }
        if (seen.len() as f64) < (sample as f64) * CARDINALITY_RATIO {
            return SortAlgorithm::Counting;
        }
    }
    SortAlgorithm::Merge
}

/// Bucket sort on the first field: collect distinct keys, order them, then
/// emit buckets in key order. In-bucket order is the input order, so the
/// result is stable. Remaining fields fall back to a stable sort first.
fn counting_sort(records: &mut Vec<Record>, fields: &[SortField]) {
    if fields.len() > 1 {
        // Counting is a single-field algorithm; pre-order by the rest.
        records.sort_by(|a, b| record_cmp(a, b, &fields[1..]));
    }
    let sort_field = &fields[0];

    let mut buckets: Vec<(Value, Vec<Record>)> = Vec::new();
    for record in records.drain(..) {
        let key = field_value(&record, &sort_field.field).clone();
        match buckets
            .iter_mut()
            .find(|(k, _)| value_cmp(k, &key) == Ordering::Equal)
        {
            Some((_, bucket)) => bucket.push(record),
            None => buckets.push((key, vec![record])),
        }
    }

    buckets.sort_by(|(a, _), (b, _)| {
        let ordering = value_cmp(a, b);
        match sort_field.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });

    for (_, bucket) in buckets {
        records.extend(bucket);
    }
}

/// Bottom-up stable merge sort
fn merge_sort(records: &mut Vec<Record>, fields: &[SortField]) {
    let len = records.len();
    if len < 2 {
        return;
    }

    let mut source: Vec<Record> = std::mem::take(records);
    let mut scratch: Vec<Record> = Vec::with_capacity(len);
    let mut width = 1usize;

    while width < len {
        let mut start = 0usize;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);

            let (mut left, mut right) = (start, mid);
            while left < mid && right < end {
                // `<=` keeps equal keys in left-run order: stability.
                if record_cmp(&source[left], &source[right], fields) != Ordering::Greater {
                    scratch.push(source[left].clone());
                    left += 1;
                } else {
                    scratch.push(source[right].clone());
                    right += 1;
                }
            }
            scratch.extend_from_slice(&source[left..mid]);
            scratch.extend_from_slice(&source[right..end]);
            start = end;
        }
        std::mem::swap(&mut source, &mut scratch);
        scratch.clear();
        width *= 2;
    }
    *records = source;
}

/// Precompute the key values once, sort an index vector, then permute.
/// Same ordering as `default`, cheaper comparisons for wide records.
fn fast_sort(records: &mut Vec<Record>, fields: &[SortField]) {
    let keys: Vec<Vec<Value>> = records
        .iter()
        .map(|r| {
            fields
                .iter()
                .map(|f| field_value(r, &f.field).clone())
                .collect()
        })
        .collect();

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        for (i, sort_field) in fields.iter().enumerate() {
            let ordering = value_cmp(&keys[a][i], &keys[b][i]);
            let ordering = match sort_field.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    let mut sorted = Vec::with_capacity(records.len());
    for index in order {
        sorted.push(records[index].clone());
    }
    *records = sorted;
}

/// Binary insertion sort; quadratic moves, kept as a diagnostics baseline
fn insertion_sort(records: &mut Vec<Record>, fields: &[SortField]) {
    for i in 1..records.len() {
        let mut lo = 0usize;
        let mut hi = i;
        while lo < hi {
            let mid = (lo + hi) / 2;
            // Insert after equal keys: stability.
            if record_cmp(&records[i], &records[mid], fields) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        records[lo..=i].rotate_right(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn names(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string())
            .collect()
    }

    fn sample() -> Vec<Record> {
        vec![
            record(json!({"name": "c", "age": 30, "seq": 0})),
            record(json!({"name": "a", "age": 30, "seq": 1})),
            record(json!({"name": "b", "age": 20, "seq": 2})),
            record(json!({"name": "d", "seq": 3})),
            record(json!({"name": "e", "age": 20, "seq": 4})),
        ]
    }

    const ALL: [SortAlgorithm; 5] = [
        SortAlgorithm::Default,
        SortAlgorithm::Counting,
        SortAlgorithm::Merge,
        SortAlgorithm::Fast,
        SortAlgorithm::Slow,
    ];

    #[test]
    fn test_all_algorithms_agree_single_field() {
        for algorithm in ALL {
            let mut records = sample();
            sort_records(&mut records, &[SortField::asc("age")], algorithm);
            // Missing age sorts first (nulls first), then 20s in input
            // order, then 30s in input order.
            assert_eq!(
                names(&records),
                vec!["d", "b", "e", "c", "a"],
                "algorithm {:?}",
                algorithm
            );
        }
    }

    #[test]
    fn test_all_algorithms_agree_descending() {
        for algorithm in ALL {
            let mut records = sample();
            sort_records(&mut records, &[SortField::desc("age")], algorithm);
            assert_eq!(
                names(&records),
                vec!["c", "a", "b", "e", "d"],
                "algorithm {:?}",
                algorithm
            );
        }
    }

    #[test]
    fn test_stability_preserves_input_order_on_ties() {
        for algorithm in ALL {
            let mut records: Vec<Record> = (0..50)
                .map(|i| record(json!({"name": format!("r{}", i), "key": i % 3, "seq": i})))
                .collect();
            sort_records(&mut records, &[SortField::asc("key")], algorithm);

            let mut last_seq_per_key = std::collections::HashMap::new();
            for r in &records {
                let key = r["key"].as_i64().unwrap();
                let seq = r["seq"].as_i64().unwrap();
                if let Some(prev) = last_seq_per_key.insert(key, seq) {
                    assert!(prev < seq, "algorithm {:?} broke stability", algorithm);
                }
            }
        }
    }

    #[test]
    fn test_multi_field_sort() {
        for algorithm in [SortAlgorithm::Default, SortAlgorithm::Merge, SortAlgorithm::Fast] {
            let mut records = sample();
            sort_records(
                &mut records,
                &[SortField::asc("age"), SortField::desc("name")],
                algorithm,
            );
            assert_eq!(
                names(&records),
                vec!["d", "e", "b", "c", "a"],
                "algorithm {:?}",
                algorithm
            );
        }
    }

    #[test]
    fn test_auto_picks_counting_for_low_cardinality() {
        let records: Vec<Record> = (0..500)
            .map(|i| record(json!({"name": format!("r{}", i), "status": i % 3})))
            .collect();
        assert_eq!(
            choose_algorithm(&records, &[SortField::asc("status")]),
            SortAlgorithm::Counting
        );
    }

    #[test]
    fn test_auto_picks_default_for_small_and_merge_for_large() {
        let small: Vec<Record> = (0..10).map(|i| record(json!({"v": i}))).collect();
        assert_eq!(
            choose_algorithm(&small, &[SortField::asc("v")]),
            SortAlgorithm::Default
        );

        let large: Vec<Record> = (0..500).map(|i| record(json!({"v": i}))).collect();
        assert_eq!(
            choose_algorithm(&large, &[SortField::asc("v")]),
            SortAlgorithm::Merge
        );
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in ALL {
            assert_eq!(SortAlgorithm::parse(algorithm.as_str()), Some(algorithm));
        }
        assert_eq!(SortAlgorithm::parse("bogus"), None);
    }
}
