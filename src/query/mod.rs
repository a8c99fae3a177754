//! Query engine
//!
//! Filtering, sorting, pagination and aggregation over in-memory record
//! arrays. The engine's read path funnels every query through
//! [`apply_read_options`], so filter semantics, sort stability and the
//! pagination short-circuits hold identically for cached and uncached
//! reads.

pub mod aggregate;
pub mod filter;
pub mod sort;

pub use aggregate::{avg, group_by, max, min, paginate, sum, Group};
pub use filter::{Condition, FieldConditions, Filter};
pub use sort::{sort_records, SortAlgorithm, SortField, SortOrder};

use serde_json::json;

use crate::types::Record;

/// Options for a read: filter, sort, window, cache behavior
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub filter: Option<Filter>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort_by: Vec<SortField>,
    pub sort_algorithm: SortAlgorithm,
    /// Skip the cache for this read
    pub bypass_cache: bool,
}

impl ReadOptions {
    /// Read everything, no filter, storage order
    pub fn all() -> Self {
        Self::default()
    }

    /// Read with just a filter
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    /// Stable fingerprint for cache keys. `None` when the options contain
    /// a predicate filter, which has no canonical serialization; such
    /// reads are never cached.
    pub fn fingerprint(&self) -> Option<String> {
        let filter = match &self.filter {
            Some(f) => Some(f.to_value()?),
            None => None,
        };
        let sort: Vec<serde_json::Value> = self
            .sort_by
            .iter()
            .map(|s| {
                json!({
                    "field": s.field,
                    "order": match s.order {
                        SortOrder::Asc => "asc",
                        SortOrder::Desc => "desc",
                    }
                })
            })
            .collect();
        Some(
            json!({
                "filter": filter,
                "skip": self.skip,
                "limit": self.limit,
                "sort": sort,
                "algorithm": self.sort_algorithm.as_str(),
            })
            .to_string(),
        )
    }
}

/// Run the full pipeline: filter, sort, paginate.
///
/// Without an explicit sort the storage order is preserved, except when a
/// pagination window is requested: then records are ordered by `id`
/// ascending so that successive pages are deterministic.
pub fn apply_read_options(mut records: Vec<Record>, options: &ReadOptions) -> Vec<Record> {
    if let Some(filter) = &options.filter {
        records.retain(|r| filter.matches(r));
    }

    if !options.sort_by.is_empty() {
        sort_records(&mut records, &options.sort_by, options.sort_algorithm);
    } else if options.skip > 0 || options.limit.is_some() {
        sort_records(&mut records, &[SortField::asc("id")], options.sort_algorithm);
    }

    paginate(records, options.skip, options.limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn sample() -> Vec<Record> {
        vec![
            record(json!({"id": 3, "name": "c", "active": true})),
            record(json!({"id": 1, "name": "a", "active": false})),
            record(json!({"id": 2, "name": "b", "active": true})),
        ]
    }

    #[test]
    fn test_plain_read_preserves_storage_order() {
        let out = apply_read_options(sample(), &ReadOptions::all());
        let ids: Vec<i64> = out.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_pagination_defaults_to_id_order() {
        let options = ReadOptions {
            limit: Some(2),
            ..Default::default()
        };
        let out = apply_read_options(sample(), &options);
        let ids: Vec<i64> = out.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_filter_then_sort_then_page() {
        let options = ReadOptions {
            filter: Some(Filter::from_value(&json!({"active": true})).unwrap()),
            sort_by: vec![SortField::desc("name")],
            skip: 1,
            ..Default::default()
        };
        let out = apply_read_options(sample(), &options);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["name"], json!("b"));
    }

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let a = ReadOptions {
            filter: Some(Filter::from_value(&json!({"x": 1})).unwrap()),
            skip: 5,
            ..Default::default()
        };
        let b = ReadOptions {
            filter: Some(Filter::from_value(&json!({"x": 1})).unwrap()),
            skip: 5,
            ..Default::default()
        };
        let c = ReadOptions {
            filter: Some(Filter::from_value(&json!({"x": 2})).unwrap()),
            skip: 5,
            ..Default::default()
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_refuses_predicate_filters() {
        let options = ReadOptions {
            filter: Some(Filter::func(|_| true)),
            ..Default::default()
        };
        assert!(options.fingerprint().is_none());
    }
}
