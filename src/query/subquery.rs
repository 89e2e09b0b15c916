//! Subquery limiting
//!
//! The document store expands every `IN` filter into one subquery per value
//! and multiplies them together, and it refuses to run more than
//! `SUBQUERY_CEILING` subqueries. Queries over that ceiling are split: the
//! largest `IN` filters are taken out of the native query and applied in
//! memory afterwards.

use super::{Filter, FilterOp};
use crate::entity::Record;

/// Most subqueries one native query may expand into.
pub const SUBQUERY_CEILING: usize = 30;

/// Filters a query was split into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitFilters {
    /// Sent to the store
    pub native: Vec<Filter>,
    /// Applied to the store's results in memory
    pub post: Vec<Filter>,
}

impl SplitFilters {
    pub fn needs_post_filter(&self) -> bool {
        !self.post.is_empty()
    }
}

/// Product of the sizes of every `IN` filter.
pub fn fan_out(filters: &[Filter]) -> usize {
    filters
        .iter()
        .filter(|f| matches!(f.op, FilterOp::In(_)))
        .fold(1usize, |acc, f| acc.saturating_mul(f.fan_out()))
}

/// Split filters so the native part stays under the subquery ceiling.
///
/// `IN` filters are visited largest first. While the running product is
/// still at or above the ceiling the filter is moved to the post filter,
/// and the product is divided by its size either way.
pub fn limit_subqueries(filters: Vec<Filter>) -> SplitFilters {
    let total = fan_out(&filters);
    let (mut in_filters, mut native): (Vec<Filter>, Vec<Filter>) = filters
        .into_iter()
        .partition(|f| matches!(f.op, FilterOp::In(_)));

    if total <= SUBQUERY_CEILING {
        native.append(&mut in_filters);
        return SplitFilters {
            native,
            post: Vec::new(),
        };
    }

    in_filters.sort_by(|a, b| b.fan_out().cmp(&a.fan_out()));
    let mut post = Vec::new();
    let mut remaining = total;
    for filter in in_filters {
        let size = filter.fan_out().max(1);
        if remaining < SUBQUERY_CEILING {
            native.push(filter);
        } else {
            post.push(filter);
        }
        remaining /= size;
    }

    tracing::info!(
        "Filters would generate {} subqueries; post-filtering on {}",
        total,
        post.iter().map(|f| f.property.as_str()).collect::<Vec<_>>().join(", ")
    );
    SplitFilters { native, post }
}

/// Keep the records matching every post filter, in their original order.
pub fn post_filter(records: Vec<Record>, filters: &[Filter]) -> Vec<Record> {
    if filters.is_empty() {
        return records;
    }
    let before = records.len();
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|r| filters.iter().all(|f| f.matches(r)))
        .collect();
    tracing::info!(
        "Post-filtered {} results down to {} on {} filters",
        before,
        kept.len(),
        filters.len()
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::Uid;
    use crate::value::{Properties, Value};
    use proptest::prelude::*;

    fn ints(n: i64) -> Vec<Value> {
        (0..n).map(Value::Int).collect()
    }

    #[test]
    fn test_small_fan_out_stays_native() {
        let split = limit_subqueries(vec![
            Filter::is_in("a", ints(2)),
            Filter::is_in("b", ints(3)),
            Filter::eq("c", "x"),
        ]);
        assert_eq!(split.native.len(), 3);
        assert!(!split.needs_post_filter());
    }

    #[test]
    fn test_large_fan_out_demotes_largest() {
        let split = limit_subqueries(vec![
            Filter::is_in("a", ints(5)),
            Filter::is_in("b", ints(8)),
        ]);
        assert_eq!(split.post.len(), 1);
        assert_eq!(split.post[0].property, "b");
        assert_eq!(split.native.len(), 1);
        assert_eq!(split.native[0].property, "a");
        assert!(fan_out(&split.native) <= SUBQUERY_CEILING);
    }

    #[test]
    fn test_exactly_at_ceiling_stays_native() {
        let split = limit_subqueries(vec![
            Filter::is_in("a", ints(5)),
            Filter::is_in("b", ints(6)),
        ]);
        assert!(split.post.is_empty());
    }

    #[test]
    fn test_single_huge_list_is_demoted() {
        let split = limit_subqueries(vec![Filter::is_in("uid", ints(40)), Filter::eq("c", 1i64)]);
        assert_eq!(split.post.len(), 1);
        assert_eq!(split.native, vec![Filter::eq("c", 1i64)]);
    }

    #[test]
    fn test_post_filter_keeps_order() {
        let records: Vec<Record> = (0..6)
            .map(|i| {
                let mut r = Record::new(Uid::parse(&format!("Widget_w{}", i)).unwrap(), Properties::new());
                r.set("n", i as i64);
                r
            })
            .collect();
        let kept = post_filter(records, &[Filter::is_in("n", [Value::Int(4), Value::Int(1), Value::Int(3)])]);
        let ids: Vec<&str> = kept.iter().map(|r| r.uid().local_id()).collect();
        assert_eq!(ids, vec!["w1", "w3", "w4"]);
    }

    fn record_strategy() -> impl Strategy<Value = Vec<(i64, i64, i64)>> {
        proptest::collection::vec((0..10i64, 0..10i64, 0..10i64), 0..60)
    }

    fn in_filter(name: &'static str) -> impl Strategy<Value = Filter> {
        proptest::collection::vec(0..10i64, 1..10)
            .prop_map(move |vals| Filter::is_in(name, vals.into_iter().map(Value::Int)))
    }

    proptest! {
        #[test]
        fn prop_split_equals_unsplit(
            rows in record_strategy(),
            fa in in_filter("a"),
            fb in in_filter("b"),
            fc in in_filter("c"),
        ) {
            let records: Vec<Record> = rows
                .iter()
                .enumerate()
                .map(|(i, (a, b, c))| {
                    let mut r = Record::new(Uid::parse(&format!("Row_r{}", i)).unwrap(), Properties::new());
                    r.set("a", *a);
                    r.set("b", *b);
                    r.set("c", *c);
                    r
                })
                .collect();
            let filters = vec![fa, fb, fc];

            let expected: Vec<Record> = records
                .iter()
                .filter(|r| filters.iter().all(|f| f.matches(r)))
                .cloned()
                .collect();

            let split = limit_subqueries(filters.clone());
            prop_assert!(fan_out(&split.native) <= SUBQUERY_CEILING);
            prop_assert_eq!(split.native.len() + split.post.len(), filters.len());

            let native: Vec<Record> = records
                .into_iter()
                .filter(|r| split.native.iter().all(|f| f.matches(r)))
                .collect();
            prop_assert_eq!(post_filter(native, &split.post), expected);
        }
    }
}
