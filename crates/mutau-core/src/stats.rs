use std::iter::Sum;

use accurate::{sum::Klein, traits::*};
use auto_ops::impl_op_ex;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{MutauError, MutauResult};

/// What to accumulate for one named statistic.
#[derive(Debug, Clone, Copy)]
pub enum Weight<'a> {
    /// Count every event.
    Count,
    /// Count the events where the mask is true.
    CountMasked(&'a [bool]),
    /// Sum a per-event value over every event.
    Values(&'a [f64]),
    /// Sum a per-event value over the events where the mask is true.
    ValuesMasked(&'a [f64], &'a [bool]),
}

impl Weight<'_> {
    fn check(&self, name: &str, n_events: usize) -> MutauResult<()> {
        let lengths = match self {
            Weight::Count => vec![],
            Weight::CountMasked(mask) => vec![mask.len()],
            Weight::Values(values) => vec![values.len()],
            Weight::ValuesMasked(values, mask) => vec![values.len(), mask.len()],
        };
        match lengths.iter().find(|&&len| len != n_events) {
            Some(&actual) => Err(MutauError::LengthMismatch {
                context: format!("weight \"{name}\""),
                expected: n_events,
                actual,
            }),
            None => Ok(()),
        }
    }

    fn value(&self, event: usize) -> f64 {
        match self {
            Weight::Count => 1.0,
            Weight::CountMasked(mask) => {
                if mask[event] {
                    1.0
                } else {
                    0.0
                }
            }
            Weight::Values(values) => values[event],
            Weight::ValuesMasked(values, mask) => {
                if mask[event] {
                    values[event]
                } else {
                    0.0
                }
            }
        }
    }

    fn total(&self, n_events: usize) -> f64 {
        (0..n_events)
            .map(|event| self.value(event))
            .sum_with_accumulator::<Klein<f64>>()
    }
}

/// Named statistics to accumulate, in insertion order.
pub type WeightMap<'a> = IndexMap<String, Weight<'a>>;

/// Named per-event integer keys (e.g. `process` → `process_id`) used to stratify the sums.
pub type GroupMap<'a> = IndexMap<String, &'a [i64]>;

/// Accumulated event counts and weight sums, inclusive and per group key.
///
/// Merging two accumulators with `+` is commutative and associative, so the statistics of
/// independently processed batches may be reduced in any order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionStats {
    /// Inclusive sums by statistic name
    pub sums: IndexMap<String, f64>,
    /// Sums by `"<statistic>_per_<group>"`, then by group key
    pub grouped: IndexMap<String, IndexMap<i64, f64>>,
}

impl SelectionStats {
    /// Name of the stratified entry of a statistic.
    pub fn grouped_name(weight: &str, group: &str) -> String {
        format!("{weight}_per_{group}")
    }

    /// Inclusive value of a statistic (zero if never incremented).
    pub fn get(&self, name: &str) -> f64 {
        self.sums.get(name).copied().unwrap_or(0.0)
    }

    /// Value of a statistic for one key of a group (zero if never incremented).
    pub fn get_grouped(&self, weight: &str, group: &str, key: i64) -> f64 {
        self.grouped
            .get(&Self::grouped_name(weight, group))
            .and_then(|keys| keys.get(&key))
            .copied()
            .unwrap_or(0.0)
    }

    /// Whether nothing was accumulated.
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty() && self.grouped.is_empty()
    }

    fn merge(&mut self, other: &SelectionStats) {
        for (name, value) in &other.sums {
            *self.sums.entry(name.clone()).or_insert(0.0) += value;
        }
        for (name, keys) in &other.grouped {
            let entry = self.grouped.entry(name.clone()).or_default();
            for (key, value) in keys {
                *entry.entry(*key).or_insert(0.0) += value;
            }
        }
    }
}

impl_op_ex!(+ |a: &SelectionStats, b: &SelectionStats| -> SelectionStats {
    let mut merged = a.clone();
    merged.merge(b);
    merged
});

impl_op_ex!(+= |a: &mut SelectionStats, b: &SelectionStats| { a.merge(b) });

impl Sum for SelectionStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(SelectionStats::default(), |acc, stats| acc + stats)
    }
}

/// Add the statistics of one batch of `n_events` events to `stats`.
///
/// Every weight is summed over the batch and, for each group, separately for every distinct
/// key value that appears in the batch.
pub fn increment_stats(
    stats: &mut SelectionStats,
    n_events: usize,
    weights: &WeightMap,
    groups: &GroupMap,
) -> MutauResult<()> {
    for (name, weight) in weights {
        weight.check(name, n_events)?;
    }
    for (group, keys) in groups {
        if keys.len() != n_events {
            return Err(MutauError::LengthMismatch {
                context: format!("group \"{group}\""),
                expected: n_events,
                actual: keys.len(),
            });
        }
    }
    let mut batch = SelectionStats::default();
    for (name, weight) in weights {
        batch.sums.insert(name.clone(), weight.total(n_events));
        for (group, keys) in groups {
            let mut per_key: IndexMap<i64, Vec<f64>> = IndexMap::new();
            for (event, key) in keys.iter().enumerate() {
                per_key.entry(*key).or_default().push(weight.value(event));
            }
            batch.grouped.insert(
                SelectionStats::grouped_name(name, group),
                per_key
                    .into_iter()
                    .map(|(key, values)| {
                        (key, values.into_iter().sum_with_accumulator::<Klein<f64>>())
                    })
                    .collect(),
            );
        }
    }
    *stats += batch;
    Ok(())
}
