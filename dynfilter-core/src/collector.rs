use crate::channel::Channel;
use crate::predicate::Domain;
use crate::value::{read_native_value, NativeValue};
use arrow::record_batch::RecordBatch;
use dynfilter_common::{DynamicFilterError, FilterScope, Result};
use std::collections::HashSet;

// per distinct value: one copy in the index, one in the buffer, plus bucket slack
const HASH_ENTRY_OVERHEAD: usize = 16;

/// Budgets gating exact collection, summed across all channels of a lane.
#[derive(Debug, Clone, Copy)]
pub struct CollectorLimits {
    pub max_positions: usize,
    pub max_size_bytes: u64,
}

/// Deduplicating accumulator with an append-only buffer in first-seen order.
#[derive(Debug, Default)]
pub struct TypedValueSet {
    index: HashSet<NativeValue>,
    values: Vec<NativeValue>,
    retained_bytes: usize,
}

impl TypedValueSet {
    pub fn add(&mut self, v: NativeValue) -> bool {
        if self.index.contains(&v) {
            return false;
        }
        self.retained_bytes += v.estimated_size() * 2 + HASH_ENTRY_OVERHEAD;
        self.values.push(v.clone());
        self.index.insert(v);
        true
    }

    pub fn contains(&self, v: &NativeValue) -> bool {
        self.index.contains(v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    pub fn values(&self) -> &[NativeValue] {
        &self.values
    }
}

#[derive(Debug)]
enum ExactState {
    Collecting(Vec<TypedValueSet>),
    Overflowed,
}

#[derive(Debug)]
enum DistributedState {
    Collecting(Vec<HashSet<String>>),
    Abandoned,
}

/// Why a lane stopped exact collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowCause {
    NullValue,
    TooManyPositions,
    TooManyBytes,
}

/// Per-lane build-side accumulator covering every channel of the operator.
///
/// Two tracks run side by side: an exact typed set per channel (filled only
/// for local scope) and a string-form set per channel used for distributed
/// publication. Local scope budgets the exact track only; global scope
/// budgets the string-form track by position count.
#[derive(Debug)]
pub struct ValueCollector {
    scope: FilterScope,
    limits: CollectorLimits,
    exact: ExactState,
    distributed: DistributedState,
    positions_seen: usize,
    retained_bytes: u64,
    overflow_cause: Option<OverflowCause>,
}

impl ValueCollector {
    pub fn new(channel_count: usize, scope: FilterScope, limits: CollectorLimits) -> Self {
        Self {
            scope,
            limits,
            exact: ExactState::Collecting(
                (0..channel_count).map(|_| TypedValueSet::default()).collect(),
            ),
            distributed: DistributedState::Collecting(
                (0..channel_count).map(|_| HashSet::new()).collect(),
            ),
            positions_seen: 0,
            retained_bytes: 0,
            overflow_cause: None,
        }
    }

    /// Folds one page into the accumulators, then applies the budgets.
    pub fn offer(&mut self, page: &RecordBatch, channels: &[Channel]) -> Result<()> {
        if self.is_overflowed() && !self.is_publishable() {
            return Ok(());
        }
        for (channel_idx, channel) in channels.iter().enumerate() {
            let column = page.columns().get(channel.source_index).ok_or_else(|| {
                DynamicFilterError::InvalidChannels(format!(
                    "channel {} reads column {} but page has {}",
                    channel.filter_id,
                    channel.source_index,
                    page.num_columns()
                ))
            })?;
            for row in 0..column.len() {
                let Some(value) = read_native_value(column.as_ref(), row)? else {
                    // a finite allow-list can't express null; nulls never join, so
                    // the string track simply leaves them out
                    self.overflow(OverflowCause::NullValue);
                    continue;
                };
                let exact = match &mut self.exact {
                    ExactState::Collecting(sets) if self.scope == FilterScope::Local => {
                        Some(&mut sets[channel_idx])
                    }
                    _ => None,
                };
                // both tracks hold the same values while exact collection runs
                if exact.as_ref().is_some_and(|set| set.contains(&value)) {
                    continue;
                }
                if let DistributedState::Collecting(sets) = &mut self.distributed {
                    sets[channel_idx].insert(value.to_filter_string());
                }
                if let Some(set) = exact {
                    set.add(value);
                }
            }
        }
        self.check_limits();
        Ok(())
    }

    fn check_limits(&mut self) {
        match self.scope {
            FilterScope::Local => {
                let ExactState::Collecting(sets) = &self.exact else {
                    return;
                };
                self.positions_seen = sets.iter().map(TypedValueSet::len).sum();
                self.retained_bytes = sets.iter().map(|s| s.retained_bytes() as u64).sum();
                if self.positions_seen > self.limits.max_positions {
                    self.overflow(OverflowCause::TooManyPositions);
                } else if self.retained_bytes > self.limits.max_size_bytes {
                    self.overflow(OverflowCause::TooManyBytes);
                }
            }
            FilterScope::Global => {
                let DistributedState::Collecting(sets) = &self.distributed else {
                    return;
                };
                self.positions_seen = sets.iter().map(HashSet::len).sum();
                if self.positions_seen > self.limits.max_positions {
                    self.overflow(OverflowCause::TooManyPositions);
                    self.distributed = DistributedState::Abandoned;
                }
            }
        }
    }

    fn overflow(&mut self, cause: OverflowCause) {
        if self.overflow_cause.is_none() {
            self.overflow_cause = Some(cause);
        }
        self.exact = ExactState::Overflowed;
    }

    /// True once local exact filtering has been abandoned; never reverts.
    pub fn is_overflowed(&self) -> bool {
        matches!(self.exact, ExactState::Overflowed)
    }

    pub fn overflow_cause(&self) -> Option<OverflowCause> {
        self.overflow_cause
    }

    /// True while the string-form track may still be published.
    pub fn is_publishable(&self) -> bool {
        matches!(self.distributed, DistributedState::Collecting(_))
    }

    pub fn positions_seen(&self) -> usize {
        self.positions_seen
    }

    pub fn retained_bytes(&self) -> u64 {
        self.retained_bytes
    }

    /// Admissible values for one channel, sorted and deduplicated.
    pub fn materialize_domain(&self, channel_idx: usize) -> Domain {
        match &self.exact {
            ExactState::Collecting(sets) => match sets.get(channel_idx) {
                Some(set) => Domain::from_values(set.values().iter().cloned()),
                None => Domain::All,
            },
            ExactState::Overflowed => Domain::All,
        }
    }

    pub fn string_values(&self, channel_idx: usize) -> Option<&HashSet<String>> {
        match &self.distributed {
            DistributedState::Collecting(sets) => sets.get(channel_idx),
            DistributedState::Abandoned => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn limits(max_positions: usize) -> CollectorLimits {
        CollectorLimits {
            max_positions,
            max_size_bytes: u64::MAX,
        }
    }

    fn page(vals: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vals))]).unwrap()
    }

    fn two_col_page(a: Vec<i64>, b: Vec<&str>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(a)),
                Arc::new(StringArray::from(b)),
            ],
        )
        .unwrap()
    }

    fn one_channel() -> Vec<Channel> {
        vec![Channel::new("df1", DataType::Int64, 0, "q1")]
    }

    #[test]
    fn dedups_across_pages() {
        let mut c = ValueCollector::new(1, FilterScope::Local, limits(100));
        c.offer(&page(vec![Some(1), Some(2)]), &one_channel()).unwrap();
        c.offer(&page(vec![Some(2), Some(3)]), &one_channel()).unwrap();
        assert!(!c.is_overflowed());
        assert_eq!(c.positions_seen(), 3);
        assert!(c.retained_bytes() > 0);
        assert_eq!(
            c.materialize_domain(0),
            Domain::from_values([1, 2, 3].map(NativeValue::Int))
        );
        assert_eq!(c.string_values(0).unwrap().len(), 3);
    }

    #[test]
    fn null_overflows_exact_but_keeps_publishing() {
        let mut c = ValueCollector::new(1, FilterScope::Local, limits(100));
        c.offer(&page(vec![Some(1), None, Some(2)]), &one_channel()).unwrap();
        assert!(c.is_overflowed());
        assert!(c.is_publishable());
        assert_eq!(c.overflow_cause(), Some(OverflowCause::NullValue));
        c.offer(&page(vec![Some(5), None]), &one_channel()).unwrap();
        assert!(c.is_overflowed());
        assert_eq!(c.materialize_domain(0), Domain::All);
        let mut published: Vec<&str> = c
            .string_values(0)
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        published.sort_unstable();
        assert_eq!(published, ["1", "2", "5"]);
    }

    #[test]
    fn null_in_one_channel_still_feeds_the_others() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, false),
        ]));
        let page = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![None, Some(4)])),
                Arc::new(StringArray::from(vec!["x", "y"])),
            ],
        )
        .unwrap();
        let channels = vec![
            Channel::new("df1", DataType::Int64, 0, "q1"),
            Channel::new("df2", DataType::Utf8, 1, "q1"),
        ];
        let mut c = ValueCollector::new(2, FilterScope::Global, limits(100));
        c.offer(&page, &channels).unwrap();
        assert!(c.is_publishable());
        assert_eq!(c.string_values(0).unwrap().len(), 1);
        assert_eq!(c.string_values(1).unwrap().len(), 2);
    }

    #[test]
    fn duplicates_do_not_grow_string_track() {
        let mut c = ValueCollector::new(1, FilterScope::Local, limits(100));
        c.offer(&page(vec![Some(3), Some(3), Some(3)]), &one_channel()).unwrap();
        c.offer(&page(vec![Some(3)]), &one_channel()).unwrap();
        assert_eq!(c.positions_seen(), 1);
        assert_eq!(c.string_values(0).unwrap().len(), 1);
    }

    #[test]
    fn exact_limit_is_inclusive() {
        let mut c = ValueCollector::new(1, FilterScope::Local, limits(3));
        c.offer(&page(vec![Some(1), Some(2), Some(3)]), &one_channel()).unwrap();
        assert!(!c.is_overflowed());
        c.offer(&page(vec![Some(3), Some(1)]), &one_channel()).unwrap();
        assert!(!c.is_overflowed());
        c.offer(&page(vec![Some(4)]), &one_channel()).unwrap();
        assert!(c.is_overflowed());
        assert_eq!(c.overflow_cause(), Some(OverflowCause::TooManyPositions));
    }

    #[test]
    fn positions_sum_across_channels() {
        let channels = vec![
            Channel::new("df1", DataType::Int64, 0, "q1"),
            Channel::new("df2", DataType::Utf8, 1, "q1"),
        ];
        let mut c = ValueCollector::new(2, FilterScope::Local, limits(4));
        c.offer(&two_col_page(vec![1, 2], vec!["x", "y"]), &channels).unwrap();
        assert!(!c.is_overflowed());
        c.offer(&two_col_page(vec![3], vec!["x"]), &channels).unwrap();
        assert!(c.is_overflowed());
    }

    #[test]
    fn local_byte_budget_keeps_string_track() {
        let mut c = ValueCollector::new(
            1,
            FilterScope::Local,
            CollectorLimits {
                max_positions: 1000,
                max_size_bytes: 64,
            },
        );
        c.offer(&page((0..10).map(Some).collect()), &one_channel()).unwrap();
        assert!(c.is_overflowed());
        assert_eq!(c.overflow_cause(), Some(OverflowCause::TooManyBytes));
        assert!(c.is_publishable());
        c.offer(&page(vec![Some(99)]), &one_channel()).unwrap();
        assert_eq!(c.string_values(0).unwrap().len(), 11);
    }

    #[test]
    fn global_scope_budgets_string_track() {
        let mut c = ValueCollector::new(1, FilterScope::Global, limits(2));
        c.offer(&page(vec![Some(1), Some(2)]), &one_channel()).unwrap();
        assert!(!c.is_overflowed());
        assert!(c.is_publishable());
        c.offer(&page(vec![Some(3)]), &one_channel()).unwrap();
        assert!(c.is_overflowed());
        assert!(!c.is_publishable());
        assert!(c.string_values(0).is_none());
    }

    #[test]
    fn missing_column_is_an_error() {
        let channels = vec![Channel::new("df1", DataType::Int64, 3, "q1")];
        let mut c = ValueCollector::new(1, FilterScope::Local, limits(10));
        assert!(c.offer(&page(vec![Some(1)]), &channels).is_err());
    }
}
