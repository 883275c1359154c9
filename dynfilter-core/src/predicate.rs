use crate::channel::Channel;
use crate::collector::ValueCollector;
use crate::value::NativeValue;
use dynfilter_common::FilterScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Admissible values for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    All,
    Values {
        values: Vec<NativeValue>,
        null_allowed: bool,
    },
}

impl Domain {
    /// Finite domain over `values`; inner/right joins never match null keys.
    pub fn from_values(values: impl IntoIterator<Item = NativeValue>) -> Self {
        let mut values: Vec<NativeValue> = values.into_iter().collect();
        values.sort();
        values.dedup();
        Domain::Values {
            values,
            null_allowed: false,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Domain::All)
    }

    pub fn contains(&self, value: Option<&NativeValue>) -> bool {
        match (self, value) {
            (Domain::All, _) => true,
            (Domain::Values { null_allowed, .. }, None) => *null_allowed,
            (Domain::Values { values, .. }, Some(v)) => values.binary_search(v).is_ok(),
        }
    }
}

/// Predicate keyed by filter id, handed to the probe-side consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TupleDomain {
    All,
    Columns(BTreeMap<String, Domain>),
}

impl TupleDomain {
    pub fn is_all(&self) -> bool {
        match self {
            TupleDomain::All => true,
            TupleDomain::Columns(c) => c.values().all(Domain::is_all),
        }
    }

    pub fn domain(&self, filter_id: &str) -> Domain {
        match self {
            TupleDomain::All => Domain::All,
            TupleDomain::Columns(c) => c.get(filter_id).cloned().unwrap_or(Domain::All),
        }
    }
}

/// Local-consumption predicate for a finished lane.
///
/// Global scope and overflowed collectors both yield `All`: a pruning global
/// predicate only exists once every lane's partial has been aggregated.
pub fn build_local_predicate(
    channels: &[Channel],
    collector: &ValueCollector,
    scope: FilterScope,
) -> TupleDomain {
    if scope == FilterScope::Global || collector.is_overflowed() {
        return TupleDomain::All;
    }
    let columns = channels
        .iter()
        .enumerate()
        .map(|(i, c)| (c.filter_id.clone(), collector.materialize_domain(i)))
        .collect();
    TupleDomain::Columns(columns)
}
