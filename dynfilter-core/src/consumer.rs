//! Reader side of the completion protocol: waits for every registered lane to
//! finish, then folds the published partials into one filter.

use crate::bloom::BloomFilter;
use crate::channel::EncodingTag;
use crate::state_store::{
    create_key, StateStore, StateValue, FINISH_PREFIX, PARTIAL_PREFIX, REGISTER_PREFIX,
    TYPE_MAP_KEY, TYPE_PREFIX, WORKERS_PREFIX,
};
use dynfilter_common::{DynamicFilterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub registered: usize,
    pub finished: usize,
    pub workers: Vec<String>,
}

impl CompletionStatus {
    pub fn is_complete(&self) -> bool {
        self.registered > 0 && self.finished >= self.registered
    }
}

pub fn completion_status(
    store: &dyn StateStore,
    filter_id: &str,
    query_id: &str,
) -> Result<CompletionStatus> {
    let registered = store.size(&create_key(REGISTER_PREFIX, filter_id, query_id))?;
    let finished = store.size(&create_key(FINISH_PREFIX, filter_id, query_id))?;
    let mut workers: Vec<String> = store
        .set_members(&create_key(WORKERS_PREFIX, filter_id, query_id))?
        .into_iter()
        .filter_map(|v| match v {
            StateValue::Text(s) => Some(s),
            _ => None,
        })
        .collect();
    workers.sort();
    Ok(CompletionStatus {
        registered,
        finished,
        workers,
    })
}

/// Polls until finished lanes match registered lanes. `None` on timeout:
/// abandoned lanes never finish, so callers must treat that as accept-all.
pub fn wait_for_completion(
    store: &dyn StateStore,
    filter_id: &str,
    query_id: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<CompletionStatus>> {
    // None: timeout too large to represent, wait without a deadline
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let status = completion_status(store, filter_id, query_id)?;
        if status.is_complete() {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        std::thread::sleep(poll_interval);
    }
}

/// Cluster-wide filter assembled from every lane's partial.
#[derive(Debug)]
pub enum GlobalFilter {
    All,
    Values(BTreeSet<String>),
    Bloom(Vec<BloomFilter>),
}

impl GlobalFilter {
    pub fn is_all(&self) -> bool {
        matches!(self, GlobalFilter::All)
    }

    /// Tests a value's string form; bloom partials may report false positives.
    pub fn might_contain(&self, value: &str) -> bool {
        match self {
            GlobalFilter::All => true,
            GlobalFilter::Values(set) => set.contains(value),
            GlobalFilter::Bloom(filters) => filters.iter().any(|f| f.might_contain(value)),
        }
    }
}

/// Folds PARTIAL entries according to the recorded encoding. Incomplete or
/// untyped filters read as `All`.
pub fn read_global_filter(
    store: &dyn StateStore,
    filter_id: &str,
    query_id: &str,
) -> Result<GlobalFilter> {
    if !completion_status(store, filter_id, query_id)?.is_complete() {
        return Ok(GlobalFilter::All);
    }
    let tag = match store.map_get(TYPE_MAP_KEY, &create_key(TYPE_PREFIX, filter_id, query_id))? {
        Some(StateValue::Text(s)) => EncodingTag::parse(&s),
        _ => None,
    };
    let Some(tag) = tag else {
        warn!(filter_id, query_id, "no encoding recorded for dynamic filter");
        return Ok(GlobalFilter::All);
    };
    let partials = store.set_members(&create_key(PARTIAL_PREFIX, filter_id, query_id))?;
    if tag.is_bloom() {
        let filters = partials
            .into_iter()
            .map(|p| match p {
                StateValue::Bytes(b) => BloomFilter::decode(&b),
                other => Err(unexpected(tag, &other)),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GlobalFilter::Bloom(filters))
    } else {
        let mut values = BTreeSet::new();
        for p in partials {
            match p {
                StateValue::StringSet(s) => values.extend(s),
                other => return Err(unexpected(tag, &other)),
            }
        }
        Ok(GlobalFilter::Values(values))
    }
}

fn unexpected(tag: EncodingTag, value: &StateValue) -> DynamicFilterError {
    DynamicFilterError::StateStore(format!(
        "partial {value:?} does not match encoding {}",
        tag.as_str()
    ))
}
