use crate::bloom;
use crate::channel::{Channel, FilterKind};
use crate::collector::ValueCollector;
use crate::state_store::{
    create_key, CollectionKind, StateStore, StateValue, FINISH_PREFIX, PARTIAL_PREFIX,
    REGISTER_PREFIX, TYPE_MAP_KEY, TYPE_PREFIX, WORKERS_PREFIX,
};
use dynfilter_common::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn, Span};

/// Publishes one lane's partial results through the coordination store.
///
/// Store failures are logged and swallowed: a missing partial only widens
/// the eventual filter, it never rejects valid rows.
pub struct CompletionCoordinator {
    store: Option<Arc<dyn StateStore>>,
    node_id: String,
    kind: FilterKind,
    lane_id: u64,
    // query id each channel registered under, None if registration failed
    registrations: Vec<Option<String>>,
    register_attempted: bool,
    finished: bool,
    span: Span,
}

impl CompletionCoordinator {
    pub fn new(
        store: Option<Arc<dyn StateStore>>,
        node_id: impl Into<String>,
        kind: FilterKind,
        channel_count: usize,
        span: Span,
    ) -> Self {
        let lane_id = store.as_ref().map(|s| s.generate_id()).unwrap_or(0);
        Self {
            store,
            node_id: node_id.into(),
            kind,
            lane_id,
            registrations: vec![None; channel_count],
            register_attempted: false,
            finished: false,
            span,
        }
    }

    pub fn lane_id(&self) -> u64 {
        self.lane_id
    }

    pub fn is_registered(&self) -> bool {
        self.registrations.iter().any(Option::is_some)
    }

    /// Announces this lane as a contributor for every channel. Only the first
    /// call does anything.
    pub fn register(&mut self, channels: &[Channel], query_id: &str) {
        if self.register_attempted {
            return;
        }
        self.register_attempted = true;
        let Some(store) = self.store.clone() else {
            return;
        };
        let _guard = self.span.enter();
        for (i, channel) in channels.iter().enumerate() {
            match register_channel(store.as_ref(), &channel.filter_id, query_id, self.lane_id) {
                Ok(()) => self.registrations[i] = Some(query_id.to_owned()),
                Err(e) => error!(
                    filter_id = %channel.filter_id,
                    query_id,
                    "could not register dynamic filter: {e}"
                ),
            }
        }
    }

    /// Writes partial results, then completion markers. Runs at most once;
    /// channels that never registered are skipped.
    pub fn finish(&mut self, channels: &[Channel], collector: &ValueCollector) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(store) = self.store.clone() else {
            return;
        };
        let _guard = self.span.enter();
        for (i, channel) in channels.iter().enumerate() {
            let Some(query_id) = self.registrations[i].as_deref() else {
                continue;
            };
            let Some(values) = collector.string_values(i) else {
                // lane stays registered but unfinished; readers time out to accept-all
                warn!(
                    filter_id = %channel.filter_id,
                    query_id,
                    "dynamic filter exceeded its limits, skipping publication"
                );
                continue;
            };
            if let Err(e) = self.publish_channel(store.as_ref(), &channel.filter_id, query_id, values)
            {
                error!(
                    filter_id = %channel.filter_id,
                    query_id,
                    "could not finish dynamic filter: {e}"
                );
            }
        }
    }

    fn publish_channel(
        &self,
        store: &dyn StateStore,
        filter_id: &str,
        query_id: &str,
        values: &HashSet<String>,
    ) -> Result<()> {
        let tag = self.kind.tag();
        store.map_put(
            TYPE_MAP_KEY,
            &create_key(TYPE_PREFIX, filter_id, query_id),
            StateValue::Text(tag.as_str().to_owned()),
        )?;
        let partial = if tag.is_bloom() {
            debug!(
                filter_id,
                query_id,
                lane_id = self.lane_id,
                size = values.len(),
                "publishing bloom filter partial"
            );
            StateValue::Bytes(bloom::encode_values(values))
        } else {
            debug!(
                filter_id,
                query_id,
                lane_id = self.lane_id,
                size = values.len(),
                "publishing string set partial"
            );
            StateValue::StringSet(values.iter().cloned().collect())
        };
        store.set_add(&create_key(PARTIAL_PREFIX, filter_id, query_id), partial)?;
        // FINISH only after PARTIAL: readers treat FINISH as "partial is visible"
        store.set_add(
            &create_key(FINISH_PREFIX, filter_id, query_id),
            StateValue::Id(self.lane_id),
        )?;
        store.set_add(
            &create_key(WORKERS_PREFIX, filter_id, query_id),
            StateValue::Text(self.node_id.clone()),
        )?;
        Ok(())
    }
}

fn register_channel(
    store: &dyn StateStore,
    filter_id: &str,
    query_id: &str,
    lane_id: u64,
) -> Result<()> {
    for prefix in [REGISTER_PREFIX, WORKERS_PREFIX, PARTIAL_PREFIX, FINISH_PREFIX] {
        store.create_collection(&create_key(prefix, filter_id, query_id), CollectionKind::Set)?;
    }
    store.create_collection(TYPE_MAP_KEY, CollectionKind::Map)?;
    store.set_add(
        &create_key(REGISTER_PREFIX, filter_id, query_id),
        StateValue::Id(lane_id),
    )
}
