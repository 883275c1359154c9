use crate::channel::{validate_channels, validate_query_id, Channel, FilterKind};
use crate::collector::{CollectorLimits, ValueCollector};
use crate::coordinator::CompletionCoordinator;
use crate::predicate::{build_local_predicate, TupleDomain};
use crate::state_store::StateStore;
use arrow::record_batch::RecordBatch;
use dynfilter_common::{DynamicFilterError, FilteringConfig, Result};
use std::sync::Arc;
use tracing::{debug, Span};

/// Receives each lane's local predicate. Shared by every lane of a factory;
/// each lane invokes it exactly once.
pub type PredicateConsumer = Arc<dyn Fn(TupleDomain) + Send + Sync>;

impl From<&FilteringConfig> for CollectorLimits {
    fn from(cfg: &FilteringConfig) -> Self {
        Self {
            max_positions: cfg.max_filter_positions_count,
            max_size_bytes: cfg.max_filter_size_bytes,
        }
    }
}

impl From<&FilteringConfig> for FilterKind {
    fn from(cfg: &FilteringConfig) -> Self {
        FilterKind::new(cfg.scope, cfg.data_structure)
    }
}

/// Creates one [`DynamicFilterSourceOperator`] per execution lane.
pub struct DynamicFilterSourceOperatorFactory {
    channels: Arc<[Channel]>,
    consumer: PredicateConsumer,
    limits: CollectorLimits,
    kind: FilterKind,
    node_id: String,
    query_id: String,
    store: Option<Arc<dyn StateStore>>,
    closed: bool,
}

impl DynamicFilterSourceOperatorFactory {
    /// Fails on duplicate filter ids, duplicate source indices, unsupported
    /// column types or channels owned by another query.
    pub fn new(
        channels: Vec<Channel>,
        consumer: PredicateConsumer,
        limits: CollectorLimits,
        kind: FilterKind,
        node_id: impl Into<String>,
        query_id: impl Into<String>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self> {
        let query_id: String = query_id.into();
        validate_channels(&channels)?;
        validate_query_id(&channels, &query_id)?;
        Ok(Self {
            channels: channels.into(),
            consumer,
            limits,
            kind,
            node_id: node_id.into(),
            query_id,
            store,
            closed: false,
        })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Builds a lane and registers it with the coordination store. Log events
    /// from the lane are emitted inside `span`.
    pub fn create_operator(&self, span: Span) -> Result<DynamicFilterSourceOperator> {
        if self.closed {
            return Err(DynamicFilterError::FactoryClosed);
        }
        let mut coordinator = CompletionCoordinator::new(
            self.store.clone(),
            self.node_id.clone(),
            self.kind,
            self.channels.len(),
            span.clone(),
        );
        coordinator.register(&self.channels, &self.query_id);
        Ok(DynamicFilterSourceOperator {
            channels: Arc::clone(&self.channels),
            kind: self.kind,
            collector: Some(ValueCollector::new(
                self.channels.len(),
                self.kind.scope,
                self.limits,
            )),
            coordinator,
            consumer: Some(Arc::clone(&self.consumer)),
            current: None,
            finished: false,
            span,
        })
    }

    pub fn no_more_operators(&mut self) -> Result<()> {
        if self.closed {
            return Err(DynamicFilterError::FactoryClosed);
        }
        self.closed = true;
        Ok(())
    }
}

/// Pass-through operator that records build-side join keys as pages flow
/// by and turns them into a dynamic filter when the lane finishes.
///
/// One instance per lane; the scheduler never calls it concurrently.
pub struct DynamicFilterSourceOperator {
    channels: Arc<[Channel]>,
    kind: FilterKind,
    // dropped at finish
    collector: Option<ValueCollector>,
    coordinator: CompletionCoordinator,
    consumer: Option<PredicateConsumer>,
    current: Option<RecordBatch>,
    finished: bool,
    span: Span,
}

impl DynamicFilterSourceOperator {
    pub fn lane_id(&self) -> u64 {
        self.coordinator.lane_id()
    }

    pub fn is_registered(&self) -> bool {
        self.coordinator.is_registered()
    }

    pub fn is_overflowed(&self) -> bool {
        self.collector.as_ref().is_some_and(ValueCollector::is_overflowed)
    }

    pub fn needs_input(&self) -> bool {
        self.current.is_none() && !self.finished
    }

    pub fn add_input(&mut self, page: RecordBatch) -> Result<()> {
        if self.finished {
            return Err(DynamicFilterError::InputAfterFinish);
        }
        let Some(collector) = self.collector.as_mut() else {
            return Err(DynamicFilterError::InputAfterFinish);
        };
        let was_overflowed = collector.is_overflowed();
        collector.offer(&page, &self.channels)?;
        if !was_overflowed && collector.is_overflowed() {
            let _guard = self.span.enter();
            debug!(
                lane_id = self.coordinator.lane_id(),
                cause = ?collector.overflow_cause(),
                positions = collector.positions_seen(),
                bytes = collector.retained_bytes(),
                "dynamic filter overflowed, admitting all probe rows"
            );
            deliver(&mut self.consumer, TupleDomain::All);
        }
        self.current = Some(page);
        Ok(())
    }

    pub fn get_output(&mut self) -> Option<RecordBatch> {
        self.current.take()
    }

    /// Publishes partials and hands the local predicate to the consumer.
    /// Repeated calls are no-ops.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(collector) = self.collector.take() else {
            return;
        };
        self.coordinator.finish(&self.channels, &collector);
        let predicate = build_local_predicate(&self.channels, &collector, self.kind.scope);
        deliver(&mut self.consumer, predicate);
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_none() && self.finished
    }
}

fn deliver(consumer: &mut Option<PredicateConsumer>, predicate: TupleDomain) {
    if let Some(c) = consumer.take() {
        c(predicate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Domain;
    use crate::state_store::InMemoryStateStore;
    use crate::value::NativeValue;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use dynfilter_common::{FilterEncoding, FilterScope};
    use std::sync::Mutex;

    type Delivered = Arc<Mutex<Vec<TupleDomain>>>;

    fn page(vals: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vals))]).unwrap()
    }

    fn factory(
        scope: FilterScope,
        max_positions: usize,
        store: Option<Arc<dyn StateStore>>,
    ) -> (DynamicFilterSourceOperatorFactory, Delivered) {
        let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let f = DynamicFilterSourceOperatorFactory::new(
            vec![Channel::new("df1", DataType::Int64, 0, "q1")],
            Arc::new(move |p: TupleDomain| sink.lock().unwrap().push(p)),
            CollectorLimits {
                max_positions,
                max_size_bytes: 1 << 20,
            },
            FilterKind::new(scope, FilterEncoding::Hashset),
            "node-a",
            "q1",
            store,
        )
        .unwrap();
        (f, delivered)
    }

    #[test]
    fn passes_pages_through() {
        let (f, _) = factory(FilterScope::Local, 10, None);
        let mut op = f.create_operator(Span::none()).unwrap();
        assert!(op.needs_input());
        op.add_input(page(vec![Some(1)])).unwrap();
        assert!(!op.needs_input());
        assert_eq!(op.get_output().unwrap().num_rows(), 1);
        assert!(op.get_output().is_none());
        op.finish();
        assert!(op.is_finished());
        assert!(!op.needs_input());
    }

    #[test]
    fn overflow_delivers_all_once() {
        let (f, delivered) = factory(FilterScope::Local, 2, None);
        let mut op = f.create_operator(Span::none()).unwrap();
        op.add_input(page(vec![Some(1), Some(2), Some(3)])).unwrap();
        assert!(op.is_overflowed());
        assert_eq!(*delivered.lock().unwrap(), vec![TupleDomain::All]);
        op.get_output();
        op.add_input(page(vec![Some(4)])).unwrap();
        op.finish();
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn finish_is_idempotent() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let (f, delivered) = factory(FilterScope::Local, 10, Some(store.clone()));
        let mut op = f.create_operator(Span::none()).unwrap();
        assert!(op.is_registered());
        op.add_input(page(vec![Some(7)])).unwrap();
        op.finish();
        op.finish();
        assert_eq!(
            *delivered.lock().unwrap(),
            vec![TupleDomain::Columns(
                [("df1".to_string(), Domain::from_values([NativeValue::Int(7)]))].into()
            )]
        );
        assert_eq!(store.size("partial-df1-q1").unwrap(), 1);
        assert_eq!(store.size("finish-df1-q1").unwrap(), 1);
        assert_eq!(store.size("workers-df1-q1").unwrap(), 1);
    }

    #[test]
    fn input_after_finish_is_rejected() {
        let (f, _) = factory(FilterScope::Local, 10, None);
        let mut op = f.create_operator(Span::none()).unwrap();
        op.finish();
        assert!(matches!(
            op.add_input(page(vec![Some(1)])),
            Err(DynamicFilterError::InputAfterFinish)
        ));
    }

    #[test]
    fn global_scope_delivers_all() {
        let (f, delivered) = factory(FilterScope::Global, 10, None);
        let mut op = f.create_operator(Span::none()).unwrap();
        op.add_input(page(vec![Some(1)])).unwrap();
        op.finish();
        assert_eq!(*delivered.lock().unwrap(), vec![TupleDomain::All]);
    }

    #[test]
    fn closed_factory_refuses_lanes() {
        let (mut f, _) = factory(FilterScope::Local, 10, None);
        f.create_operator(Span::none()).unwrap();
        f.no_more_operators().unwrap();
        assert!(matches!(
            f.create_operator(Span::none()),
            Err(DynamicFilterError::FactoryClosed)
        ));
        assert!(f.no_more_operators().is_err());
    }

    #[test]
    fn duplicate_channels_fail_construction() {
        let res = DynamicFilterSourceOperatorFactory::new(
            vec![
                Channel::new("df1", DataType::Int64, 0, "q1"),
                Channel::new("df1", DataType::Int64, 1, "q1"),
            ],
            Arc::new(|_: TupleDomain| {}),
            CollectorLimits {
                max_positions: 10,
                max_size_bytes: 10,
            },
            FilterKind::new(FilterScope::Local, FilterEncoding::Bloom),
            "node-a",
            "q1",
            None,
        );
        assert!(matches!(res, Err(DynamicFilterError::InvalidChannels(_))));
    }

    #[test]
    fn channels_from_another_query_fail_construction() {
        let res = DynamicFilterSourceOperatorFactory::new(
            vec![Channel::new("df1", DataType::Int64, 0, "q2")],
            Arc::new(|_: TupleDomain| {}),
            CollectorLimits {
                max_positions: 10,
                max_size_bytes: 10,
            },
            FilterKind::new(FilterScope::Local, FilterEncoding::Hashset),
            "node-a",
            "q1",
            None,
        );
        assert!(matches!(res, Err(DynamicFilterError::InvalidChannels(_))));
    }
}
