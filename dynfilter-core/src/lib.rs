pub mod bloom;
pub mod channel;
pub mod collector;
pub mod consumer;
pub mod coordinator;
pub mod operator;
pub mod predicate;
pub mod reader;
pub mod state_store;
pub mod value;

pub use bloom::{encode_values, BloomFilter};
pub use channel::{validate_channels, validate_query_id, Channel, EncodingTag, FilterKind};
pub use collector::{CollectorLimits, OverflowCause, ValueCollector};
pub use consumer::{
    completion_status, read_global_filter, wait_for_completion, CompletionStatus, GlobalFilter,
};
pub use coordinator::CompletionCoordinator;
pub use dynfilter_common::{DynamicFilterError, FilterEncoding, FilterScope, Result};
pub use operator::{DynamicFilterSourceOperator, DynamicFilterSourceOperatorFactory, PredicateConsumer};
pub use predicate::{build_local_predicate, Domain, TupleDomain};
pub use reader::{read_lane_batches, BuildSide};
pub use state_store::{InMemoryStateStore, StateStore, StateValue};
pub use value::{read_native_value, NativeValue};
