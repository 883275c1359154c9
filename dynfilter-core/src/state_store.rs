use dynfilter_common::{DynamicFilterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use xxhash_rust::xxh3::xxh3_64;

pub const REGISTER_PREFIX: &str = "register-";
pub const WORKERS_PREFIX: &str = "workers-";
pub const PARTIAL_PREFIX: &str = "partial-";
pub const FINISH_PREFIX: &str = "finish-";
pub const TYPE_PREFIX: &str = "type-";
/// Global map from `TYPE_PREFIX` keys to encoding tags.
pub const TYPE_MAP_KEY: &str = "dynamic-filter-types";

/// Collection key for one (filter, query) pair.
pub fn create_key(prefix: &str, filter_id: &str, query_id: &str) -> String {
    format!("{prefix}{filter_id}-{query_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    Set,
    Map,
}

/// Values stored in coordination-store collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    Id(u64),
    Text(String),
    Bytes(Vec<u8>),
    StringSet(BTreeSet<String>),
}

/// Shared multi-writer key-value store organized into named set and map
/// collections. Implementations must make every call safe under concurrent
/// use without caller-side locking.
pub trait StateStore: Send + Sync {
    /// Cluster-unique id for a lane.
    fn generate_id(&self) -> u64;
    /// Creating an existing collection of the same kind is a no-op.
    fn create_collection(&self, key: &str, kind: CollectionKind) -> Result<()>;
    fn set_add(&self, key: &str, value: StateValue) -> Result<()>;
    fn map_put(&self, key: &str, map_key: &str, value: StateValue) -> Result<()>;
    fn size(&self, key: &str) -> Result<usize>;
    fn set_members(&self, key: &str) -> Result<Vec<StateValue>>;
    fn map_get(&self, key: &str, map_key: &str) -> Result<Option<StateValue>>;
}

#[derive(Debug)]
enum Collection {
    Set(HashSet<StateValue>),
    Map(HashMap<String, StateValue>),
}

impl Collection {
    fn kind(&self) -> CollectionKind {
        match self {
            Collection::Set(_) => CollectionKind::Set,
            Collection::Map(_) => CollectionKind::Map,
        }
    }
}

const DEFAULT_SHARDS: usize = 16;

/// In-process store; collections are spread over lock shards by key hash.
#[derive(Debug)]
pub struct InMemoryStateStore {
    shards: Vec<RwLock<HashMap<String, Collection>>>,
    next_id: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(n: usize) -> Self {
        Self {
            shards: (0..n.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, Collection>> {
        &self.shards[(xxh3_64(key.as_bytes()) % self.shards.len() as u64) as usize]
    }

    fn missing(key: &str) -> DynamicFilterError {
        DynamicFilterError::StateStore(format!("collection {key} does not exist"))
    }

    fn wrong_kind(key: &str, expected: CollectionKind) -> DynamicFilterError {
        DynamicFilterError::StateStore(format!("collection {key} is not a {expected:?}"))
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStateStore {
    fn generate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn create_collection(&self, key: &str, kind: CollectionKind) -> Result<()> {
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(existing) if existing.kind() == kind => Ok(()),
            Some(_) => Err(Self::wrong_kind(key, kind)),
            None => {
                let c = match kind {
                    CollectionKind::Set => Collection::Set(HashSet::new()),
                    CollectionKind::Map => Collection::Map(HashMap::new()),
                };
                shard.insert(key.to_owned(), c);
                Ok(())
            }
        }
    }

    fn set_add(&self, key: &str, value: StateValue) -> Result<()> {
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        match shard.get_mut(key) {
            Some(Collection::Set(s)) => {
                s.insert(value);
                Ok(())
            }
            Some(_) => Err(Self::wrong_kind(key, CollectionKind::Set)),
            None => Err(Self::missing(key)),
        }
    }

    fn map_put(&self, key: &str, map_key: &str, value: StateValue) -> Result<()> {
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        match shard.get_mut(key) {
            Some(Collection::Map(m)) => {
                m.insert(map_key.to_owned(), value);
                Ok(())
            }
            Some(_) => Err(Self::wrong_kind(key, CollectionKind::Map)),
            None => Err(Self::missing(key)),
        }
    }

    fn size(&self, key: &str) -> Result<usize> {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(Collection::Set(s)) => Ok(s.len()),
            Some(Collection::Map(m)) => Ok(m.len()),
            None => Err(Self::missing(key)),
        }
    }

    fn set_members(&self, key: &str) -> Result<Vec<StateValue>> {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(Collection::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_kind(key, CollectionKind::Set)),
            None => Err(Self::missing(key)),
        }
    }

    fn map_get(&self, key: &str, map_key: &str) -> Result<Option<StateValue>> {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(Collection::Map(m)) => Ok(m.get(map_key).cloned()),
            Some(_) => Err(Self::wrong_kind(key, CollectionKind::Map)),
            None => Err(Self::missing(key)),
        }
    }
}
