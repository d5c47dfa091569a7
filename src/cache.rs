//! Committed-record cache and token registries.
//!
//! The write transaction talks to this layer over a narrow side channel:
//! eviction notices for primitives whose records change or die, and staged
//! token registrations that become visible only when the owning transaction
//! commits its copy-on-write buffer.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::records::{NodeRecord, PropertyIndexData, RelationshipRecord, RelationshipTypeData};

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct TokenRegistry {
    by_id: HashMap<u32, String>,
    by_name: HashMap<String, u32>,
}

impl TokenRegistry {
    fn insert(&mut self, id: u32, name: String) {
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, name);
    }

    fn remove(&mut self, id: u32) {
        if let Some(name) = self.by_id.remove(&id) {
            self.by_name.remove(&name);
        }
    }
}

#[derive(Debug, Default)]
struct StagedTokens {
    relationship_types: Vec<RelationshipTypeData>,
    property_keys: Vec<PropertyIndexData>,
}

#[derive(Debug)]
pub struct RecordCache {
    nodes: Mutex<LruCache<u64, NodeRecord>>,
    relationships: Mutex<LruCache<u64, RelationshipRecord>>,
    relationship_types: RwLock<TokenRegistry>,
    property_keys: RwLock<TokenRegistry>,
    staged: Mutex<HashMap<u32, StagedTokens>>,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl RecordCache {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Mutex::new(LruCache::new(capacity)),
            relationships: Mutex::new(LruCache::new(capacity)),
            relationship_types: RwLock::new(TokenRegistry::default()),
            property_keys: RwLock::new(TokenRegistry::default()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_node(&self, record: NodeRecord) {
        self.nodes.lock().put(record.id, record);
    }

    pub fn cached_node(&self, id: u64) -> Option<NodeRecord> {
        self.nodes.lock().get(&id).cloned()
    }

    pub fn cache_relationship(&self, record: RelationshipRecord) {
        self.relationships.lock().put(record.id, record);
    }

    pub fn cached_relationship(&self, id: u64) -> Option<RelationshipRecord> {
        self.relationships.lock().get(&id).cloned()
    }

    pub fn evict_node(&self, id: u64) {
        self.nodes.lock().pop(&id);
    }

    pub fn evict_relationship(&self, id: u64) {
        self.relationships.lock().pop(&id);
    }

    pub fn evict_relationship_type(&self, id: u32) {
        self.relationship_types.write().remove(id);
    }

    /// Stages a token created inside `tx`; invisible until `commit_cows`.
    pub fn stage_relationship_type(&self, tx: u32, data: RelationshipTypeData) {
        self.staged
            .lock()
            .entry(tx)
            .or_default()
            .relationship_types
            .push(data);
    }

    pub fn stage_property_key(&self, tx: u32, data: PropertyIndexData) {
        self.staged
            .lock()
            .entry(tx)
            .or_default()
            .property_keys
            .push(data);
    }

    /// Publishes every token staged by `tx`.
    pub fn commit_cows(&self, tx: u32) {
        let Some(staged) = self.staged.lock().remove(&tx) else {
            return;
        };
        let mut types = self.relationship_types.write();
        for data in staged.relationship_types {
            types.insert(data.id, data.name);
        }
        drop(types);
        let mut keys = self.property_keys.write();
        for data in staged.property_keys {
            keys.insert(data.id, data.key);
        }
    }

    /// Drops everything staged by `tx` without publishing.
    pub fn discard(&self, tx: u32) {
        self.staged.lock().remove(&tx);
    }

    /// Direct registration, used by recovered commits where the token is
    /// already durable.
    pub fn register_relationship_type(&self, data: RelationshipTypeData) {
        self.relationship_types.write().insert(data.id, data.name);
    }

    pub fn register_property_key(&self, data: PropertyIndexData) {
        self.property_keys.write().insert(data.id, data.key);
    }

    pub fn relationship_type_id(&self, name: &str) -> Option<u32> {
        self.relationship_types.read().by_name.get(name).copied()
    }

    pub fn relationship_type_name(&self, id: u32) -> Option<String> {
        self.relationship_types.read().by_id.get(&id).cloned()
    }

    pub fn property_key_id(&self, name: &str) -> Option<u32> {
        self.property_keys.read().by_name.get(name).copied()
    }

    pub fn property_key_name(&self, id: u32) -> Option<String> {
        self.property_keys.read().by_id.get(&id).cloned()
    }
}
