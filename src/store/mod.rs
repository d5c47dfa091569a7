//! Typed record stores and id generation.
//!
//! The stores keep records in memory behind the collaborator contract
//! (`get`, `update`, `next_id`, `free_id`); the logical log is the durable
//! source of truth and recovery rebuilds store state by replaying it.

pub mod dynamic;
pub mod id;
pub mod index;
pub mod node;
pub mod property;
pub mod relationship;
pub mod reltype;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

pub use dynamic::DynamicStore;
pub use id::{IdGenerator, IdType};
pub use index::PropertyIndexStore;
pub use node::NodeStore;
pub use property::PropertyStore;
pub use relationship::RelationshipStore;
pub use reltype::RelationshipTypeStore;

/// Aggregate over every record store plus the committed-transaction counter.
#[derive(Debug)]
pub struct RecordStores {
    nodes: NodeStore,
    relationships: RelationshipStore,
    properties: PropertyStore,
    relationship_types: RelationshipTypeStore,
    last_committed: Mutex<u64>,
    recovered: AtomicBool,
}

impl RecordStores {
    pub fn new(dynamic_block_size: usize) -> Self {
        Self {
            nodes: NodeStore::new(),
            relationships: RelationshipStore::new(),
            properties: PropertyStore::new(dynamic_block_size),
            relationship_types: RelationshipTypeStore::new(dynamic_block_size),
            last_committed: Mutex::new(0),
            recovered: AtomicBool::new(false),
        }
    }

    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    pub fn relationships(&self) -> &RelationshipStore {
        &self.relationships
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn relationship_types(&self) -> &RelationshipTypeStore {
        &self.relationship_types
    }

    pub fn last_committed_tx(&self) -> u64 {
        *self.last_committed.lock()
    }

    pub fn set_last_committed_tx(&self, tx_id: u64) {
        *self.last_committed.lock() = tx_id;
    }

    pub fn set_recovered_status(&self, recovered: bool) {
        self.recovered.store(recovered, Ordering::SeqCst);
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    /// Refreshes every id generator from the records actually present, so
    /// generators are caught up rather than rewound after recovery.
    pub fn update_high_ids(&self) {
        self.nodes.refresh_high_id();
        self.relationships.refresh_high_id();
        self.properties.refresh_high_ids();
        self.relationship_types.refresh_high_ids();
    }

    pub fn id_generator(&self, id_type: IdType) -> &IdGenerator {
        match id_type {
            IdType::Node => self.nodes.id_generator(),
            IdType::Relationship => self.relationships.id_generator(),
            IdType::Property => self.properties.id_generator(),
            IdType::PropertyIndex => self.properties.index_store().id_generator(),
            IdType::RelationshipType => self.relationship_types.id_generator(),
            IdType::StringBlock => self.properties.string_store().id_generator(),
            IdType::ArrayBlock => self.properties.array_store().id_generator(),
        }
    }
}
