//! Write-path transactional store engine for a property graph.
//!
//! Transactions stage record mutations in memory, write a prepared command
//! stream to a logical log, and apply or discard it in a strict order. A
//! master coordinator multiplexes remote transactions onto worker threads
//! and brokers locks and id batches for replicas.

pub mod cache;
pub mod engine;
pub mod error;
pub mod ha;
pub mod lock;
pub mod records;
pub mod store;
pub mod tx;

pub use crate::engine::{GraphStore, StoreConfig, DATA_SOURCE_NAME};
pub use crate::error::{Result, SableError};
pub use crate::ha::{
    IdAllocation, LockResult, MasterConfig, MasterCoordinator, Response, SlaveContext,
    StoreWriter, TransactionStream,
};
pub use crate::lock::{LockManager, LockType, ResourceKey, ResourceKind};
pub use crate::records::{
    NodeRecord, PropertyData, PropertyValue, RelationshipRecord, NO_MASTER, NO_PROPERTY,
    NO_RELATIONSHIP,
};
pub use crate::store::IdType;
pub use crate::tx::{Command, CommittedTx, WriteTransaction};
