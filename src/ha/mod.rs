//! Primary/replica coordination: the master-side transaction table and the
//! RPC payload types.

pub mod context;
pub mod master;
pub mod response;

pub use context::SlaveContext;
pub use master::{MasterConfig, MasterCoordinator};
pub use response::{IdAllocation, LockResult, Response, StoreWriter, TransactionStream};
