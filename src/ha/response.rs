//! RPC response envelope and the payload types of the master surface.

use std::io;

use crate::tx::CommittedTx;

/// Sink for bulk store copy; the caller owns framing and transport.
pub trait StoreWriter {
    fn write_file(&mut self, name: &str, bytes: &[u8]) -> io::Result<()>;

    /// Called once after the last file.
    fn done(&mut self) {}
}

/// Committed transactions the slave is missing, up to a named horizon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionStream {
    pub resource: String,
    pub transactions: Vec<CommittedTx>,
}

impl TransactionStream {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Result plus the catch-up stream the slave must apply before using it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub response: T,
    pub stream: TransactionStream,
}

impl<T> Response<T> {
    pub fn new(response: T, stream: TransactionStream) -> Self {
        Self { response, stream }
    }

    pub fn without_stream(response: T) -> Self {
        Self {
            response,
            stream: TransactionStream::empty(),
        }
    }
}

/// Outcome of a lock request brokered for a slave. Deadlock is a value, not
/// an error: the slave decides whether to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    Granted,
    NotLocked,
    Deadlock(String),
}

/// A batch of reserved ids plus allocator state for the slave's local use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocation {
    pub ids: Vec<u64>,
    pub high_id: u64,
    pub defrag_count: u64,
}
