//! Write-transaction engine: staging, command stream, logical log.

pub mod command;
pub mod log;

mod chain;
mod props;
mod write;

pub use command::{decode_stream, encode_stream, Command};
pub use log::{CommittedTx, LogicalLog, RecoveredTx, LOG_FILE_NAME};
pub use write::WriteTransaction;
