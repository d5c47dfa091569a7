//! The store engine facade: opens a store directory, recovers from the
//! logical log, vends write transactions, and applies foreign prepared
//! transactions on behalf of the master.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::RecordCache;
use crate::error::{Result, SableError};
use crate::lock::LockManager;
use crate::records::NO_MASTER;
use crate::store::{IdGenerator, IdType, RecordStores};
use crate::tx::command::{decode_stream, encode_stream};
use crate::tx::log::{CommittedTx, LogicalLog};
use crate::tx::WriteTransaction;

/// Name of the single data source this engine exposes to the wire layer.
pub const DATA_SOURCE_NAME: &str = "graph";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Machine id stamped on locally committed transactions.
    pub machine_id: i32,
    /// Byte capacity of one dynamic value block.
    pub dynamic_block_size: usize,
    /// How many relationships an incremental chain read returns at once.
    pub relationship_grab_size: usize,
    /// Sync the log on every commit.
    pub log_sync: bool,
    /// Capacity of the committed-record caches.
    pub cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            machine_id: NO_MASTER,
            dynamic_block_size: 64,
            relationship_grab_size: 100,
            log_sync: true,
            cache_capacity: 10_000,
        }
    }
}

pub struct GraphStore {
    path: PathBuf,
    config: StoreConfig,
    stores: Arc<RecordStores>,
    cache: Arc<RecordCache>,
    locks: Arc<LockManager>,
    log: Arc<LogicalLog>,
    next_identifier: AtomicU32,
    /// Serializes the assign-id/log/execute tail of every commit so
    /// transaction ids stay gapless under concurrent committers.
    commit_lock: Mutex<()>,
}

impl GraphStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens the store directory and replays every committed transaction
    /// found in the logical log; the log is the durable source of truth.
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let (log, recovered) = LogicalLog::open(&path, config.log_sync)?;
        let store = Self {
            path,
            stores: Arc::new(RecordStores::new(config.dynamic_block_size)),
            cache: Arc::new(RecordCache::with_capacity(config.cache_capacity)),
            locks: Arc::new(LockManager::new()),
            log: Arc::new(log),
            next_identifier: AtomicU32::new(1),
            commit_lock: Mutex::new(()),
            config,
        };
        let replayed = recovered.len();
        for tx in recovered {
            let mut replay = store.begin_tx();
            for command in tx.commands {
                replay.inject_command(command);
            }
            replay.commit(tx.tx_id)?;
        }
        if replayed > 0 {
            info!(
                replayed,
                last_committed = store.stores.last_committed_tx(),
                path = %store.path.display(),
                "recovery complete"
            );
        }
        Ok(store)
    }

    pub fn begin_tx(&self) -> WriteTransaction {
        let identifier = self.next_identifier.fetch_add(1, Ordering::SeqCst);
        WriteTransaction::new(
            identifier,
            Arc::clone(&self.stores),
            Arc::clone(&self.cache),
            Arc::clone(&self.locks),
            Arc::clone(&self.log),
            self.config.relationship_grab_size,
        )
    }

    /// Prepares and commits `tx` under the next transaction id. A read-only
    /// transaction is discarded without consuming an id.
    pub fn commit(&self, tx: &mut WriteTransaction) -> Result<u64> {
        if tx.is_read_only() {
            debug!(identifier = tx.identifier(), "read-only transaction, skipping commit");
            tx.rollback()?;
            return Ok(self.stores.last_committed_tx());
        }
        tx.prepare()?;
        let _serialized = self.commit_lock.lock();
        let tx_id = self.stores.last_committed_tx() + 1;
        self.log
            .append_commit(tx.identifier(), tx_id, self.config.machine_id)?;
        tx.commit(tx_id)?;
        Ok(tx_id)
    }

    pub fn rollback(&self, tx: &mut WriteTransaction) -> Result<()> {
        tx.rollback()
    }

    /// Applies a prepared command stream shipped by a slave, producing a
    /// real transaction id. The commands run through the injected-commit
    /// path so foreign record ids refresh the local generators.
    pub fn apply_prepared_transaction(&self, stream: &[u8]) -> Result<u64> {
        let commands = decode_stream(stream)?;
        if commands.is_empty() {
            return Err(SableError::InvalidArgument(
                "prepared transaction stream is empty".into(),
            ));
        }
        let mut tx = self.begin_tx();
        let identifier = tx.identifier();
        let _serialized = self.commit_lock.lock();
        self.log.append_prepared(identifier, commands.iter())?;
        for command in commands {
            tx.inject_command(command);
        }
        let tx_id = self.stores.last_committed_tx() + 1;
        self.log
            .append_commit(identifier, tx_id, self.config.machine_id)?;
        tx.commit(tx_id)?;
        debug!(tx_id, "applied prepared transaction");
        Ok(tx_id)
    }

    pub fn last_committed_tx(&self) -> u64 {
        self.stores.last_committed_tx()
    }

    /// Committed transactions with `since < tx_id <= up_to`.
    pub fn extract_committed(&self, since: u64, up_to: u64) -> Vec<CommittedTx> {
        self.log.extract_committed(since, up_to)
    }

    pub fn master_id_for_committed_tx(&self, tx_id: u64) -> i32 {
        self.log.master_id_for(tx_id).unwrap_or(NO_MASTER)
    }

    pub fn rotate_log(&self) -> Result<u32> {
        self.log.rotate()
    }

    /// Rotates the log, then streams serialized store snapshots and every
    /// log segment through `writer`.
    pub fn copy_store(&self, writer: &mut dyn crate::ha::StoreWriter) -> Result<()> {
        self.rotate_log()?;
        let nodes: Vec<_> = self
            .stores
            .nodes()
            .snapshot()
            .into_iter()
            .map(crate::tx::Command::Node)
            .collect();
        writer.write_file("sable.nodes", &encode_stream(&nodes))?;
        let rels: Vec<_> = self
            .stores
            .relationships()
            .snapshot()
            .into_iter()
            .map(crate::tx::Command::Relationship)
            .collect();
        writer.write_file("sable.relationships", &encode_stream(&rels))?;
        let props: Vec<_> = self
            .stores
            .properties()
            .snapshot()
            .into_iter()
            .map(crate::tx::Command::Property)
            .collect();
        writer.write_file("sable.properties", &encode_stream(&props))?;
        let indexes: Vec<_> = self
            .stores
            .properties()
            .index_store()
            .snapshot()
            .into_iter()
            .map(crate::tx::Command::PropertyIndex)
            .collect();
        writer.write_file("sable.propertyindexes", &encode_stream(&indexes))?;
        let types: Vec<_> = self
            .stores
            .relationship_types()
            .snapshot()
            .into_iter()
            .map(crate::tx::Command::RelationshipType)
            .collect();
        writer.write_file("sable.relationshiptypes", &encode_stream(&types))?;
        for segment in self.log.segments()? {
            let bytes = std::fs::read(&segment)?;
            let name = segment
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(crate::tx::LOG_FILE_NAME)
                .to_owned();
            writer.write_file(&name, &bytes)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stores(&self) -> &RecordStores {
        &self.stores
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn id_generator(&self, id_type: IdType) -> &IdGenerator {
        self.stores.id_generator(id_type)
    }
}
