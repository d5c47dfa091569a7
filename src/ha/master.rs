//! Master-side coordination of remote write transactions.
//!
//! The coordinator keys a table of suspended transactions by slave context.
//! Every request handler brackets its work in a resume/suspend envelope so
//! the worker thread's state is restored on every exit path, whichever
//! transaction the request mapped to. A periodic reaper rolls back
//! transactions idle past a threshold; a transaction whose timestamp is
//! zero is resumed somewhere and is never reaped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::engine::{GraphStore, DATA_SOURCE_NAME};
use crate::error::{Result, SableError};
use crate::ha::context::SlaveContext;
use crate::ha::response::{IdAllocation, LockResult, Response, StoreWriter, TransactionStream};
use crate::lock::{LockType, ResourceKind};
use crate::store::IdType;
use crate::tx::WriteTransaction;

pub const NODE_RESOURCE_CODE: u8 = 0;
pub const RELATIONSHIP_RESOURCE_CODE: u8 = 1;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// How often the reaper scans the transaction table.
    pub reap_interval: Duration,
    /// Idle time after which a suspended transaction is rolled back.
    pub idle_threshold: Duration,
    /// Ids reserved per `allocate_ids` call.
    pub id_grab_size: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(30),
            id_grab_size: 1000,
        }
    }
}

#[derive(Clone)]
struct TxEntry {
    tx: Arc<Mutex<WriteTransaction>>,
    /// Millis since epoch of the last suspend; zero while resumed.
    last_activity: Arc<AtomicU64>,
    /// Guards the single-resumer property across threads.
    resumed: Arc<AtomicBool>,
}

struct Active {
    ctx: SlaveContext,
    entry: TxEntry,
}

thread_local! {
    /// The transaction currently resumed on this worker thread, if any.
    static CURRENT: RefCell<Option<Active>> = const { RefCell::new(None) };
}

struct Inner {
    store: Arc<GraphStore>,
    config: MasterConfig,
    txs: Mutex<HashMap<SlaveContext, TxEntry>>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

impl Inner {
    /// Step one of the request envelope: park whatever transaction this
    /// thread holds and resume (or begin) the one for `ctx`.
    fn resume_envelope(&self, ctx: &SlaveContext) -> Result<(Option<Active>, TxEntry)> {
        let other = CURRENT.with(|current| current.borrow_mut().take());
        if let Some(active) = other {
            if active.ctx == *ctx {
                let entry = active.entry.clone();
                CURRENT.with(|current| *current.borrow_mut() = Some(active));
                return Ok((None, entry));
            }
            match self.resume(ctx) {
                Ok(entry) => {
                    CURRENT.with(|current| {
                        *current.borrow_mut() = Some(Active {
                            ctx: ctx.clone(),
                            entry: entry.clone(),
                        })
                    });
                    Ok((Some(active), entry))
                }
                Err(error) => {
                    CURRENT.with(|current| *current.borrow_mut() = Some(active));
                    Err(error)
                }
            }
        } else {
            let entry = self.resume(ctx)?;
            CURRENT.with(|current| {
                *current.borrow_mut() = Some(Active {
                    ctx: ctx.clone(),
                    entry: entry.clone(),
                })
            });
            Ok((None, entry))
        }
    }

    fn resume(&self, ctx: &SlaveContext) -> Result<TxEntry> {
        let mut table = self.txs.lock();
        if let Some(entry) = table.get(ctx) {
            if entry
                .resumed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(SableError::IllegalState(format!(
                    "transaction for session {} is resumed on another thread",
                    ctx.session_id()
                )));
            }
            // Zero marks the transaction active so the reaper leaves it be.
            entry.last_activity.store(0, Ordering::SeqCst);
            Ok(entry.clone())
        } else {
            let tx = self.store.begin_tx();
            debug!(
                session = ctx.session_id(),
                machine = ctx.machine_id(),
                identifier = tx.identifier(),
                "began transaction for slave context"
            );
            let entry = TxEntry {
                tx: Arc::new(Mutex::new(tx)),
                last_activity: Arc::new(AtomicU64::new(0)),
                resumed: Arc::new(AtomicBool::new(true)),
            };
            table.insert(ctx.clone(), entry.clone());
            Ok(entry)
        }
    }

    /// Step two of the envelope: timestamp and park the context's
    /// transaction, then restore whatever the thread held before. Mandatory
    /// on every exit path of a handler.
    fn suspend_envelope(&self, other: Option<Active>, ctx: &SlaveContext) {
        if let Some(entry) = self.txs.lock().get(ctx) {
            entry.last_activity.store(now_millis(), Ordering::SeqCst);
            entry.resumed.store(false, Ordering::SeqCst);
        }
        CURRENT.with(|current| *current.borrow_mut() = other);
    }

    /// Rolls the context's transaction back, removes its row, and restores
    /// the previous transaction.
    fn rollback_and_restore(&self, other: Option<Active>, ctx: &SlaveContext) -> Result<()> {
        let entry = self.txs.lock().remove(ctx);
        let result = match entry {
            Some(entry) => entry.tx.lock().rollback(),
            None => Ok(()),
        };
        CURRENT.with(|current| *current.borrow_mut() = other);
        result
    }

    fn with_transaction<T>(
        &self,
        ctx: &SlaveContext,
        f: impl FnOnce(&mut WriteTransaction) -> Result<T>,
    ) -> Result<T> {
        let (other, entry) = self.resume_envelope(ctx)?;
        let result = {
            let mut tx = entry.tx.lock();
            f(&mut tx)
        };
        self.suspend_envelope(other, ctx);
        result
    }

    fn pack_response<T>(&self, ctx: &SlaveContext, response: T) -> Result<Response<T>> {
        let horizon = self.store.last_committed_tx();
        self.pack_response_with_horizon(ctx, response, horizon)
    }

    fn pack_response_with_horizon<T>(
        &self,
        ctx: &SlaveContext,
        response: T,
        horizon: u64,
    ) -> Result<Response<T>> {
        let since = ctx.last_applied_for(DATA_SOURCE_NAME).unwrap_or(0);
        let up_to = horizon.min(self.store.last_committed_tx());
        let transactions = self.store.extract_committed(since, up_to);
        Ok(Response::new(
            response,
            TransactionStream {
                resource: DATA_SOURCE_NAME.to_owned(),
                transactions,
            },
        ))
    }

    fn reap_idle(&self) {
        let snapshot: Vec<(SlaveContext, TxEntry)> = self
            .txs
            .lock()
            .iter()
            .map(|(ctx, entry)| (ctx.clone(), entry.clone()))
            .collect();
        let now = now_millis();
        let threshold = self.config.idle_threshold.as_millis() as u64;
        for (ctx, entry) in snapshot {
            let suspended_at = entry.last_activity.load(Ordering::SeqCst);
            if suspended_at == 0 || now.saturating_sub(suspended_at) < threshold {
                continue;
            }
            let idle_ms = now.saturating_sub(suspended_at);
            info!(
                session = ctx.session_id(),
                machine = ctx.machine_id(),
                idle_ms,
                "found old transaction"
            );
            match self.reap_one(&ctx) {
                Ok(()) => info!(
                    session = ctx.session_id(),
                    machine = ctx.machine_id(),
                    idle_ms,
                    "rolled back old transaction"
                ),
                // A transaction resumed elsewhere is waiting on a lock;
                // the deadlock detector owns that case.
                Err(SableError::IllegalState(_)) => {}
                Err(error) => warn!(
                    session = ctx.session_id(),
                    %error,
                    "unable to roll back old transaction"
                ),
            }
        }
    }

    fn reap_one(&self, ctx: &SlaveContext) -> Result<()> {
        let (other, _entry) = self.resume_envelope(ctx)?;
        self.rollback_and_restore(other, ctx)
    }
}

pub struct MasterCoordinator {
    inner: Arc<Inner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl MasterCoordinator {
    pub fn new(store: Arc<GraphStore>) -> Result<Self> {
        Self::with_config(store, MasterConfig::default())
    }

    pub fn with_config(store: Arc<GraphStore>, config: MasterConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            store,
            config,
            txs: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
        });
        let reaper_inner = Arc::clone(&inner);
        let reaper = std::thread::Builder::new()
            .name("sable-reaper".into())
            .spawn(move || reaper_loop(reaper_inner))?;
        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.inner.store
    }

    pub fn acquire_node_read_lock(
        &self,
        ctx: &SlaveContext,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        self.acquire_typed(ctx, LockType::Read, ResourceKind::Node, ids)
    }

    pub fn acquire_node_write_lock(
        &self,
        ctx: &SlaveContext,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        self.acquire_typed(ctx, LockType::Write, ResourceKind::Node, ids)
    }

    pub fn acquire_relationship_read_lock(
        &self,
        ctx: &SlaveContext,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        self.acquire_typed(ctx, LockType::Read, ResourceKind::Relationship, ids)
    }

    pub fn acquire_relationship_write_lock(
        &self,
        ctx: &SlaveContext,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        self.acquire_typed(ctx, LockType::Write, ResourceKind::Relationship, ids)
    }

    /// Wire-level entry point: an unknown resource code yields `NotLocked`
    /// rather than an error.
    pub fn acquire_lock(
        &self,
        ctx: &SlaveContext,
        lock_type: LockType,
        resource_code: u8,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        match ResourceKind::from_code(resource_code) {
            Some(kind) => self.acquire_typed(ctx, lock_type, kind, ids),
            None => self.inner.pack_response(ctx, LockResult::NotLocked),
        }
    }

    fn acquire_typed(
        &self,
        ctx: &SlaveContext,
        lock_type: LockType,
        kind: ResourceKind,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        let lock_result = self.inner.with_transaction(ctx, |tx| {
            for &id in ids {
                match tx.acquire_entity_lock(lock_type, kind, id) {
                    Ok(()) => {}
                    Err(SableError::Deadlock(message)) => {
                        return Ok(LockResult::Deadlock(message))
                    }
                    Err(error) => return Err(error),
                }
            }
            Ok(LockResult::Granted)
        })?;
        self.inner.pack_response(ctx, lock_result)
    }

    /// Applies a slave's prepared command stream to the named data source,
    /// producing the real transaction id. The response stream carries every
    /// committed transaction up to, but not including, the new one.
    pub fn commit_single_resource_transaction(
        &self,
        ctx: &SlaveContext,
        resource: &str,
        stream: &[u8],
    ) -> Result<Response<u64>> {
        if resource != DATA_SOURCE_NAME {
            return Err(SableError::InvalidArgument(format!(
                "unknown data source {resource}"
            )));
        }
        let tx_id = self
            .inner
            .with_transaction(ctx, |_tx| self.inner.store.apply_prepared_transaction(stream))?;
        self.inner
            .pack_response_with_horizon(ctx, tx_id, tx_id.saturating_sub(1))
    }

    /// Rolls back the context's transaction and removes it from the table.
    pub fn finish_transaction(&self, ctx: &SlaveContext) -> Result<Response<()>> {
        let (other, _entry) = self.inner.resume_envelope(ctx)?;
        self.inner.rollback_and_restore(other, ctx)?;
        self.inner.pack_response(ctx, ())
    }

    /// Returns the id for `name`, creating the token in its own transaction
    /// when it does not exist yet.
    pub fn create_relationship_type(
        &self,
        ctx: &SlaveContext,
        name: &str,
    ) -> Result<Response<u32>> {
        if let Some(id) = self.inner.store.cache().relationship_type_id(name) {
            return self.inner.pack_response(ctx, id);
        }
        let mut tx = self.inner.store.begin_tx();
        let id = self.inner.store.stores().relationship_types().next_id();
        tx.create_relationship_type(id, name);
        match self.inner.store.commit(&mut tx) {
            Ok(_) => self.inner.pack_response(ctx, id),
            Err(error) => {
                let _ = tx.rollback();
                Err(error)
            }
        }
    }

    /// Reserves a batch of ids from the matching generator. Not wrapped in
    /// any transaction.
    pub fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>> {
        let generator = self.inner.store.id_generator(id_type);
        let ids = generator.next_id_batch(self.inner.config.id_grab_size);
        Ok(Response::without_stream(IdAllocation {
            ids,
            high_id: generator.high_id(),
            defrag_count: generator.defrag_count(),
        }))
    }

    /// Rotates the log and streams the store through `writer`. The returned
    /// context is walked back one transaction for the graph data source so
    /// the slave always receives at least one transaction afterwards (the
    /// only way it learns the master id for a transaction id).
    pub fn copy_store(
        &self,
        ctx: &SlaveContext,
        writer: &mut dyn StoreWriter,
    ) -> Result<Response<()>> {
        self.inner.store.copy_store(writer)?;
        writer.done();
        let adjusted = self.ensure_at_least_one_tx(ctx);
        self.inner.pack_response(&adjusted, ())
    }

    pub fn get_master_id_for_committed_tx(&self, tx_id: u64) -> Result<Response<i32>> {
        Ok(Response::without_stream(
            self.inner.store.master_id_for_committed_tx(tx_id),
        ))
    }

    /// No-op whose response stream carries everything the slave is missing.
    pub fn pull_updates(&self, ctx: &SlaveContext) -> Result<Response<()>> {
        self.inner.pack_response(ctx, ())
    }

    /// Ongoing slave transactions grouped by machine id, for tooling.
    pub fn ongoing_transactions(&self) -> HashMap<i32, Vec<SlaveContext>> {
        let mut result: HashMap<i32, Vec<SlaveContext>> = HashMap::new();
        for ctx in self.inner.txs.lock().keys() {
            result.entry(ctx.machine_id()).or_default().push(ctx.clone());
        }
        result
    }

    /// Stops the reaper. Outstanding transactions are left alone; recovery
    /// handles them on restart.
    pub fn shutdown(&self) {
        {
            let mut flag = self.inner.shutdown.lock();
            *flag = true;
        }
        self.inner.shutdown_cv.notify_all();
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
        debug!("master coordinator shut down");
    }

    fn ensure_at_least_one_tx(&self, ctx: &SlaveContext) -> SlaveContext {
        let mut adjusted = Vec::new();
        for (resource, tx_id) in ctx.last_applied_transactions() {
            if resource == DATA_SOURCE_NAME {
                let last_committed = self.inner.store.last_committed_tx();
                if *tx_id <= 1 || *tx_id < last_committed {
                    // The slave will get a stream anyway.
                    return ctx.clone();
                }
                adjusted.push((resource.clone(), last_committed.saturating_sub(1)));
            } else {
                adjusted.push((resource.clone(), *tx_id));
            }
        }
        ctx.with_last_applied(adjusted)
    }
}

impl Drop for MasterCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reaper_loop(inner: Arc<Inner>) {
    loop {
        {
            let mut flag = inner.shutdown.lock();
            if *flag {
                break;
            }
            let _ = inner
                .shutdown_cv
                .wait_for(&mut flag, inner.config.reap_interval);
            if *flag {
                break;
            }
        }
        inner.reap_idle();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
