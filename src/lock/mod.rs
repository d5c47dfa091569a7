//! Keyed read/write lock service with deadlock detection.
//!
//! The key space is `(ResourceKind, id)`; owners are transaction
//! identifiers, not threads, so a suspended transaction keeps its locks
//! while it migrates between worker threads. Acquisition is reentrant per
//! owner. A blocked acquisition that would close a cycle in the wait-for
//! graph fails with [`SableError::Deadlock`] instead of waiting.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Result, SableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Node,
    Relationship,
}

impl ResourceKind {
    /// Maps a wire discriminant to a resource kind. Unknown codes are the
    /// protocol's illegal-resource case.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ResourceKind::Node),
            1 => Some(ResourceKind::Relationship),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: u64,
}

/// Lock owner: the identifier of the owning transaction.
pub type OwnerId = u32;

#[derive(Debug, Default)]
struct ResourceLock {
    readers: HashMap<OwnerId, u32>,
    writer: Option<OwnerId>,
    write_count: u32,
}

impl ResourceLock {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    fn holders(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.readers.keys().copied().chain(self.writer)
    }

    fn grantable(&self, lock_type: LockType, owner: OwnerId) -> bool {
        match lock_type {
            LockType::Read => self.writer.is_none() || self.writer == Some(owner),
            LockType::Write => {
                (self.writer.is_none() || self.writer == Some(owner))
                    && self
                        .readers
                        .keys()
                        .all(|reader| *reader == owner)
            }
        }
    }

    fn grant(&mut self, lock_type: LockType, owner: OwnerId) {
        match lock_type {
            LockType::Read => *self.readers.entry(owner).or_insert(0) += 1,
            LockType::Write => {
                self.writer = Some(owner);
                self.write_count += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    resources: HashMap<ResourceKey, ResourceLock>,
    /// Wait-for edges: owner -> resource it is currently blocked on.
    waiting_on: HashMap<OwnerId, ResourceKey>,
}

impl Tables {
    /// True when some current holder of `key` (transitively) waits on a
    /// resource held by `owner`, i.e. granting would have to wait forever.
    fn closes_cycle(&self, key: ResourceKey, owner: OwnerId) -> bool {
        let mut queue: VecDeque<OwnerId> = match self.resources.get(&key) {
            Some(lock) => lock.holders().filter(|h| *h != owner).collect(),
            None => return false,
        };
        let mut seen: Vec<OwnerId> = Vec::new();
        while let Some(holder) = queue.pop_front() {
            if holder == owner {
                return true;
            }
            if seen.contains(&holder) {
                continue;
            }
            seen.push(holder);
            if let Some(blocked_on) = self.waiting_on.get(&holder) {
                if let Some(lock) = self.resources.get(blocked_on) {
                    queue.extend(lock.holders());
                }
            }
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    tables: Mutex<Tables>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is granted, or fails fast with
    /// [`SableError::Deadlock`] when waiting would close a wait-for cycle.
    pub fn acquire(&self, lock_type: LockType, key: ResourceKey, owner: OwnerId) -> Result<()> {
        let mut tables = self.tables.lock();
        loop {
            let grantable = tables
                .resources
                .get(&key)
                .map(|lock| lock.grantable(lock_type, owner))
                .unwrap_or(true);
            if grantable {
                tables
                    .resources
                    .entry(key)
                    .or_default()
                    .grant(lock_type, owner);
                return Ok(());
            }
            if tables.closes_cycle(key, owner) {
                debug!(?key, owner, "lock wait would deadlock");
                return Err(SableError::Deadlock(format!(
                    "transaction {owner} waiting for {lock_type:?} lock on {key:?} forms a cycle"
                )));
            }
            tables.waiting_on.insert(owner, key);
            self.released.wait(&mut tables);
            tables.waiting_on.remove(&owner);
        }
    }

    pub fn release(&self, lock_type: LockType, key: ResourceKey, owner: OwnerId) -> Result<()> {
        let mut tables = self.tables.lock();
        let lock = tables.resources.get_mut(&key).ok_or_else(|| {
            SableError::IllegalState(format!("release of unheld lock on {key:?}"))
        })?;
        match lock_type {
            LockType::Read => {
                let count = lock.readers.get_mut(&owner).ok_or_else(|| {
                    SableError::IllegalState(format!(
                        "transaction {owner} does not hold a read lock on {key:?}"
                    ))
                })?;
                *count -= 1;
                if *count == 0 {
                    lock.readers.remove(&owner);
                }
            }
            LockType::Write => {
                if lock.writer != Some(owner) {
                    return Err(SableError::IllegalState(format!(
                        "transaction {owner} does not hold the write lock on {key:?}"
                    )));
                }
                lock.write_count -= 1;
                if lock.write_count == 0 {
                    lock.writer = None;
                }
            }
        }
        if lock.is_free() {
            tables.resources.remove(&key);
        }
        drop(tables);
        self.released.notify_all();
        Ok(())
    }
}
