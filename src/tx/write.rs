//! The write transaction: staging, prepare, commit, rollback, recovery.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::RecordCache;
use crate::error::{Result, SableError};
use crate::lock::{LockManager, LockType, ResourceKey, ResourceKind};
use crate::records::{
    DynamicKind, NodeRecord, PropertyIndexRecord, PropertyOwner, PropertyRecord,
    RelationshipRecord, RelationshipTypeRecord, NO_RELATIONSHIP,
};
use crate::store::RecordStores;
use crate::tx::command::Command;
use crate::tx::log::LogicalLog;

/// A single write transaction over the record stores.
///
/// Every mutation lands in the per-kind staging maps; reads go staging-map
/// first so a transaction always observes its own uncommitted changes. No
/// store is touched before `commit`.
pub struct WriteTransaction {
    pub(crate) identifier: u32,
    pub(crate) stores: Arc<RecordStores>,
    pub(crate) cache: Arc<RecordCache>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) log: Arc<LogicalLog>,

    pub(crate) node_records: HashMap<u64, NodeRecord>,
    pub(crate) rel_records: HashMap<u64, RelationshipRecord>,
    pub(crate) property_records: HashMap<u64, PropertyRecord>,
    pub(crate) rel_type_records: HashMap<u32, RelationshipTypeRecord>,
    pub(crate) prop_index_records: HashMap<u32, PropertyIndexRecord>,

    pub(crate) node_commands: Vec<Command>,
    pub(crate) rel_commands: Vec<Command>,
    pub(crate) prop_commands: Vec<Command>,
    pub(crate) rel_type_commands: Vec<Command>,
    pub(crate) prop_index_commands: Vec<Command>,

    pub(crate) held_locks: Vec<(LockType, ResourceKey)>,
    pub(crate) rel_grab_size: usize,
    pub(crate) prepared: bool,
    pub(crate) committed: bool,
    pub(crate) recovered: bool,
}

impl WriteTransaction {
    pub(crate) fn new(
        identifier: u32,
        stores: Arc<RecordStores>,
        cache: Arc<RecordCache>,
        locks: Arc<LockManager>,
        log: Arc<LogicalLog>,
        rel_grab_size: usize,
    ) -> Self {
        Self {
            identifier,
            stores,
            cache,
            locks,
            log,
            node_records: HashMap::new(),
            rel_records: HashMap::new(),
            property_records: HashMap::new(),
            rel_type_records: HashMap::new(),
            prop_index_records: HashMap::new(),
            node_commands: Vec::new(),
            rel_commands: Vec::new(),
            prop_commands: Vec::new(),
            rel_type_commands: Vec::new(),
            prop_index_commands: Vec::new(),
            held_locks: Vec::new(),
            rel_grab_size,
            prepared: false,
            committed: false,
            recovered: false,
        }
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn is_read_only(&self) -> bool {
        if self.recovered {
            return self.node_commands.is_empty()
                && self.prop_commands.is_empty()
                && self.rel_commands.is_empty()
                && self.rel_type_commands.is_empty()
                && self.prop_index_commands.is_empty();
        }
        self.node_records.is_empty()
            && self.rel_records.is_empty()
            && self.rel_type_records.is_empty()
            && self.property_records.is_empty()
            && self.prop_index_records.is_empty()
    }

    // ---- staging accessors -------------------------------------------------

    pub(crate) fn staged_node(&self, id: u64) -> Option<&NodeRecord> {
        self.node_records.get(&id)
    }

    pub(crate) fn staged_relationship(&self, id: u64) -> Option<&RelationshipRecord> {
        self.rel_records.get(&id)
    }

    /// Staging-map-first node lookup; a miss loads from the store and stages
    /// the instance so later reads see the same copy.
    pub(crate) fn node_record(&mut self, id: u64) -> Result<&mut NodeRecord> {
        match self.node_records.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let record = self.stores.nodes().get_record(id)?;
                Ok(entry.insert(record))
            }
        }
    }

    pub(crate) fn rel_record(&mut self, id: u64) -> Result<&mut RelationshipRecord> {
        match self.rel_records.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let record = self.stores.relationships().get_record(id)?;
                Ok(entry.insert(record))
            }
        }
    }

    pub(crate) fn property_record(&mut self, id: u64, light: bool) -> Result<&mut PropertyRecord> {
        match self.property_records.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let record = if light {
                    self.stores.properties().get_light_record(id)?
                } else {
                    self.stores.properties().get_record(id)?
                };
                Ok(entry.insert(record))
            }
        }
    }

    // ---- node and relationship lifecycle ----------------------------------

    pub fn node_create(&mut self, node_id: u64) {
        let mut record = NodeRecord::new(node_id);
        record.in_use = true;
        record.created = true;
        self.node_records.insert(node_id, record);
    }

    /// Marks the node deleted and tears down its property chain, returning
    /// the removed properties for the caller to mirror into higher caches.
    pub fn node_delete(&mut self, node_id: u64) -> Result<HashMap<u32, crate::records::PropertyData>> {
        let record = self.node_record(node_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("node", node_id));
        }
        record.in_use = false;
        let next_prop = record.next_prop;
        self.delete_property_chain(next_prop)
    }

    pub fn relationship_create(
        &mut self,
        rel_id: u64,
        type_id: u32,
        first_node_id: u64,
        second_node_id: u64,
    ) -> Result<()> {
        let first = self.node_record(first_node_id)?;
        if !first.in_use {
            return Err(SableError::AlreadyDeleted("node", first_node_id));
        }
        let second = self.node_record(second_node_id)?;
        if !second.in_use {
            return Err(SableError::AlreadyDeleted("node", second_node_id));
        }
        let mut record = RelationshipRecord::new(rel_id, first_node_id, second_node_id, type_id);
        record.in_use = true;
        record.created = true;
        self.rel_records.insert(rel_id, record);
        self.connect_relationship(rel_id, first_node_id, second_node_id)
    }

    /// Deletes the relationship: property chain first, then the un-splice
    /// from both endpoint chains.
    pub fn rel_delete(&mut self, rel_id: u64) -> Result<HashMap<u32, crate::records::PropertyData>> {
        let record = self.rel_record(rel_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("relationship", rel_id));
        }
        let next_prop = record.next_prop;
        let property_map = self.delete_property_chain(next_prop)?;
        self.disconnect_relationship(rel_id)?;
        self.update_nodes(rel_id)?;
        self.rel_record(rel_id)?.in_use = false;
        Ok(property_map)
    }

    // ---- in-transaction reads ---------------------------------------------

    /// True when the node exists, staged or stored. Store hits warm the
    /// committed-record cache.
    pub fn node_load_light(&mut self, node_id: u64) -> bool {
        if self.staged_node(node_id).is_some() {
            return true;
        }
        if self.cache.cached_node(node_id).is_some() {
            return true;
        }
        match self.stores.nodes().load_light(node_id) {
            Some(record) => {
                self.cache.cache_node(record);
                true
            }
            None => false,
        }
    }

    /// The staged record if present (even when deleted in this transaction),
    /// otherwise the cached or stored one.
    pub fn rel_load_light(&mut self, rel_id: u64) -> Option<RelationshipRecord> {
        if let Some(record) = self.staged_relationship(rel_id) {
            return Some(record.clone());
        }
        if let Some(record) = self.cache.cached_relationship(rel_id) {
            return Some(record);
        }
        let record = self.stores.relationships().load_light(rel_id)?;
        self.cache.cache_relationship(record.clone());
        Some(record)
    }

    /// Head of the node's committed relationship chain, for incremental
    /// chain reads. A node created in this transaction has no committed
    /// chain yet.
    pub fn relationship_chain_position(&mut self, node_id: u64) -> Result<u64> {
        if let Some(record) = self.staged_node(node_id) {
            if record.created {
                return Ok(NO_RELATIONSHIP);
            }
        }
        Ok(self.stores.nodes().get_record(node_id)?.next_rel)
    }

    /// Walks up to the configured grab size of committed relationships from
    /// `position` on the node's chain, returning them and the next position.
    pub fn more_relationships(
        &mut self,
        node_id: u64,
        position: u64,
    ) -> Result<(Vec<RelationshipRecord>, u64)> {
        let grab_size = self.rel_grab_size;
        let mut batch = Vec::with_capacity(grab_size);
        let mut position = position;
        while position != NO_RELATIONSHIP && batch.len() < grab_size {
            let record = self.stores.relationships().get_record(position)?;
            position = if record.first_node == node_id {
                record.first_next_rel
            } else if record.second_node == node_id {
                record.second_next_rel
            } else {
                return Err(SableError::Integrity(format!(
                    "relationship {} does not belong to the chain of node {node_id}",
                    record.id
                )));
            };
            batch.push(record);
        }
        Ok((batch, position))
    }

    // ---- tokens ------------------------------------------------------------

    /// Creates a relationship type token. The name binding becomes visible
    /// to readers only when this transaction commits.
    pub fn create_relationship_type(&mut self, id: u32, name: &str) {
        let mut record = RelationshipTypeRecord::new(id);
        record.in_use = true;
        record.created = true;
        let name_records = self.stores.relationship_types().allocate_name_records(name);
        record.type_block = name_records[0].id;
        record.name_records = name_records;
        self.rel_type_records.insert(id, record);
        self.cache.stage_relationship_type(
            self.identifier,
            crate::records::RelationshipTypeData {
                id,
                name: name.to_owned(),
            },
        );
    }

    pub fn create_property_index(&mut self, key: &str, id: u32) {
        let mut record = PropertyIndexRecord::new(id);
        record.in_use = true;
        record.created = true;
        let key_records = self
            .stores
            .properties()
            .index_store()
            .allocate_key_records(key);
        record.key_block_id = key_records[0].id;
        record.key_records = key_records;
        self.prop_index_records.insert(id, record);
        self.cache.stage_property_key(
            self.identifier,
            crate::records::PropertyIndexData {
                id,
                key: key.to_owned(),
            },
        );
    }

    /// Key name for a property index, staged or stored.
    pub fn load_index(&mut self, id: u32) -> Result<String> {
        let index_store = self.stores.properties().index_store();
        if let Some(record) = self.prop_index_records.get(&id) {
            let mut record = record.clone();
            index_store.make_heavy(&mut record)?;
            return index_store.key_string(&record);
        }
        let mut record = index_store.get_record(id)?;
        index_store.make_heavy(&mut record)?;
        index_store.key_string(&record)
    }

    pub fn load_property_indexes(
        &self,
        count: usize,
    ) -> Result<Vec<crate::records::PropertyIndexData>> {
        self.stores.properties().index_store().tokens(count)
    }

    pub fn load_relationship_types(&self) -> Result<Vec<crate::records::RelationshipTypeData>> {
        self.stores.relationship_types().types()
    }

    pub fn is_node_created(&self, node_id: u64) -> bool {
        self.node_records
            .get(&node_id)
            .map(|record| record.created)
            .unwrap_or(false)
    }

    pub fn is_relationship_created(&self, rel_id: u64) -> bool {
        self.rel_records
            .get(&rel_id)
            .map(|record| record.created)
            .unwrap_or(false)
    }

    pub fn created_nodes(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .node_records
            .values()
            .filter(|record| record.created)
            .map(|record| record.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ---- locks -------------------------------------------------------------

    /// Acquires a lock owned by this transaction and registers it for
    /// release at commit or rollback.
    pub fn acquire_entity_lock(
        &mut self,
        lock_type: LockType,
        kind: ResourceKind,
        id: u64,
    ) -> Result<()> {
        let key = ResourceKey { kind, id };
        self.locks.acquire(lock_type, key, self.identifier)?;
        self.held_locks.push((lock_type, key));
        Ok(())
    }

    pub(crate) fn acquire_rel_write_lock(&mut self, rel_id: u64) -> Result<()> {
        self.acquire_entity_lock(LockType::Write, ResourceKind::Relationship, rel_id)
    }

    fn release_locks(&mut self) {
        for (lock_type, key) in self.held_locks.drain(..) {
            if let Err(error) = self.locks.release(lock_type, key, self.identifier) {
                warn!(%error, "failed to release lock at transaction end");
            }
        }
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Synthesizes one command per staged record, appends them to the
    /// logical log in kind order, and dispatches cache evictions for
    /// primitives that die. A deleted node that still heads a relationship
    /// chain fails the whole transaction.
    pub fn prepare(&mut self) -> Result<()> {
        if self.committed {
            return Err(SableError::IllegalState(format!(
                "cannot prepare committed transaction [{}]",
                self.identifier
            )));
        }
        if self.prepared {
            return Err(SableError::IllegalState(format!(
                "cannot prepare prepared transaction [{}]",
                self.identifier
            )));
        }
        for record in self.node_records.values() {
            if !record.in_use && record.next_rel != NO_RELATIONSHIP {
                return Err(SableError::Integrity(format!(
                    "node record {} still has relationships",
                    record.id
                )));
            }
        }
        self.prepared = true;

        for record in self.rel_type_records.values() {
            self.rel_type_commands
                .push(Command::RelationshipType(record.clone()));
        }
        for record in self.node_records.values() {
            self.node_commands.push(Command::Node(record.clone()));
            if !record.in_use {
                self.cache.evict_node(record.id);
            }
        }
        for record in self.rel_records.values() {
            self.rel_commands.push(Command::Relationship(record.clone()));
            if !record.in_use {
                self.cache.evict_relationship(record.id);
            }
        }
        for record in self.prop_index_records.values() {
            self.prop_index_commands
                .push(Command::PropertyIndex(record.clone()));
        }
        for record in self.property_records.values() {
            self.prop_commands.push(Command::Property(record.clone()));
        }

        let ordered = self
            .rel_type_commands
            .iter()
            .chain(self.node_commands.iter())
            .chain(self.rel_commands.iter())
            .chain(self.prop_index_commands.iter())
            .chain(self.prop_commands.iter());
        self.log.append_prepared(self.identifier, ordered)?;
        debug!(
            identifier = self.identifier,
            nodes = self.node_commands.len(),
            relationships = self.rel_commands.len(),
            properties = self.prop_commands.len(),
            "transaction prepared"
        );
        Ok(())
    }

    /// Executes the prepared command stream against the stores.
    ///
    /// `tx_id` must be exactly the next transaction id; anything else is an
    /// integrity failure that leaves the stores and the staged state alone
    /// so the caller can roll back.
    pub fn commit(&mut self, tx_id: u64) -> Result<()> {
        if !self.recovered && !self.prepared {
            return Err(SableError::IllegalState(format!(
                "cannot commit unprepared transaction [{}]",
                self.identifier
            )));
        }
        if self.recovered {
            return self.commit_recovered(tx_id);
        }
        let last_committed = self.stores.last_committed_tx();
        if tx_id != last_committed + 1 {
            return Err(SableError::Integrity(format!(
                "transaction id {tx_id} is not next ({last_committed})"
            )));
        }

        self.committed = true;
        self.node_commands.sort_by_key(Command::key);
        self.rel_commands.sort_by_key(Command::key);
        self.prop_commands.sort_by_key(Command::key);
        self.rel_type_commands.sort_by_key(Command::key);
        self.prop_index_commands.sort_by_key(Command::key);

        let stores = Arc::clone(&self.stores);
        for command in &self.rel_type_commands {
            command.execute(&stores);
        }
        for command in &self.prop_index_commands {
            command.execute(&stores);
        }
        let primitives = [&self.prop_commands, &self.rel_commands, &self.node_commands];
        execute_phase(&primitives, &stores, |command| {
            command.is_created() && !command.is_deleted()
        });
        execute_phase(&primitives, &stores, |command| {
            !command.is_created() && !command.is_deleted()
        });
        execute_phase(&primitives, &stores, Command::is_deleted);

        // Drop every touched primitive from the committed-record cache so
        // readers re-load the new store state.
        for command in &self.rel_commands {
            self.cache.evict_relationship(command.key());
        }
        for command in &self.node_commands {
            self.cache.evict_node(command.key());
        }
        self.cache.commit_cows(self.identifier);
        self.stores.set_last_committed_tx(tx_id);
        self.release_locks();
        self.clear_state();
        debug!(identifier = self.identifier, tx_id, "transaction committed");
        Ok(())
    }

    /// Commit path for a transaction reconstituted via `inject_command`:
    /// applies commands kind by kind, registers recovered tokens, and
    /// invalidates affected primitives, then refreshes the id generators
    /// around the committed-tx advance.
    fn commit_recovered(&mut self, tx_id: u64) -> Result<()> {
        self.committed = true;
        self.node_commands.sort_by_key(Command::key);
        self.rel_commands.sort_by_key(Command::key);
        self.prop_commands.sort_by_key(Command::key);
        self.rel_type_commands.sort_by_key(Command::key);
        self.prop_index_commands.sort_by_key(Command::key);

        let stores = Arc::clone(&self.stores);
        let result = (|| -> Result<()> {
            for command in &self.prop_index_commands {
                command.execute(&stores);
                let data = stores
                    .properties()
                    .index_store()
                    .index_data(command.key() as u32);
                if let Ok(data) = data {
                    self.cache.register_property_key(data);
                }
            }
            for command in &self.prop_commands {
                command.execute(&stores);
                if let Command::Property(record) = command {
                    match record.owner {
                        Some(PropertyOwner::Node(node_id)) => self.cache.evict_node(node_id),
                        Some(PropertyOwner::Relationship(rel_id)) => {
                            self.cache.evict_relationship(rel_id)
                        }
                        None => {}
                    }
                }
            }
            for command in &self.rel_type_commands {
                command.execute(&stores);
                if let Ok(data) = stores.relationship_types().type_data(command.key() as u32) {
                    self.cache.register_relationship_type(data);
                }
            }
            for command in &self.rel_commands {
                command.execute(&stores);
                self.cache.evict_relationship(command.key());
                if let Command::Relationship(record) = command {
                    self.cache.evict_node(record.first_node);
                    self.cache.evict_node(record.second_node);
                }
            }
            for command in &self.node_commands {
                command.execute(&stores);
                self.cache.evict_node(command.key());
            }
            self.stores.set_recovered_status(true);
            self.stores.set_last_committed_tx(tx_id);
            self.stores.set_recovered_status(false);
            self.stores.update_high_ids();
            Ok(())
        })();
        self.clear_state();
        debug!(
            identifier = self.identifier,
            tx_id, "recovered transaction committed"
        );
        result
    }

    /// Returns every id allocated by this transaction to its free list and
    /// invalidates the touched primitives. Never writes to a store.
    pub fn rollback(&mut self) -> Result<()> {
        if self.committed {
            return Err(SableError::IllegalState(format!(
                "cannot rollback committed transaction [{}]; recover and commit",
                self.identifier
            )));
        }
        for record in self.rel_type_records.values() {
            if record.created {
                self.stores.relationship_types().free_id(record.id);
                for name_record in &record.name_records {
                    if name_record.created {
                        self.stores
                            .relationship_types()
                            .free_name_block(name_record.id);
                    }
                }
            }
            self.cache.evict_relationship_type(record.id);
        }
        for record in self.node_records.values() {
            if record.created {
                self.stores.nodes().free_id(record.id);
            }
            self.cache.evict_node(record.id);
        }
        for record in self.rel_records.values() {
            if record.created {
                self.stores.relationships().free_id(record.id);
            }
            self.cache.evict_relationship(record.id);
        }
        for record in self.prop_index_records.values() {
            if record.created {
                self.stores.properties().index_store().free_id(record.id);
                for key_record in &record.key_records {
                    if key_record.created {
                        self.stores
                            .properties()
                            .index_store()
                            .free_key_block(key_record.id);
                    }
                }
            }
        }
        for record in self.property_records.values() {
            match record.owner {
                Some(PropertyOwner::Node(node_id)) => self.cache.evict_node(node_id),
                Some(PropertyOwner::Relationship(rel_id)) => {
                    self.cache.evict_relationship(rel_id)
                }
                None => {}
            }
            if record.created {
                self.stores.properties().free_id(record.id);
            }
            // Dynamic chains allocated in this transaction go back to their
            // free lists even when the host record predates it.
            for block in &record.blocks {
                for value_record in &block.value_records {
                    if value_record.created {
                        match value_record.kind {
                            DynamicKind::StringBlock => {
                                self.stores.properties().free_string_block(value_record.id)
                            }
                            DynamicKind::ArrayBlock => {
                                self.stores.properties().free_array_block(value_record.id)
                            }
                            other => {
                                return Err(SableError::Integrity(format!(
                                    "unexpected dynamic kind {other:?} on property record {}",
                                    record.id
                                )))
                            }
                        }
                    }
                }
            }
        }
        self.log.forget_prepared(self.identifier);
        self.cache.discard(self.identifier);
        self.release_locks();
        self.clear_state();
        debug!(identifier = self.identifier, "transaction rolled back");
        Ok(())
    }

    /// Feeds a decoded log command back into the transaction during
    /// recovery or foreign-transaction application.
    pub fn inject_command(&mut self, command: Command) {
        self.recovered = true;
        match command {
            Command::Node(_) => self.node_commands.push(command),
            Command::Relationship(_) => self.rel_commands.push(command),
            Command::Property(_) => self.prop_commands.push(command),
            Command::PropertyIndex(_) => self.prop_index_commands.push(command),
            Command::RelationshipType(_) => self.rel_type_commands.push(command),
        }
    }

    fn clear_state(&mut self) {
        self.node_records.clear();
        self.rel_records.clear();
        self.property_records.clear();
        self.rel_type_records.clear();
        self.prop_index_records.clear();
        self.node_commands.clear();
        self.rel_commands.clear();
        self.prop_commands.clear();
        self.rel_type_commands.clear();
        self.prop_index_commands.clear();
    }
}

fn execute_phase(
    lists: &[&Vec<Command>; 3],
    stores: &RecordStores,
    include: impl Fn(&Command) -> bool,
) {
    for list in lists {
        for command in list.iter() {
            if include(command) {
                command.execute(stores);
            }
        }
    }
}
