use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, SableError};
use crate::records::NodeRecord;
use crate::store::id::IdGenerator;

#[derive(Debug, Default)]
pub struct NodeStore {
    records: RwLock<HashMap<u64, NodeRecord>>,
    ids: IdGenerator,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_record(&self, id: u64) -> Result<NodeRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(SableError::NotFound("node", id))
    }

    pub fn load_light(&self, id: u64) -> Option<NodeRecord> {
        self.records.read().get(&id).cloned()
    }

    pub fn update_record(&self, record: &NodeRecord) {
        if record.in_use {
            let mut stored = record.clone();
            stored.created = false;
            self.records.write().insert(record.id, stored);
        } else {
            self.records.write().remove(&record.id);
            self.ids.free_id(record.id);
        }
    }

    pub fn is_in_use(&self, id: u64) -> bool {
        self.records.read().contains_key(&id)
    }

    pub fn next_id(&self) -> u64 {
        self.ids.next_id()
    }

    pub fn free_id(&self, id: u64) {
        self.ids.free_id(id);
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn refresh_high_id(&self) {
        let high = self
            .records
            .read()
            .keys()
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        self.ids.set_high_id(high);
    }

    /// Records sorted by id, for store copy.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }
}
