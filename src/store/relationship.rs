use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, SableError};
use crate::records::RelationshipRecord;
use crate::store::id::IdGenerator;

#[derive(Debug, Default)]
pub struct RelationshipStore {
    records: RwLock<HashMap<u64, RelationshipRecord>>,
    ids: IdGenerator,
}

impl RelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_record(&self, id: u64) -> Result<RelationshipRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(SableError::NotFound("relationship", id))
    }

    pub fn load_light(&self, id: u64) -> Option<RelationshipRecord> {
        self.records.read().get(&id).cloned()
    }

    pub fn update_record(&self, record: &RelationshipRecord) {
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

    pub fn snapshot(&self) -> Vec<RelationshipRecord> {
        let mut records: Vec<RelationshipRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }
}
