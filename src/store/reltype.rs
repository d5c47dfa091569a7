use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, SableError};
use crate::records::{DynamicKind, DynamicRecord, RelationshipTypeData, RelationshipTypeRecord};
use crate::store::dynamic::DynamicStore;
use crate::store::id::IdGenerator;

/// Store of relationship type tokens. Type names are immutable once created.
#[derive(Debug)]
pub struct RelationshipTypeStore {
    records: RwLock<HashMap<u32, RelationshipTypeRecord>>,
    ids: IdGenerator,
    names: DynamicStore,
}

impl RelationshipTypeStore {
    pub fn new(dynamic_block_size: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
            names: DynamicStore::new(DynamicKind::TypeName, dynamic_block_size),
        }
    }

    pub fn get_record(&self, id: u32) -> Result<RelationshipTypeRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(SableError::NotFound("relationship type", u64::from(id)))
    }

    pub fn make_heavy(&self, record: &mut RelationshipTypeRecord) -> Result<()> {
        if record.name_records.is_empty() {
            record.name_records = self.names.read_chain(record.type_block)?;
        }
        Ok(())
    }

    pub fn allocate_name_records(&self, name: &str) -> Vec<DynamicRecord> {
        self.names.allocate(name.as_bytes())
    }

    pub fn update_record(&self, record: &RelationshipTypeRecord) {
        for name_record in &record.name_records {
            self.names.update_record(name_record);
        }
        if record.in_use {
            let mut stored = record.clone();
            stored.created = false;
            stored.name_records.clear();
            self.records.write().insert(record.id, stored);
        } else {
            self.records.write().remove(&record.id);
            self.ids.free_id(u64::from(record.id));
        }
    }

    pub fn type_data(&self, id: u32) -> Result<RelationshipTypeData> {
        let mut record = self.get_record(id)?;
        self.make_heavy(&mut record)?;
        let bytes = DynamicStore::assemble(&record.name_records);
        let name = String::from_utf8(bytes).map_err(|_| {
            SableError::Corruption("relationship type name is not valid UTF-8".into())
        })?;
        Ok(RelationshipTypeData { id, name })
    }

    pub fn types(&self) -> Result<Vec<RelationshipTypeData>> {
        let mut ids: Vec<u32> = self.records.read().keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| self.type_data(id)).collect()
    }

    pub fn is_in_use(&self, id: u32) -> bool {
        self.records.read().contains_key(&id)
    }

    pub fn next_id(&self) -> u32 {
        self.ids.next_id() as u32
    }

    pub fn free_id(&self, id: u32) {
        self.ids.free_id(u64::from(id));
    }

    pub fn free_name_block(&self, id: u64) {
        self.names.free_block(id);
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn name_store(&self) -> &DynamicStore {
        &self.names
    }

    pub fn refresh_high_ids(&self) {
        let high = self
            .records
            .read()
            .keys()
            .max()
            .map(|id| u64::from(*id) + 1)
            .unwrap_or(0);
        self.ids.set_high_id(high);
        self.names.refresh_high_id();
    }

    pub fn snapshot(&self) -> Vec<RelationshipTypeRecord> {
        let mut records: Vec<RelationshipTypeRecord> =
            self.records.read().values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }
}
