use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, SableError};
use crate::records::{DynamicKind, DynamicRecord, PropertyIndexData, PropertyIndexRecord};
use crate::store::dynamic::DynamicStore;
use crate::store::id::IdGenerator;

/// Store of property key tokens. Key names are immutable once created and
/// live in a nested dynamic store.
#[derive(Debug)]
pub struct PropertyIndexStore {
    records: RwLock<HashMap<u32, PropertyIndexRecord>>,
    ids: IdGenerator,
    keys: DynamicStore,
}

impl PropertyIndexStore {
    pub fn new(dynamic_block_size: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
            keys: DynamicStore::new(DynamicKind::KeyName, dynamic_block_size),
        }
    }

    pub fn get_record(&self, id: u32) -> Result<PropertyIndexRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(SableError::NotFound("property index", u64::from(id)))
    }

    pub fn make_heavy(&self, record: &mut PropertyIndexRecord) -> Result<()> {
        if record.key_records.is_empty() {
            record.key_records = self.keys.read_chain(record.key_block_id)?;
        }
        Ok(())
    }

    pub fn key_string(&self, record: &PropertyIndexRecord) -> Result<String> {
        let bytes = DynamicStore::assemble(&record.key_records);
        String::from_utf8(bytes)
            .map_err(|_| SableError::Corruption("property key name is not valid UTF-8".into()))
    }

    pub fn allocate_key_records(&self, key: &str) -> Vec<DynamicRecord> {
        self.keys.allocate(key.as_bytes())
    }

    pub fn update_record(&self, record: &PropertyIndexRecord) {
        for key_record in &record.key_records {
            self.keys.update_record(key_record);
        }
        if record.in_use {
            let mut stored = record.clone();
            stored.created = false;
            stored.key_records.clear();
            self.records.write().insert(record.id, stored);
        } else {
            self.records.write().remove(&record.id);
            self.ids.free_id(u64::from(record.id));
        }
    }

    /// Token data for `id`, reading the key name through the dynamic store.
    pub fn index_data(&self, id: u32) -> Result<PropertyIndexData> {
        let mut record = self.get_record(id)?;
        self.make_heavy(&mut record)?;
        let key = self.key_string(&record)?;
        Ok(PropertyIndexData { id, key })
    }

    /// Up to `count` tokens, lowest ids first.
    pub fn tokens(&self, count: usize) -> Result<Vec<PropertyIndexData>> {
        let mut ids: Vec<u32> = self.records.read().keys().copied().collect();
        ids.sort_unstable();
        ids.truncate(count);
        ids.into_iter().map(|id| self.index_data(id)).collect()
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

    pub fn free_key_block(&self, id: u64) {
        self.keys.free_block(id);
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn key_store(&self) -> &DynamicStore {
        &self.keys
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
        self.keys.refresh_high_id();
    }

    pub fn snapshot(&self) -> Vec<PropertyIndexRecord> {
        let mut records: Vec<PropertyIndexRecord> =
            self.records.read().values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }
}
