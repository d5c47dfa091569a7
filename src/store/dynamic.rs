use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, SableError};
use crate::records::{DynamicKind, DynamicRecord, NO_DYNAMIC_BLOCK};
use crate::store::id::IdGenerator;

/// Store of fixed-size byte blocks backing variable-length payloads.
///
/// Allocation only reserves ids and builds the chained records; nothing is
/// written until a command executes `update_record` at commit.
#[derive(Debug)]
pub struct DynamicStore {
    kind: DynamicKind,
    block_size: usize,
    blocks: RwLock<HashMap<u64, StoredBlock>>,
    ids: IdGenerator,
}

#[derive(Debug, Clone)]
struct StoredBlock {
    data: Vec<u8>,
    next_block: u64,
}

impl DynamicStore {
    pub fn new(kind: DynamicKind, block_size: usize) -> Self {
        Self {
            kind,
            block_size,
            blocks: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
        }
    }

    pub fn kind(&self) -> DynamicKind {
        self.kind
    }

    /// Chunks `payload` into a chain of freshly allocated records. The chain
    /// always has at least one record so the owner has a head id to point at.
    pub fn allocate(&self, payload: &[u8]) -> Vec<DynamicRecord> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(self.block_size).collect()
        };
        let mut records: Vec<DynamicRecord> = chunks
            .into_iter()
            .map(|chunk| {
                let mut record = DynamicRecord::new(self.ids.next_id(), self.kind);
                record.in_use = true;
                record.created = true;
                record.data = chunk.to_vec();
                record
            })
            .collect();
        for i in 0..records.len().saturating_sub(1) {
            let next = records[i + 1].id;
            records[i].next_block = next;
        }
        records
    }

    /// Walks the chain starting at `first_id`, re-materializing each record.
    pub fn read_chain(&self, first_id: u64) -> Result<Vec<DynamicRecord>> {
        let blocks = self.blocks.read();
        let mut records = Vec::new();
        let mut next = first_id;
        while next != NO_DYNAMIC_BLOCK {
            let stored = blocks.get(&next).ok_or_else(|| {
                SableError::Corruption(format!("dynamic chain broken at block {next}"))
            })?;
            let mut record = DynamicRecord::new(next, self.kind);
            record.in_use = true;
            record.data = stored.data.clone();
            record.next_block = stored.next_block;
            records.push(record);
            next = stored.next_block;
        }
        Ok(records)
    }

    /// Concatenates a chain's payload back together.
    pub fn assemble(records: &[DynamicRecord]) -> Vec<u8> {
        let mut payload = Vec::new();
        for record in records {
            payload.extend_from_slice(&record.data);
        }
        payload
    }

    pub fn update_record(&self, record: &DynamicRecord) {
        if record.in_use {
            self.blocks.write().insert(
                record.id,
                StoredBlock {
                    data: record.data.clone(),
                    next_block: record.next_block,
                },
            );
        } else {
            self.blocks.write().remove(&record.id);
            self.ids.free_id(record.id);
        }
    }

    pub fn free_block(&self, id: u64) {
        self.ids.free_id(id);
    }

    pub fn is_in_use(&self, id: u64) -> bool {
        self.blocks.read().contains_key(&id)
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn refresh_high_id(&self) {
        let high = self
            .blocks
            .read()
            .keys()
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        self.ids.set_high_id(high);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_chains_large_payloads() -> Result<()> {
        let store = DynamicStore::new(DynamicKind::StringBlock, 4);
        let records = store.allocate(b"hello world");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].next_block, records[1].id);
        assert_eq!(records[2].next_block, NO_DYNAMIC_BLOCK);
        for record in &records {
            store.update_record(record);
        }
        let read = store.read_chain(records[0].id)?;
        assert_eq!(DynamicStore::assemble(&read), b"hello world");
        Ok(())
    }

    #[test]
    fn empty_payload_still_gets_a_head_block() {
        let store = DynamicStore::new(DynamicKind::ArrayBlock, 8);
        let records = store.allocate(&[]);
        assert_eq!(records.len(), 1);
        assert!(records[0].data.is_empty());
    }

    #[test]
    fn deleting_a_block_frees_its_id() {
        let store = DynamicStore::new(DynamicKind::StringBlock, 8);
        let mut records = store.allocate(b"x");
        store.update_record(&records[0]);
        records[0].in_use = false;
        store.update_record(&records[0]);
        assert!(!store.is_in_use(records[0].id));
        assert_eq!(store.id_generator().defrag_count(), 1);
    }
}
