use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, SableError};
use crate::records::{
    inline_int_fits, pack_block_header, pack_inline_int, unpack_inline_int, DynamicKind,
    PropertyBlock, PropertyRecord, PropertyType, PropertyValue,
};
use crate::store::dynamic::DynamicStore;
use crate::store::id::IdGenerator;
use crate::store::index::PropertyIndexStore;

/// Property records plus the dynamic stores backing string and array values
/// and the key-name index store.
#[derive(Debug)]
pub struct PropertyStore {
    records: RwLock<HashMap<u64, PropertyRecord>>,
    ids: IdGenerator,
    strings: DynamicStore,
    arrays: DynamicStore,
    index: PropertyIndexStore,
}

impl PropertyStore {
    pub fn new(dynamic_block_size: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
            strings: DynamicStore::new(DynamicKind::StringBlock, dynamic_block_size),
            arrays: DynamicStore::new(DynamicKind::ArrayBlock, dynamic_block_size),
            index: PropertyIndexStore::new(dynamic_block_size),
        }
    }

    /// Loads a record with every dynamic chain materialized.
    pub fn get_record(&self, id: u64) -> Result<PropertyRecord> {
        let mut record = self.get_light_record(id)?;
        for block in &mut record.blocks {
            if block.light {
                self.make_heavy(block)?;
            }
        }
        Ok(record)
    }

    /// Loads a record without fetching dynamic chains.
    pub fn get_light_record(&self, id: u64) -> Result<PropertyRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(SableError::NotFound("property", id))
    }

    /// Fetches a light block's dynamic chain from the matching store.
    pub fn make_heavy(&self, block: &mut PropertyBlock) -> Result<()> {
        if !block.light {
            return Ok(());
        }
        let store = self.dynamic_store_for(block.ptype)?;
        block.value_records = store.read_chain(block.first_dynamic_id())?;
        block.light = false;
        Ok(())
    }

    /// Fills `block` from `value`, allocating a dynamic chain for string and
    /// array values. Any dynamic records already attached (for instance a
    /// dead chain from a value change) are preserved so the store write can
    /// free them.
    pub fn encode_value(
        &self,
        block: &mut PropertyBlock,
        key_id: u32,
        value: &PropertyValue,
    ) -> Result<()> {
        let ptype = value.property_type();
        let (header_payload, extra_blocks, chain) = match value {
            PropertyValue::Bool(flag) => (u64::from(*flag), Vec::new(), Vec::new()),
            PropertyValue::Int(int) if inline_int_fits(*int) => {
                (pack_inline_int(*int), Vec::new(), Vec::new())
            }
            PropertyValue::Int(int) => (0, vec![*int as u64], Vec::new()),
            PropertyValue::Float(float) => (0, vec![float.to_bits()], Vec::new()),
            PropertyValue::String(string) => {
                let chain = self.strings.allocate(string.as_bytes());
                (dynamic_pointer(&chain)?, Vec::new(), chain)
            }
            PropertyValue::Array(values) => {
                let mut bytes = Vec::with_capacity(values.len() * 8);
                for value in values {
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
                let chain = self.arrays.allocate(&bytes);
                (dynamic_pointer(&chain)?, Vec::new(), chain)
            }
        };
        let mut value_blocks = vec![pack_block_header(key_id, ptype, header_payload)?];
        value_blocks.extend(extra_blocks);
        block.key_id = key_id;
        block.ptype = ptype;
        block.light = false;
        block.value_blocks = value_blocks;
        block.value_records.extend(chain);
        Ok(())
    }

    /// Decodes a block back into its value. Dynamic blocks must have been
    /// made heavy first.
    pub fn value_of(&self, block: &PropertyBlock) -> Result<PropertyValue> {
        match block.ptype {
            PropertyType::Bool => Ok(PropertyValue::Bool(block.inline_payload() != 0)),
            PropertyType::Int => {
                if let Some(bits) = block.value_blocks.get(1) {
                    Ok(PropertyValue::Int(*bits as i64))
                } else {
                    Ok(PropertyValue::Int(unpack_inline_int(block.inline_payload())))
                }
            }
            PropertyType::Float => {
                let bits = block.value_blocks.get(1).ok_or_else(|| {
                    SableError::Corruption("float property block missing value bits".into())
                })?;
                Ok(PropertyValue::Float(f64::from_bits(*bits)))
            }
            PropertyType::String => {
                let bytes = self.live_chain_payload(block)?;
                let string = String::from_utf8(bytes).map_err(|_| {
                    SableError::Corruption("string property is not valid UTF-8".into())
                })?;
                Ok(PropertyValue::String(string))
            }
            PropertyType::Array => {
                let bytes = self.live_chain_payload(block)?;
                if bytes.len() % 8 != 0 {
                    return Err(SableError::Corruption(
                        "array property payload is not a multiple of 8 bytes".into(),
                    ));
                }
                let values = bytes
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut bits = [0u8; 8];
                        bits.copy_from_slice(chunk);
                        i64::from_be_bytes(bits)
                    })
                    .collect();
                Ok(PropertyValue::Array(values))
            }
        }
    }

    fn live_chain_payload(&self, block: &PropertyBlock) -> Result<Vec<u8>> {
        if block.light {
            return Err(SableError::IllegalState(format!(
                "property block for key {} is light; make it heavy first",
                block.key_id
            )));
        }
        let live: Vec<_> = block
            .value_records
            .iter()
            .filter(|record| record.in_use)
            .cloned()
            .collect();
        Ok(DynamicStore::assemble(&live))
    }

    pub fn update_record(&self, record: &PropertyRecord) {
        for block in &record.blocks {
            for value_record in &block.value_records {
                match value_record.kind {
                    DynamicKind::StringBlock => self.strings.update_record(value_record),
                    DynamicKind::ArrayBlock => self.arrays.update_record(value_record),
                    // Key and type name blocks never hang off property
                    // records; tolerate them rather than corrupt the store.
                    _ => {}
                }
            }
        }
        if record.in_use {
            let mut stored = record.clone();
            stored.created = false;
            stored.changed = false;
            stored.blocks.retain(|block| block.in_use);
            for block in &mut stored.blocks {
                block.created = false;
                block.value_records.clear();
                block.light = block.ptype.is_dynamic();
            }
            self.records.write().insert(record.id, stored);
        } else {
            self.records.write().remove(&record.id);
            self.ids.free_id(record.id);
        }
    }

    fn dynamic_store_for(&self, ptype: PropertyType) -> Result<&DynamicStore> {
        match ptype {
            PropertyType::String => Ok(&self.strings),
            PropertyType::Array => Ok(&self.arrays),
            other => Err(SableError::IllegalState(format!(
                "property type {other:?} has no dynamic store"
            ))),
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

    pub fn free_string_block(&self, id: u64) {
        self.strings.free_block(id);
    }

    pub fn free_array_block(&self, id: u64) {
        self.arrays.free_block(id);
    }

    pub fn string_store(&self) -> &DynamicStore {
        &self.strings
    }

    pub fn array_store(&self) -> &DynamicStore {
        &self.arrays
    }

    pub fn index_store(&self) -> &PropertyIndexStore {
        &self.index
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn refresh_high_ids(&self) {
        let high = self
            .records
            .read()
            .keys()
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        self.ids.set_high_id(high);
        self.strings.refresh_high_id();
        self.arrays.refresh_high_id();
        self.index.refresh_high_ids();
    }

    pub fn snapshot(&self) -> Vec<PropertyRecord> {
        let mut records: Vec<PropertyRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }
}

fn dynamic_pointer(chain: &[crate::records::DynamicRecord]) -> Result<u64> {
    let first = chain
        .first()
        .ok_or_else(|| SableError::IllegalState("empty dynamic chain".into()))?;
    if first.id > (1 << 36) - 1 {
        return Err(SableError::InvalidArgument(format!(
            "dynamic record id {} exceeds the inline pointer range",
            first.id
        )));
    }
    Ok(first.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_block() -> PropertyBlock {
        PropertyBlock {
            key_id: 0,
            ptype: PropertyType::Bool,
            in_use: true,
            created: true,
            light: false,
            value_blocks: Vec::new(),
            value_records: Vec::new(),
        }
    }

    #[test]
    fn inline_values_take_expected_sizes() -> Result<()> {
        let store = PropertyStore::new(64);
        let mut block = fresh_block();
        store.encode_value(&mut block, 1, &PropertyValue::Bool(true))?;
        assert_eq!(block.size(), 8);
        store.encode_value(&mut block, 1, &PropertyValue::Int(12))?;
        assert_eq!(block.size(), 8);
        store.encode_value(&mut block, 1, &PropertyValue::Int(i64::MAX))?;
        assert_eq!(block.size(), 16);
        store.encode_value(&mut block, 1, &PropertyValue::Float(1.5))?;
        assert_eq!(block.size(), 16);
        Ok(())
    }

    #[test]
    fn string_value_roundtrips_through_dynamic_chain() -> Result<()> {
        let store = PropertyStore::new(4);
        let mut block = fresh_block();
        let value = PropertyValue::String("a fairly long string".into());
        store.encode_value(&mut block, 3, &value)?;
        assert_eq!(block.size(), 8);
        assert!(block.value_records.len() > 1);
        assert_eq!(store.value_of(&block)?, value);

        // Persist the chain, then reload through a light block.
        let mut record = PropertyRecord::new(store.next_id());
        record.in_use = true;
        record.blocks.push(block);
        store.update_record(&record);
        let mut reloaded = store.get_light_record(record.id)?;
        assert!(reloaded.blocks[0].light);
        store.make_heavy(&mut reloaded.blocks[0])?;
        assert_eq!(store.value_of(&reloaded.blocks[0])?, value);
        Ok(())
    }

    #[test]
    fn array_value_roundtrips() -> Result<()> {
        let store = PropertyStore::new(64);
        let mut block = fresh_block();
        let value = PropertyValue::Array(vec![-1, 0, 7, i64::MIN]);
        store.encode_value(&mut block, 9, &value)?;
        assert_eq!(store.value_of(&block)?, value);
        Ok(())
    }

    #[test]
    fn deleting_a_record_frees_its_dynamic_chain() -> Result<()> {
        let store = PropertyStore::new(4);
        let mut block = fresh_block();
        store.encode_value(&mut block, 1, &PropertyValue::String("chained".into()))?;
        let chain_ids: Vec<u64> = block.value_records.iter().map(|r| r.id).collect();
        let mut record = PropertyRecord::new(store.next_id());
        record.in_use = true;
        record.blocks.push(block);
        store.update_record(&record);

        let mut dead = store.get_record(record.id)?;
        dead.in_use = false;
        for block in &mut dead.blocks {
            for value_record in &mut block.value_records {
                value_record.in_use = false;
            }
        }
        store.update_record(&dead);
        assert!(!store.is_in_use(record.id));
        for id in chain_ids {
            assert!(!store.string_store().is_in_use(id));
        }
        Ok(())
    }
}
