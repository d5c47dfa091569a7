//! Property chain placement and value operations.

use std::collections::HashMap;

use crate::error::{Result, SableError};
use crate::records::{
    PropertyBlock, PropertyData, PropertyOwner, PropertyRecord, PropertyType, PropertyValue,
    NO_PROPERTY, PAYLOAD_CAP,
};
use crate::tx::write::WriteTransaction;

impl WriteTransaction {
    pub fn node_add_property(
        &mut self,
        node_id: u64,
        key_id: u32,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        let record = self.node_record(node_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("node", node_id));
        }
        self.add_property(PropertyOwner::Node(node_id), key_id, value)
    }

    pub fn rel_add_property(
        &mut self,
        rel_id: u64,
        key_id: u32,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        let record = self.rel_record(rel_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("relationship", rel_id));
        }
        self.add_property(PropertyOwner::Relationship(rel_id), key_id, value)
    }

    fn add_property(
        &mut self,
        owner: PropertyOwner,
        key_id: u32,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        let mut block = PropertyBlock {
            key_id,
            ptype: PropertyType::Bool,
            in_use: true,
            created: true,
            light: false,
            value_blocks: Vec::new(),
            value_records: Vec::new(),
        };
        // Encode before any chain mutation so a bad value cannot leave the
        // transaction half changed.
        self.stores
            .properties()
            .encode_value(&mut block, key_id, &value)?;
        let host = self.place_block(block, owner)?;
        Ok(PropertyData {
            id: host,
            key_id,
            value: Some(value),
        })
    }

    pub fn node_change_property(
        &mut self,
        node_id: u64,
        property: &PropertyData,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        let record = self.node_record(node_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("node", node_id));
        }
        self.change_property(PropertyOwner::Node(node_id), property, value)
    }

    pub fn rel_change_property(
        &mut self,
        rel_id: u64,
        property: &PropertyData,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        let record = self.rel_record(rel_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("relationship", rel_id));
        }
        self.change_property(PropertyOwner::Relationship(rel_id), property, value)
    }

    /// Mutates the block in place when the new encoding fits in its old
    /// footprint, otherwise retires the block and re-places the value as a
    /// fresh block, possibly in a different record of the chain.
    fn change_property(
        &mut self,
        owner: PropertyOwner,
        property: &PropertyData,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        let property_id = property.id;
        let stores = std::sync::Arc::clone(&self.stores);
        let record = self.property_record(property_id, true)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("property", property_id));
        }
        record.owner = Some(owner);
        record.changed = true;
        let block = record
            .block_for_key_mut(property.key_id)
            .ok_or(SableError::MissingBlock {
                record: property_id,
                key: property.key_id,
            })?;
        if block.light {
            stores.properties().make_heavy(block)?;
        }
        // The old value's dynamic chain dies with the change; keep the dead
        // records attached so the store write frees them.
        for value_record in &mut block.value_records {
            value_record.in_use = false;
        }
        let dead_count = block.value_records.len();
        let old_size = block.size();
        stores
            .properties()
            .encode_value(block, property.key_id, &value)?;
        if old_size < block.size() {
            let fresh_records = block.value_records.split_off(dead_count);
            let moved = PropertyBlock {
                key_id: block.key_id,
                ptype: block.ptype,
                in_use: true,
                created: false,
                light: false,
                value_blocks: block.value_blocks.clone(),
                value_records: fresh_records,
            };
            block.in_use = false;
            let host = self.place_block(moved, owner)?;
            return Ok(PropertyData {
                id: host,
                key_id: property.key_id,
                value: Some(value),
            });
        }
        Ok(PropertyData {
            id: property_id,
            key_id: property.key_id,
            value: Some(value),
        })
    }

    pub fn node_remove_property(&mut self, node_id: u64, property: &PropertyData) -> Result<()> {
        let record = self.node_record(node_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("node", node_id));
        }
        self.remove_property(PropertyOwner::Node(node_id), property)
    }

    pub fn rel_remove_property(&mut self, rel_id: u64, property: &PropertyData) -> Result<()> {
        let record = self.rel_record(rel_id)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("relationship", rel_id));
        }
        self.remove_property(PropertyOwner::Relationship(rel_id), property)
    }

    fn remove_property(&mut self, owner: PropertyOwner, property: &PropertyData) -> Result<()> {
        let property_id = property.id;
        let stores = std::sync::Arc::clone(&self.stores);
        let record = self.property_record(property_id, false)?;
        if !record.in_use {
            return Err(SableError::AlreadyDeleted("property", property_id));
        }
        record.owner = Some(owner);
        let block = record
            .block_for_key_mut(property.key_id)
            .ok_or(SableError::MissingBlock {
                record: property_id,
                key: property.key_id,
            })?;
        if block.light {
            stores.properties().make_heavy(block)?;
        }
        block.in_use = false;
        for value_record in &mut block.value_records {
            value_record.in_use = false;
        }
        if record.size() > 0 {
            // Live blocks remain; the record stays in the chain.
            return Ok(());
        }
        self.unlink_property_record(property_id, owner)
    }

    /// Unlinks an emptied property record from its owner's chain.
    fn unlink_property_record(&mut self, property_id: u64, owner: PropertyOwner) -> Result<()> {
        let (prev_prop, next_prop) = {
            let record = self.property_record(property_id, true)?;
            record.in_use = false;
            (record.prev_prop, record.next_prop)
        };
        if self.primitive_next_prop(owner)? == property_id {
            self.set_primitive_next_prop(owner, next_prop)?;
        }
        if prev_prop != NO_PROPERTY {
            let prev = self.property_record(prev_prop, true)?;
            debug_assert!(prev.in_use);
            prev.next_prop = next_prop;
        }
        if next_prop != NO_PROPERTY {
            let next = self.property_record(next_prop, true)?;
            debug_assert!(next.in_use);
            next.prev_prop = prev_prop;
        }
        Ok(())
    }

    /// Walks the owner's chain and drops the block into the first record
    /// with room; when none fits, a fresh record is prepended as the new
    /// head. Returns the id of the hosting record.
    fn place_block(&mut self, block: PropertyBlock, owner: PropertyOwner) -> Result<u64> {
        let block_size = block.size();
        let mut next_prop = self.primitive_next_prop(owner)?;
        let mut host: Option<u64> = None;
        while next_prop != NO_PROPERTY {
            let record = self.property_record(next_prop, false)?;
            let fits = record.size() + block_size <= PAYLOAD_CAP;
            let record_id = record.id;
            next_prop = record.next_prop;
            if fits {
                host = Some(record_id);
                break;
            }
        }
        match host {
            Some(record_id) => {
                self.property_record(record_id, false)?.add_block(block)?;
                Ok(record_id)
            }
            None => {
                let record_id = self.stores.properties().next_id();
                let mut record = PropertyRecord::new(record_id);
                record.in_use = true;
                record.created = true;
                record.owner = Some(owner);
                let old_head = self.primitive_next_prop(owner)?;
                if old_head != NO_PROPERTY {
                    let prev = self.property_record(old_head, true)?;
                    debug_assert_eq!(prev.prev_prop, NO_PROPERTY);
                    prev.prev_prop = record_id;
                    record.next_prop = old_head;
                }
                record.add_block(block)?;
                self.property_records.insert(record_id, record);
                self.set_primitive_next_prop(owner, record_id)?;
                Ok(record_id)
            }
        }
    }

    /// Tears down an entire property chain for a primitive delete,
    /// collecting the removed properties for the caller.
    pub(crate) fn delete_property_chain(
        &mut self,
        starting_at: u64,
    ) -> Result<HashMap<u32, PropertyData>> {
        let stores = std::sync::Arc::clone(&self.stores);
        let mut result = HashMap::new();
        let mut next_prop = starting_at;
        while next_prop != NO_PROPERTY {
            let record = self.property_record(next_prop, false)?;
            let record_id = record.id;
            for block in &mut record.blocks {
                if block.light {
                    stores.properties().make_heavy(block)?;
                }
                if block.in_use {
                    let value = stores.properties().value_of(block)?;
                    result.insert(
                        block.key_id,
                        PropertyData {
                            id: record_id,
                            key_id: block.key_id,
                            value: Some(value),
                        },
                    );
                }
                for value_record in &mut block.value_records {
                    value_record.in_use = false;
                }
            }
            next_prop = record.next_prop;
            record.in_use = false;
        }
        Ok(result)
    }

    /// Committed properties of a node, bypassing this transaction's staged
    /// state. `None` when the node was created here and has no committed
    /// chain yet.
    pub fn node_load_properties(
        &mut self,
        node_id: u64,
        light: bool,
    ) -> Result<Option<HashMap<u32, PropertyData>>> {
        if let Some(record) = self.staged_node(node_id) {
            if record.created {
                return Ok(None);
            }
            if !record.in_use && !light {
                return Err(SableError::IllegalState(format!(
                    "node {node_id} has been deleted in this transaction"
                )));
            }
        }
        let record = self.stores.nodes().get_record(node_id)?;
        Ok(Some(self.load_property_chain(record.next_prop)?))
    }

    pub fn rel_load_properties(
        &mut self,
        rel_id: u64,
        light: bool,
    ) -> Result<Option<HashMap<u32, PropertyData>>> {
        if let Some(record) = self.staged_relationship(rel_id) {
            if record.created {
                return Ok(None);
            }
            if !record.in_use && !light {
                return Err(SableError::IllegalState(format!(
                    "relationship {rel_id} has been deleted in this transaction"
                )));
            }
        }
        let record = self.stores.relationships().get_record(rel_id)?;
        Ok(Some(self.load_property_chain(record.next_prop)?))
    }

    fn load_property_chain(&self, starting_at: u64) -> Result<HashMap<u32, PropertyData>> {
        let properties = self.stores.properties();
        let mut result = HashMap::new();
        let mut next_prop = starting_at;
        while next_prop != NO_PROPERTY {
            let record = properties.get_record(next_prop)?;
            for block in &record.blocks {
                if block.in_use {
                    result.insert(
                        block.key_id,
                        PropertyData {
                            id: record.id,
                            key_id: block.key_id,
                            value: Some(properties.value_of(block)?),
                        },
                    );
                }
            }
            next_prop = record.next_prop;
        }
        Ok(result)
    }

    /// Reads one committed value through the store, fetching the dynamic
    /// chain on demand.
    pub fn load_property_value(&self, property: &PropertyData) -> Result<PropertyValue> {
        let properties = self.stores.properties();
        let record = properties.get_light_record(property.id)?;
        let mut block = record
            .block_for_key(property.key_id)
            .cloned()
            .ok_or(SableError::MissingBlock {
                record: property.id,
                key: property.key_id,
            })?;
        if block.light {
            properties.make_heavy(&mut block)?;
        }
        properties.value_of(&block)
    }

    fn primitive_next_prop(&mut self, owner: PropertyOwner) -> Result<u64> {
        match owner {
            PropertyOwner::Node(node_id) => Ok(self.node_record(node_id)?.next_prop),
            PropertyOwner::Relationship(rel_id) => Ok(self.rel_record(rel_id)?.next_prop),
        }
    }

    fn set_primitive_next_prop(&mut self, owner: PropertyOwner, next_prop: u64) -> Result<()> {
        match owner {
            PropertyOwner::Node(node_id) => self.node_record(node_id)?.next_prop = next_prop,
            PropertyOwner::Relationship(rel_id) => self.rel_record(rel_id)?.next_prop = next_prop,
        }
        Ok(())
    }
}
