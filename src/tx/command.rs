//! Typed carriers of single record mutations.
//!
//! One command per mutated store record, appended to the logical log at
//! prepare time and executed against the stores at commit. Each command
//! carries the full after-image of its record, so a transaction can be
//! reconstituted from the log alone. The relationship command always
//! includes both endpoint node ids, which lets recovered replay invalidate
//! exactly the two endpoints of a deleted relationship.

use crate::error::{Result, SableError};
use crate::records::{
    DynamicKind, DynamicRecord, NodeRecord, PropertyBlock, PropertyIndexRecord, PropertyOwner,
    PropertyRecord, RelationshipRecord, RelationshipTypeRecord,
};
use crate::store::RecordStores;

const TAG_NODE: u8 = 1;
const TAG_RELATIONSHIP: u8 = 2;
const TAG_PROPERTY: u8 = 3;
const TAG_PROPERTY_INDEX: u8 = 4;
const TAG_RELATIONSHIP_TYPE: u8 = 5;

const FLAG_IN_USE: u8 = 0x1;
const FLAG_CREATED: u8 = 0x2;
const FLAG_CHANGED: u8 = 0x4;

const OWNER_NONE: u8 = 0;
const OWNER_NODE: u8 = 1;
const OWNER_RELATIONSHIP: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Node(NodeRecord),
    Relationship(RelationshipRecord),
    Property(PropertyRecord),
    PropertyIndex(PropertyIndexRecord),
    RelationshipType(RelationshipTypeRecord),
}

impl Command {
    /// Record id the command is keyed by; commit sorts each command list by
    /// this key ascending.
    pub fn key(&self) -> u64 {
        match self {
            Command::Node(record) => record.id,
            Command::Relationship(record) => record.id,
            Command::Property(record) => record.id,
            Command::PropertyIndex(record) => u64::from(record.id),
            Command::RelationshipType(record) => u64::from(record.id),
        }
    }

    pub fn is_created(&self) -> bool {
        match self {
            Command::Node(record) => record.created,
            Command::Relationship(record) => record.created,
            Command::Property(record) => record.created,
            Command::PropertyIndex(record) => record.created,
            Command::RelationshipType(record) => record.created,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Command::Node(record) => !record.in_use,
            Command::Relationship(record) => !record.in_use,
            Command::Property(record) => !record.in_use,
            Command::PropertyIndex(record) => !record.in_use,
            Command::RelationshipType(record) => !record.in_use,
        }
    }

    /// Applies the carried after-image to the matching store.
    pub fn execute(&self, stores: &RecordStores) {
        match self {
            Command::Node(record) => stores.nodes().update_record(record),
            Command::Relationship(record) => stores.relationships().update_record(record),
            Command::Property(record) => stores.properties().update_record(record),
            Command::PropertyIndex(record) => {
                stores.properties().index_store().update_record(record)
            }
            Command::RelationshipType(record) => {
                stores.relationship_types().update_record(record)
            }
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Command::Node(record) => {
                buf.push(TAG_NODE);
                buf.extend_from_slice(&record.id.to_be_bytes());
                buf.push(flags(record.in_use, record.created, false));
                buf.extend_from_slice(&record.next_rel.to_be_bytes());
                buf.extend_from_slice(&record.next_prop.to_be_bytes());
            }
            Command::Relationship(record) => {
                buf.push(TAG_RELATIONSHIP);
                buf.extend_from_slice(&record.id.to_be_bytes());
                buf.push(flags(record.in_use, record.created, false));
                buf.extend_from_slice(&record.first_node.to_be_bytes());
                buf.extend_from_slice(&record.second_node.to_be_bytes());
                buf.extend_from_slice(&record.type_id.to_be_bytes());
                buf.extend_from_slice(&record.first_prev_rel.to_be_bytes());
                buf.extend_from_slice(&record.first_next_rel.to_be_bytes());
                buf.extend_from_slice(&record.second_prev_rel.to_be_bytes());
                buf.extend_from_slice(&record.second_next_rel.to_be_bytes());
                buf.extend_from_slice(&record.next_prop.to_be_bytes());
            }
            Command::Property(record) => {
                buf.push(TAG_PROPERTY);
                buf.extend_from_slice(&record.id.to_be_bytes());
                buf.push(flags(record.in_use, record.created, record.changed));
                buf.extend_from_slice(&record.prev_prop.to_be_bytes());
                buf.extend_from_slice(&record.next_prop.to_be_bytes());
                match record.owner {
                    None => buf.push(OWNER_NONE),
                    Some(PropertyOwner::Node(id)) => {
                        buf.push(OWNER_NODE);
                        buf.extend_from_slice(&id.to_be_bytes());
                    }
                    Some(PropertyOwner::Relationship(id)) => {
                        buf.push(OWNER_RELATIONSHIP);
                        buf.extend_from_slice(&id.to_be_bytes());
                    }
                }
                buf.push(record.blocks.len() as u8);
                for block in &record.blocks {
                    encode_block(block, buf);
                }
            }
            Command::PropertyIndex(record) => {
                buf.push(TAG_PROPERTY_INDEX);
                buf.extend_from_slice(&record.id.to_be_bytes());
                buf.push(flags(record.in_use, record.created, false));
                buf.extend_from_slice(&record.key_block_id.to_be_bytes());
                encode_dynamic_records(&record.key_records, buf);
            }
            Command::RelationshipType(record) => {
                buf.push(TAG_RELATIONSHIP_TYPE);
                buf.extend_from_slice(&record.id.to_be_bytes());
                buf.push(flags(record.in_use, record.created, false));
                buf.extend_from_slice(&record.type_block.to_be_bytes());
                encode_dynamic_records(&record.name_records, buf);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes one command, returning it and the number of bytes consumed.
    /// An unknown tag is a fatal decode error.
    pub fn decode(buf: &[u8]) -> Result<(Command, usize)> {
        let mut reader = Reader::new(buf);
        let tag = reader.u8()?;
        let command = match tag {
            TAG_NODE => {
                let id = reader.u64()?;
                let mut record = NodeRecord::new(id);
                let flag_bits = reader.u8()?;
                record.in_use = flag_bits & FLAG_IN_USE != 0;
                record.created = flag_bits & FLAG_CREATED != 0;
                record.next_rel = reader.u64()?;
                record.next_prop = reader.u64()?;
                Command::Node(record)
            }
            TAG_RELATIONSHIP => {
                let id = reader.u64()?;
                let flag_bits = reader.u8()?;
                let first_node = reader.u64()?;
                let second_node = reader.u64()?;
                let type_id = reader.u32()?;
                let mut record = RelationshipRecord::new(id, first_node, second_node, type_id);
                record.in_use = flag_bits & FLAG_IN_USE != 0;
                record.created = flag_bits & FLAG_CREATED != 0;
                record.first_prev_rel = reader.u64()?;
                record.first_next_rel = reader.u64()?;
                record.second_prev_rel = reader.u64()?;
                record.second_next_rel = reader.u64()?;
                record.next_prop = reader.u64()?;
                Command::Relationship(record)
            }
            TAG_PROPERTY => {
                let id = reader.u64()?;
                let mut record = PropertyRecord::new(id);
                let flag_bits = reader.u8()?;
                record.in_use = flag_bits & FLAG_IN_USE != 0;
                record.created = flag_bits & FLAG_CREATED != 0;
                record.changed = flag_bits & FLAG_CHANGED != 0;
                record.prev_prop = reader.u64()?;
                record.next_prop = reader.u64()?;
                record.owner = match reader.u8()? {
                    OWNER_NONE => None,
                    OWNER_NODE => Some(PropertyOwner::Node(reader.u64()?)),
                    OWNER_RELATIONSHIP => Some(PropertyOwner::Relationship(reader.u64()?)),
                    other => {
                        return Err(SableError::Corruption(format!(
                            "unknown property owner tag {other}"
                        )))
                    }
                };
                let block_count = reader.u8()?;
                for _ in 0..block_count {
                    record.blocks.push(decode_block(&mut reader)?);
                }
                Command::Property(record)
            }
            TAG_PROPERTY_INDEX => {
                let id = reader.u32()?;
                let mut record = PropertyIndexRecord::new(id);
                let flag_bits = reader.u8()?;
                record.in_use = flag_bits & FLAG_IN_USE != 0;
                record.created = flag_bits & FLAG_CREATED != 0;
                record.key_block_id = reader.u64()?;
                record.key_records = decode_dynamic_records(&mut reader)?;
                Command::PropertyIndex(record)
            }
            TAG_RELATIONSHIP_TYPE => {
                let id = reader.u32()?;
                let mut record = RelationshipTypeRecord::new(id);
                let flag_bits = reader.u8()?;
                record.in_use = flag_bits & FLAG_IN_USE != 0;
                record.created = flag_bits & FLAG_CREATED != 0;
                record.type_block = reader.u64()?;
                record.name_records = decode_dynamic_records(&mut reader)?;
                Command::RelationshipType(record)
            }
            other => {
                return Err(SableError::Corruption(format!(
                    "unknown command tag {other}"
                )))
            }
        };
        Ok((command, reader.consumed()))
    }
}

/// Serializes a whole command stream, the unit a slave ships to the master.
pub fn encode_stream(commands: &[Command]) -> Vec<u8> {
    let mut buf = Vec::new();
    for command in commands {
        command.encode_into(&mut buf);
    }
    buf
}

pub fn decode_stream(mut buf: &[u8]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    while !buf.is_empty() {
        let (command, consumed) = Command::decode(buf)?;
        commands.push(command);
        buf = &buf[consumed..];
    }
    Ok(commands)
}

fn flags(in_use: bool, created: bool, changed: bool) -> u8 {
    let mut bits = 0;
    if in_use {
        bits |= FLAG_IN_USE;
    }
    if created {
        bits |= FLAG_CREATED;
    }
    if changed {
        bits |= FLAG_CHANGED;
    }
    bits
}

fn encode_block(block: &PropertyBlock, buf: &mut Vec<u8>) {
    buf.push(flags(block.in_use, block.created, false));
    buf.push(block.value_blocks.len() as u8);
    for value_block in &block.value_blocks {
        buf.extend_from_slice(&value_block.to_be_bytes());
    }
    encode_dynamic_records(&block.value_records, buf);
}

fn decode_block(reader: &mut Reader<'_>) -> Result<PropertyBlock> {
    let flag_bits = reader.u8()?;
    let value_block_count = reader.u8()?;
    let mut value_blocks = Vec::with_capacity(value_block_count as usize);
    for _ in 0..value_block_count {
        value_blocks.push(reader.u64()?);
    }
    let mut block = PropertyBlock::from_value_blocks(value_blocks)?;
    block.in_use = flag_bits & FLAG_IN_USE != 0;
    block.created = flag_bits & FLAG_CREATED != 0;
    block.value_records = decode_dynamic_records(reader)?;
    if !block.value_records.is_empty() {
        block.light = false;
    }
    Ok(block)
}

fn encode_dynamic_records(records: &[DynamicRecord], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for record in records {
        buf.push(record.kind as u8);
        buf.extend_from_slice(&record.id.to_be_bytes());
        buf.push(flags(record.in_use, record.created, false));
        buf.extend_from_slice(&record.next_block.to_be_bytes());
        buf.extend_from_slice(&(record.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&record.data);
    }
}

fn decode_dynamic_records(reader: &mut Reader<'_>) -> Result<Vec<DynamicRecord>> {
    let count = reader.u16()?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = DynamicKind::from_code(reader.u8()?)?;
        let id = reader.u64()?;
        let mut record = DynamicRecord::new(id, kind);
        let flag_bits = reader.u8()?;
        record.in_use = flag_bits & FLAG_IN_USE != 0;
        record.created = flag_bits & FLAG_CREATED != 0;
        record.next_block = reader.u64()?;
        let len = reader.u32()? as usize;
        record.data = reader.bytes(len)?.to_vec();
        records.push(record);
    }
    Ok(records)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(SableError::Corruption("command payload truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(arr))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }
}
