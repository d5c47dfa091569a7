//! Plain record structures for the typed stores.
//!
//! All cross-record references are record ids, never pointers. Chain fields
//! use the `NO_*` sentinels below to mark the end of a chain.

use crate::error::{Result, SableError};

pub const NO_RELATIONSHIP: u64 = u64::MAX;
pub const NO_PROPERTY: u64 = u64::MAX;
pub const NO_DYNAMIC_BLOCK: u64 = u64::MAX;
pub const NO_TOKEN: u32 = u32::MAX;
pub const NO_MASTER: i32 = -1;

/// Maximum total size in bytes of the live property blocks packed into one
/// property record.
pub const PAYLOAD_CAP: usize = 32;

const KEY_BITS: u64 = 24;
const TYPE_BITS: u64 = 4;
const PAYLOAD_SHIFT: u64 = KEY_BITS + TYPE_BITS;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;
const PAYLOAD_MASK: u64 = (1 << 36) - 1;
const INLINE_INT_MAX: i64 = (1 << 35) - 1;
const INLINE_INT_MIN: i64 = -(1 << 35);

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: u64,
    pub in_use: bool,
    pub created: bool,
    pub next_rel: u64,
    pub next_prop: u64,
}

impl NodeRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            next_rel: NO_RELATIONSHIP,
            next_prop: NO_PROPERTY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRecord {
    pub id: u64,
    pub in_use: bool,
    pub created: bool,
    pub first_node: u64,
    pub second_node: u64,
    pub type_id: u32,
    pub first_prev_rel: u64,
    pub first_next_rel: u64,
    pub second_prev_rel: u64,
    pub second_next_rel: u64,
    pub next_prop: u64,
}

impl RelationshipRecord {
    pub fn new(id: u64, first_node: u64, second_node: u64, type_id: u32) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            first_node,
            second_node,
            type_id,
            first_prev_rel: NO_RELATIONSHIP,
            first_next_rel: NO_RELATIONSHIP,
            second_prev_rel: NO_RELATIONSHIP,
            second_next_rel: NO_RELATIONSHIP,
            next_prop: NO_PROPERTY,
        }
    }
}

/// Which primitive a property record hangs off once linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOwner {
    Node(u64),
    Relationship(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Array = 5,
}

impl PropertyType {
    /// String and array values live in a dynamic chain instead of inline
    /// value bits.
    pub fn is_dynamic(self) -> bool {
        matches!(self, PropertyType::String | PropertyType::Array)
    }

    pub fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            1 => Ok(PropertyType::Bool),
            2 => Ok(PropertyType::Int),
            3 => Ok(PropertyType::Float),
            4 => Ok(PropertyType::String),
            5 => Ok(PropertyType::Array),
            other => Err(SableError::Corruption(format!(
                "unknown property type bits {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<i64>),
}

impl PropertyValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Int(_) => PropertyType::Int,
            PropertyValue::Float(_) => PropertyType::Float,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Array(_) => PropertyType::Array,
        }
    }
}

/// Handle to one property as seen by callers of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyData {
    /// Id of the property record hosting the block.
    pub id: u64,
    pub key_id: u32,
    pub value: Option<PropertyValue>,
}

/// Classifies which dynamic store owns a block, so freed ids go back to the
/// right free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicKind {
    StringBlock = 1,
    ArrayBlock = 2,
    KeyName = 3,
    TypeName = 4,
}

impl DynamicKind {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(DynamicKind::StringBlock),
            2 => Ok(DynamicKind::ArrayBlock),
            3 => Ok(DynamicKind::KeyName),
            4 => Ok(DynamicKind::TypeName),
            other => Err(SableError::Corruption(format!(
                "unknown dynamic block kind {other}"
            ))),
        }
    }
}

/// Fixed-size byte block in a dynamic value chain.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicRecord {
    pub id: u64,
    pub kind: DynamicKind,
    pub in_use: bool,
    pub created: bool,
    pub data: Vec<u8>,
    pub next_block: u64,
}

impl DynamicRecord {
    pub fn new(id: u64, kind: DynamicKind) -> Self {
        Self {
            id,
            kind,
            in_use: false,
            created: false,
            data: Vec::new(),
            next_block: NO_DYNAMIC_BLOCK,
        }
    }
}

/// One property inside a property record.
///
/// `value_blocks[0]` packs the key id (24 bits), the type (4 bits) and 36
/// bits of inline payload; larger inline values spill into further blocks,
/// dynamic values keep the head of their chain in the payload bits. The key
/// and type are mirrored as fields for convenient access; the packed header
/// is authoritative on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyBlock {
    pub key_id: u32,
    pub ptype: PropertyType,
    pub in_use: bool,
    pub created: bool,
    /// Dynamic chain not yet loaded from the store.
    pub light: bool,
    pub value_blocks: Vec<u64>,
    pub value_records: Vec<DynamicRecord>,
}

impl PropertyBlock {
    pub fn size(&self) -> usize {
        8 * self.value_blocks.len()
    }

    pub fn first_dynamic_id(&self) -> u64 {
        self.value_blocks
            .first()
            .map(|header| (header >> PAYLOAD_SHIFT) & PAYLOAD_MASK)
            .unwrap_or(NO_DYNAMIC_BLOCK)
    }

    pub fn inline_payload(&self) -> u64 {
        self.value_blocks
            .first()
            .map(|header| (header >> PAYLOAD_SHIFT) & PAYLOAD_MASK)
            .unwrap_or(0)
    }

    /// Rebuilds the mirrored key/type fields from the packed header after a
    /// wire decode.
    pub fn from_value_blocks(value_blocks: Vec<u64>) -> Result<Self> {
        let header = *value_blocks
            .first()
            .ok_or_else(|| SableError::Corruption("property block without header".into()))?;
        let key_id = (header & KEY_MASK) as u32;
        let ptype = PropertyType::from_bits((header >> KEY_BITS) & ((1 << TYPE_BITS) - 1))?;
        Ok(Self {
            key_id,
            ptype,
            in_use: false,
            created: false,
            light: ptype.is_dynamic(),
            value_blocks,
            value_records: Vec::new(),
        })
    }
}

pub(crate) fn pack_block_header(key_id: u32, ptype: PropertyType, payload: u64) -> Result<u64> {
    if u64::from(key_id) > KEY_MASK {
        return Err(SableError::InvalidArgument(format!(
            "property key id {key_id} exceeds the 24-bit key space"
        )));
    }
    if payload > PAYLOAD_MASK {
        return Err(SableError::InvalidArgument(format!(
            "inline payload {payload} exceeds 36 bits"
        )));
    }
    Ok(u64::from(key_id) | ((ptype as u64) << KEY_BITS) | (payload << PAYLOAD_SHIFT))
}

pub(crate) fn inline_int_fits(value: i64) -> bool {
    (INLINE_INT_MIN..=INLINE_INT_MAX).contains(&value)
}

pub(crate) fn pack_inline_int(value: i64) -> u64 {
    (value as u64) & PAYLOAD_MASK
}

pub(crate) fn unpack_inline_int(payload: u64) -> i64 {
    // Sign-extend from 36 bits.
    ((payload << 28) as i64) >> 28
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRecord {
    pub id: u64,
    pub in_use: bool,
    pub created: bool,
    pub changed: bool,
    pub prev_prop: u64,
    pub next_prop: u64,
    pub owner: Option<PropertyOwner>,
    pub blocks: Vec<PropertyBlock>,
}

impl PropertyRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            changed: false,
            prev_prop: NO_PROPERTY,
            next_prop: NO_PROPERTY,
            owner: None,
            blocks: Vec::new(),
        }
    }

    /// Total size of the live blocks.
    pub fn size(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| block.in_use)
            .map(PropertyBlock::size)
            .sum()
    }

    pub fn block_for_key(&self, key_id: u32) -> Option<&PropertyBlock> {
        self.blocks
            .iter()
            .find(|block| block.in_use && block.key_id == key_id)
    }

    pub fn block_for_key_mut(&mut self, key_id: u32) -> Option<&mut PropertyBlock> {
        self.blocks
            .iter_mut()
            .find(|block| block.in_use && block.key_id == key_id)
    }

    pub fn add_block(&mut self, block: PropertyBlock) -> Result<()> {
        if self.size() + block.size() > PAYLOAD_CAP {
            return Err(SableError::Integrity(format!(
                "property record {} cannot fit another {} bytes",
                self.id,
                block.size()
            )));
        }
        self.blocks.push(block);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyIndexRecord {
    pub id: u32,
    pub in_use: bool,
    pub created: bool,
    pub key_block_id: u64,
    pub key_records: Vec<DynamicRecord>,
}

impl PropertyIndexRecord {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            key_block_id: NO_DYNAMIC_BLOCK,
            key_records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipTypeRecord {
    pub id: u32,
    pub in_use: bool,
    pub created: bool,
    pub type_block: u64,
    pub name_records: Vec<DynamicRecord>,
}

impl RelationshipTypeRecord {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            type_block: NO_DYNAMIC_BLOCK,
            name_records: Vec::new(),
        }
    }
}

/// Token data handed to the cache layer and to bulk token loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipTypeData {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyIndexData {
    pub id: u32,
    pub key: String,
}
