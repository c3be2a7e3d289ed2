//! Event schema: the fixed byte layout of one event.
//!
//! Every event in a stream is a flat little-endian record: an 18-byte
//! header (timestamp, sequence number, event kind) followed by the
//! stream's attributes at fixed offsets. The schema is computed once per
//! stream, is immutable afterwards, and is shared read-only by every
//! buffer and kernel touching that stream.

use std::sync::Arc;

use crate::error::{Result, SluiceError};

/// Byte offset of the event timestamp (`i64`).
pub const TIMESTAMP_OFFSET: usize = 0;
/// Byte offset of the event sequence number (`i64`).
pub const SEQUENCE_OFFSET: usize = 8;
/// Byte offset of the event kind (`u16`).
pub const KIND_OFFSET: usize = 16;
/// Size of the fixed event header preceding the attributes.
pub const EVENT_HEADER_SIZE: usize = 18;

/// Kind tag carried in every event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum EventKind {
    /// A live event flowing through the pipeline.
    #[default]
    Current = 0,
    /// An event expired out of a window.
    Expired = 1,
    /// A timer-generated event.
    Timer = 2,
    /// A state-reset marker.
    Reset = 3,
    /// No event; slot is unused.
    None = 4,
}

impl EventKind {
    /// Decode a kind tag, mapping unknown values to `None`.
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => Self::Current,
            1 => Self::Expired,
            2 => Self::Timer,
            3 => Self::Reset,
            _ => Self::None,
        }
    }
}

/// Semantic type of one event attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    /// Boolean, stored as a `u16` (0 or 1).
    Bool,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 string with a 2-byte length prefix and a fixed body capacity.
    String {
        /// Maximum body length in bytes.
        max_len: u16,
    },
}

impl AttributeType {
    /// Bytes this attribute occupies in the event record.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Bool => 2,
            Self::Int => 4,
            Self::Long => 8,
            Self::Float => 4,
            Self::Double => 8,
            Self::String { max_len } => 2 + *max_len as usize,
        }
    }
}

/// One attribute in an event layout.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Attribute name, unique within the schema.
    pub name: String,
    /// Semantic type.
    pub ty: AttributeType,
    /// Byte offset within the event record.
    pub offset: usize,
}

/// Immutable byte layout for one event stream.
#[derive(Debug, Clone)]
pub struct EventSchema {
    stream_id: String,
    attributes: Vec<Attribute>,
    event_size: usize,
}

impl EventSchema {
    /// Start building a schema for the named stream.
    pub fn builder(stream_id: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            stream_id: stream_id.into(),
            attributes: Vec::new(),
        }
    }

    /// Stream this schema describes.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Total size of one event record in bytes, header included.
    pub fn event_size(&self) -> usize {
        self.event_size
    }

    /// Ordered attribute list.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Index of an attribute by name.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }
}

/// Builder assigning attribute offsets in declaration order.
#[derive(Debug)]
pub struct SchemaBuilder {
    stream_id: String,
    attributes: Vec<(String, AttributeType)>,
}

impl SchemaBuilder {
    /// Append an attribute. Offsets are assigned at `build` time.
    pub fn attribute(mut self, name: impl Into<String>, ty: AttributeType) -> Self {
        self.attributes.push((name.into(), ty));
        self
    }

    /// Finalize the layout.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::InvalidSchema`] on duplicate attribute names
    /// or an empty stream id.
    pub fn build(self) -> Result<Arc<EventSchema>> {
        if self.stream_id.is_empty() {
            return Err(SluiceError::InvalidSchema("empty stream id".into()));
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        let mut offset = EVENT_HEADER_SIZE;
        for (name, ty) in self.attributes {
            if attributes.iter().any(|a: &Attribute| a.name == name) {
                return Err(SluiceError::InvalidSchema(format!(
                    "duplicate attribute '{name}'"
                )));
            }
            let size = ty.size_in_bytes();
            attributes.push(Attribute { name, ty, offset });
            offset += size;
        }

        Ok(Arc::new(EventSchema {
            stream_id: self.stream_id,
            attributes,
            event_size: offset,
        }))
    }
}

/// A decoded attribute value, borrowing string bodies from the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrValue<'a> {
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// String body.
    Str(&'a str),
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(
        bytes.get(offset..offset + 2)?.try_into().ok()?,
    ))
}

fn read_i32(bytes: &[u8], offset: usize) -> Option<i32> {
    Some(i32::from_le_bytes(
        bytes.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

fn read_i64(bytes: &[u8], offset: usize) -> Option<i64> {
    Some(i64::from_le_bytes(
        bytes.get(offset..offset + 8)?.try_into().ok()?,
    ))
}

/// Read-only view over one event record.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    schema: &'a EventSchema,
    bytes: &'a [u8],
}

impl<'a> EventView<'a> {
    /// Bind a view over `bytes`, which must hold one full event.
    pub fn new(schema: &'a EventSchema, bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < schema.event_size() {
            return Err(SluiceError::TransferOverflow {
                required: schema.event_size(),
                available: bytes.len(),
            });
        }
        Ok(Self { schema, bytes })
    }

    /// Event timestamp.
    pub fn timestamp(&self) -> i64 {
        read_i64(self.bytes, TIMESTAMP_OFFSET).unwrap_or(0)
    }

    /// Event sequence number.
    pub fn sequence(&self) -> i64 {
        read_i64(self.bytes, SEQUENCE_OFFSET).unwrap_or(0)
    }

    /// Event kind tag.
    pub fn kind(&self) -> EventKind {
        EventKind::from_u16(read_u16(self.bytes, KIND_OFFSET).unwrap_or(4))
    }

    /// Decode the attribute at `index`.
    ///
    /// Returns `None` when the index is out of range or the string body
    /// is not valid UTF-8; predicate evaluation treats that as no match.
    pub fn attribute(&self, index: usize) -> Option<AttrValue<'a>> {
        let attr = self.schema.attributes().get(index)?;
        let off = attr.offset;
        match attr.ty {
            AttributeType::Bool => Some(AttrValue::Bool(read_u16(self.bytes, off)? != 0)),
            AttributeType::Int => Some(AttrValue::Int(read_i32(self.bytes, off)?)),
            AttributeType::Long => Some(AttrValue::Long(read_i64(self.bytes, off)?)),
            AttributeType::Float => Some(AttrValue::Float(f32::from_le_bytes(
                self.bytes.get(off..off + 4)?.try_into().ok()?,
            ))),
            AttributeType::Double => Some(AttrValue::Double(f64::from_le_bytes(
                self.bytes.get(off..off + 8)?.try_into().ok()?,
            ))),
            AttributeType::String { max_len } => {
                let len = read_u16(self.bytes, off)? as usize;
                if len > max_len as usize {
                    return None;
                }
                let body = self.bytes.get(off + 2..off + 2 + len)?;
                std::str::from_utf8(body).ok().map(AttrValue::Str)
            }
        }
    }
}

/// Mutable encoder for one event record.
#[derive(Debug)]
pub struct EventWriter<'a> {
    schema: &'a EventSchema,
    bytes: &'a mut [u8],
}

impl<'a> EventWriter<'a> {
    /// Bind a writer over `bytes`, which must hold one full event.
    pub fn new(schema: &'a EventSchema, bytes: &'a mut [u8]) -> Result<Self> {
        if bytes.len() < schema.event_size() {
            return Err(SluiceError::TransferOverflow {
                required: schema.event_size(),
                available: bytes.len(),
            });
        }
        Ok(Self { schema, bytes })
    }

    /// Write the event header.
    pub fn header(&mut self, timestamp: i64, sequence: i64, kind: EventKind) -> &mut Self {
        self.bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&timestamp.to_le_bytes());
        self.bytes[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 8].copy_from_slice(&sequence.to_le_bytes());
        self.bytes[KIND_OFFSET..KIND_OFFSET + 2].copy_from_slice(&(kind as u16).to_le_bytes());
        self
    }

    /// Write the attribute at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::InvalidSchema`] when the index is out of
    /// range or the value's type does not match the layout, and
    /// [`SluiceError::CapacityExceeded`] when a string body exceeds the
    /// attribute's fixed capacity.
    pub fn attribute(&mut self, index: usize, value: AttrValue<'_>) -> Result<&mut Self> {
        let attr = self
            .schema
            .attributes()
            .get(index)
            .ok_or_else(|| SluiceError::InvalidSchema(format!("attribute index {index}")))?
            .clone();
        let off = attr.offset;
        match (attr.ty, value) {
            (AttributeType::Bool, AttrValue::Bool(v)) => {
                self.bytes[off..off + 2].copy_from_slice(&(v as u16).to_le_bytes());
            }
            (AttributeType::Int, AttrValue::Int(v)) => {
                self.bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            (AttributeType::Long, AttrValue::Long(v)) => {
                self.bytes[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
            (AttributeType::Float, AttrValue::Float(v)) => {
                self.bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            (AttributeType::Double, AttrValue::Double(v)) => {
                self.bytes[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
            (AttributeType::String { max_len }, AttrValue::Str(s)) => {
                if s.len() > max_len as usize {
                    return Err(SluiceError::CapacityExceeded {
                        requested: s.len(),
                        capacity: max_len as usize,
                    });
                }
                self.bytes[off..off + 2].copy_from_slice(&(s.len() as u16).to_le_bytes());
                self.bytes[off + 2..off + 2 + s.len()].copy_from_slice(s.as_bytes());
            }
            (ty, value) => {
                return Err(SluiceError::InvalidSchema(format!(
                    "attribute '{}' is {ty:?}, got {value:?}",
                    attr.name
                )));
            }
        }
        Ok(self)
    }
}
