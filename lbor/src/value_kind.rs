pub const VALUE_KIND_NULL: u8 = 0x00;
pub const VALUE_KIND_BOOL: u8 = 0x01;
pub const VALUE_KIND_INTEGER: u8 = 0x02;
pub const VALUE_KIND_BIG_INTEGER: u8 = 0x03;
pub const VALUE_KIND_DECIMAL: u8 = 0x04;
pub const VALUE_KIND_STRING: u8 = 0x05;
pub const VALUE_KIND_BYTES: u8 = 0x06;
pub const VALUE_KIND_ARRAY: u8 = 0x07;
pub const VALUE_KIND_MAP: u8 = 0x08;

/// The discriminator byte written in front of every encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    BigInteger,
    Decimal,
    String,
    Bytes,
    Array,
    Map,
}

impl ValueKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            ValueKind::Null => VALUE_KIND_NULL,
            ValueKind::Bool => VALUE_KIND_BOOL,
            ValueKind::Integer => VALUE_KIND_INTEGER,
            ValueKind::BigInteger => VALUE_KIND_BIG_INTEGER,
            ValueKind::Decimal => VALUE_KIND_DECIMAL,
            ValueKind::String => VALUE_KIND_STRING,
            ValueKind::Bytes => VALUE_KIND_BYTES,
            ValueKind::Array => VALUE_KIND_ARRAY,
            ValueKind::Map => VALUE_KIND_MAP,
        }
    }

    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            VALUE_KIND_NULL => Some(ValueKind::Null),
            VALUE_KIND_BOOL => Some(ValueKind::Bool),
            VALUE_KIND_INTEGER => Some(ValueKind::Integer),
            VALUE_KIND_BIG_INTEGER => Some(ValueKind::BigInteger),
            VALUE_KIND_DECIMAL => Some(ValueKind::Decimal),
            VALUE_KIND_STRING => Some(ValueKind::String),
            VALUE_KIND_BYTES => Some(ValueKind::Bytes),
            VALUE_KIND_ARRAY => Some(ValueKind::Array),
            VALUE_KIND_MAP => Some(ValueKind::Map),
            _ => None,
        }
    }
}
