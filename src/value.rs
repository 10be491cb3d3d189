/*!
    typed register values

    the original firmware reinterpreted a 4-byte buffer through C unions.
    here a [Value] carries the [DataType] tag and the typed payload together,
    and the byte buffer only exists on the wire and in register slots.
*/

use bilge::prelude::*;

use crate::button::ButtonEvent;
use crate::pack_enum;


/// wire tag for a register's value type
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq, Eq)]
pub enum DataType {
    #[default]
    #[fallback]
    Unknown = 0,

    Bool = 1,
    U8 = 2,
    U16 = 3,
    U32 = 4,
    I8 = 5,
    I16 = 6,
    I32 = 7,
    F32 = 8,
    /// declared for protocol completeness, not storable in a 4-byte slot
    String = 9,
    Time = 10,
    Date = 11,
    DateTime = 12,
    /// classified button event, see [ButtonEvent]
    Button = 13,
    /// two-position switch state
    Switch = 14,
}
pack_enum!(DataType);

impl DataType {
    /// canonical width in bytes, `None` for types a slot cannot hold
    pub const fn width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::U8 | Self::I8 | Self::Button | Self::Switch => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::Time | Self::Date | Self::DateTime => Some(4),
            Self::String | Self::Unknown => None,
        }
    }
}

/// a register value together with its type tag
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    /// seconds since midnight
    Time(u32),
    /// days since epoch
    Date(u32),
    /// seconds since epoch
    DateTime(u32),
    Button(ButtonEvent),
    Switch(bool),
}

impl Value {
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::U8(_) => DataType::U8,
            Self::U16(_) => DataType::U16,
            Self::U32(_) => DataType::U32,
            Self::I8(_) => DataType::I8,
            Self::I16(_) => DataType::I16,
            Self::I32(_) => DataType::I32,
            Self::F32(_) => DataType::F32,
            Self::Time(_) => DataType::Time,
            Self::Date(_) => DataType::Date,
            Self::DateTime(_) => DataType::DateTime,
            Self::Button(_) => DataType::Button,
            Self::Switch(_) => DataType::Switch,
        }
    }

    /// big-endian encoding into a slot buffer, returns the canonical width
    pub fn encode(&self) -> (usize, [u8; 4]) {
        let mut slot = [0; 4];
        let width = match *self {
            Self::Bool(v) | Self::Switch(v) => {
                slot[0] = v as u8;
                1
            }
            Self::U8(v) => {
                slot[0] = v;
                1
            }
            Self::I8(v) => {
                slot[0] = v as u8;
                1
            }
            Self::Button(v) => {
                slot[0] = u8::from(v);
                1
            }
            Self::U16(v) => {
                slot[.. 2].copy_from_slice(&v.to_be_bytes());
                2
            }
            Self::I16(v) => {
                slot[.. 2].copy_from_slice(&v.to_be_bytes());
                2
            }
            Self::U32(v) | Self::Time(v) | Self::Date(v) | Self::DateTime(v) => {
                slot.copy_from_slice(&v.to_be_bytes());
                4
            }
            Self::I32(v) => {
                slot.copy_from_slice(&v.to_be_bytes());
                4
            }
            Self::F32(v) => {
                slot.copy_from_slice(&v.to_be_bytes());
                4
            }
        };
        (width, slot)
    }

    /// big-endian decoding, `None` when the type is not storable or
    /// `bytes` is not exactly the canonical width
    pub fn decode(ty: DataType, bytes: &[u8]) -> Option<Self> {
        if ty.width() != Some(bytes.len()) {
            return None;
        }
        Some(match ty {
            DataType::Bool => Self::Bool(bytes[0] != 0),
            DataType::Switch => Self::Switch(bytes[0] != 0),
            DataType::U8 => Self::U8(bytes[0]),
            DataType::I8 => Self::I8(bytes[0] as i8),
            DataType::Button => Self::Button(ButtonEvent::from(bytes[0])),
            DataType::U16 => Self::U16(u16::from_be_bytes([bytes[0], bytes[1]])),
            DataType::I16 => Self::I16(i16::from_be_bytes([bytes[0], bytes[1]])),
            DataType::U32 => Self::U32(u32::from_be_bytes(word(bytes))),
            DataType::I32 => Self::I32(i32::from_be_bytes(word(bytes))),
            DataType::F32 => Self::F32(f32::from_be_bytes(word(bytes))),
            DataType::Time => Self::Time(u32::from_be_bytes(word(bytes))),
            DataType::Date => Self::Date(u32::from_be_bytes(word(bytes))),
            DataType::DateTime => Self::DateTime(u32::from_be_bytes(word(bytes))),
            DataType::String | DataType::Unknown => return None,
        })
    }
}

fn word(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths() {
        assert_eq!(DataType::Bool.width(), Some(1));
        assert_eq!(DataType::I16.width(), Some(2));
        assert_eq!(DataType::F32.width(), Some(4));
        assert_eq!(DataType::String.width(), None);
        assert_eq!(DataType::Unknown.width(), None);
    }

    #[test]
    fn roundtrip() {
        for value in [
            Value::Bool(true),
            Value::U8(0x7f),
            Value::U16(0xbeef),
            Value::I16(-1204),
            Value::U32(0xdeadbeef),
            Value::I32(-100_000),
            Value::F32(21.5),
            Value::Time(86_399),
            Value::Button(ButtonEvent::DoubleClick),
            Value::Switch(false),
        ] {
            let (width, slot) = value.encode();
            assert_eq!(Value::decode(value.data_type(), &slot[.. width]), Some(value));
        }
    }

    #[test]
    fn decode_rejects_bad_width() {
        assert_eq!(Value::decode(DataType::U16, &[1]), None);
        assert_eq!(Value::decode(DataType::Bool, &[1, 0]), None);
        assert_eq!(Value::decode(DataType::String, &[0; 4]), None);
    }
}
