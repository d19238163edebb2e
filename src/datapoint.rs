use std::fmt;

// -- Data types --

/// Wire type tag of a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpType {
    Raw = 0x00,
    Bool = 0x01,
    Value = 0x02,
    String = 0x03,
    Enum = 0x04,
    Bitmap = 0x05,
}

impl DpType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DpType::Raw),
            0x01 => Some(DpType::Bool),
            0x02 => Some(DpType::Value),
            0x03 => Some(DpType::String),
            0x04 => Some(DpType::Enum),
            0x05 => Some(DpType::Bitmap),
            _ => None,
        }
    }
}

impl fmt::Display for DpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DpType::Raw => "raw",
            DpType::Bool => "bool",
            DpType::Value => "value",
            DpType::String => "string",
            DpType::Enum => "enum",
            DpType::Bitmap => "bitmap",
        };
        write!(f, "{name}")
    }
}

/// A typed data-point value. The variant fixes the wire type tag, so a
/// value can never disagree with its type.
#[derive(Debug, Clone, PartialEq)]
pub enum DpValue {
    Raw(Vec<u8>),
    Bool(bool),
    Value(i32),
    String(String),
    Enum(u32),
    Bitmap(Vec<u8>),
}

impl DpValue {
    pub fn dp_type(&self) -> DpType {
        match self {
            DpValue::Raw(_) => DpType::Raw,
            DpValue::Bool(_) => DpType::Bool,
            DpValue::Value(_) => DpType::Value,
            DpValue::String(_) => DpType::String,
            DpValue::Enum(_) => DpType::Enum,
            DpValue::Bitmap(_) => DpType::Bitmap,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DpValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            DpValue::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            DpValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DpValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DpValue::Raw(v) | DpValue::Bitmap(v) => Some(v),
            _ => None,
        }
    }

    // Enum values use the smallest width that holds them; the other types
    // have fixed or free-form widths.
    fn wire_bytes(&self) -> Vec<u8> {
        match self {
            DpValue::Raw(v) | DpValue::Bitmap(v) => v.clone(),
            DpValue::Bool(v) => vec![u8::from(*v)],
            DpValue::Value(v) => v.to_be_bytes().to_vec(),
            DpValue::String(v) => v.as_bytes().to_vec(),
            DpValue::Enum(v) => match *v {
                0..=0xFF => vec![*v as u8],
                0x100..=0xFFFF => (*v as u16).to_be_bytes().to_vec(),
                _ => v.to_be_bytes().to_vec(),
            },
        }
    }
}

/// A device data point: an id paired with a typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub id: u8,
    pub value: DpValue,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DataPointError {
    InvalidId,
    UnknownType(u8),
    Truncated { needed: usize, remaining: usize },
    WrongLength { dp_type: DpType, len: usize },
    ValueTooLong(usize),
    NotUtf8,
}

impl fmt::Display for DataPointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPointError::InvalidId => write!(f, "Data point id must not be zero"),
            DataPointError::UnknownType(b) => write!(f, "Unknown data point type: {b}"),
            DataPointError::Truncated { needed, remaining } => {
                write!(f, "Truncated data point: needs {needed} bytes, {remaining} remain")
            }
            DataPointError::WrongLength { dp_type, len } => {
                write!(f, "Invalid length {len} for {dp_type} data point")
            }
            DataPointError::ValueTooLong(len) => {
                write!(f, "Value of {len} bytes exceeds the 8-bit length field")
            }
            DataPointError::NotUtf8 => write!(f, "String data point is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DataPointError {}

impl DataPoint {
    pub fn new(id: u8, value: DpValue) -> Result<Self, DataPointError> {
        if id == 0 {
            return Err(DataPointError::InvalidId);
        }
        Ok(DataPoint { id, value })
    }

    pub fn dp_type(&self) -> DpType {
        self.value.dp_type()
    }

    /// Parse a value of the given wire type. Inbound ids are taken as-is;
    /// devices own their numbering.
    pub fn parse(id: u8, dp_type: DpType, raw: &[u8]) -> Result<Self, DataPointError> {
        let value = match dp_type {
            DpType::Raw => DpValue::Raw(raw.to_vec()),
            DpType::Bitmap => DpValue::Bitmap(raw.to_vec()),
            DpType::Bool => match raw {
                [b] => DpValue::Bool(*b != 0),
                _ => {
                    return Err(DataPointError::WrongLength {
                        dp_type,
                        len: raw.len(),
                    });
                }
            },
            DpType::Value => match raw {
                [a, b, c, d] => DpValue::Value(i32::from_be_bytes([*a, *b, *c, *d])),
                _ => {
                    return Err(DataPointError::WrongLength {
                        dp_type,
                        len: raw.len(),
                    });
                }
            },
            DpType::Enum => match raw {
                [a] => DpValue::Enum(u32::from(*a)),
                [a, b] => DpValue::Enum(u32::from(u16::from_be_bytes([*a, *b]))),
                [a, b, c, d] => DpValue::Enum(u32::from_be_bytes([*a, *b, *c, *d])),
                _ => {
                    return Err(DataPointError::WrongLength {
                        dp_type,
                        len: raw.len(),
                    });
                }
            },
            DpType::String => match std::str::from_utf8(raw) {
                Ok(s) => DpValue::String(s.to_owned()),
                Err(_) => return Err(DataPointError::NotUtf8),
            },
        };

        Ok(DataPoint { id, value })
    }

    /// Append the wire record `id(1) || type(1) || len(1) || bytes` to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), DataPointError> {
        if self.id == 0 {
            return Err(DataPointError::InvalidId);
        }
        let bytes = self.value.wire_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(DataPointError::ValueTooLong(bytes.len()));
        }
        out.push(self.id);
        out.push(self.dp_type() as u8);
        out.push(bytes.len() as u8);
        out.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Serialize a batch of data points into one DPS payload.
pub fn encode_all(datapoints: &[DataPoint]) -> Result<Vec<u8>, DataPointError> {
    let mut out = Vec::new();
    for dp in datapoints {
        dp.encode_into(&mut out)?;
    }
    Ok(out)
}

/// Parse the concatenated records of a DP report payload.
pub fn parse_report(payload: &[u8]) -> Result<Vec<DataPoint>, DataPointError> {
    let mut datapoints = Vec::new();
    let mut pos = 0;

    while payload.len() - pos >= 4 {
        let id = payload[pos];
        let type_byte = payload[pos + 1];
        let len = payload[pos + 2] as usize;
        pos += 3;

        let dp_type =
            DpType::from_byte(type_byte).ok_or(DataPointError::UnknownType(type_byte))?;

        let end = pos + len;
        if end > payload.len() {
            return Err(DataPointError::Truncated {
                needed: len,
                remaining: payload.len() - pos,
            });
        }

        datapoints.push(DataPoint::parse(id, dp_type, &payload[pos..end])?);
        pos = end;
    }

    Ok(datapoints)
}
