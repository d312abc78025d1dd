//! MaxMind DB data section encoding.
//!
//! Only the value types needed for labels and metadata are supported.

/// A value in the MaxMind DB data section.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value<'a> {
    Str(&'a str),
    U16(u16),
    U32(u32),
    U64(u64),
    Map(Vec<(&'a str, Value<'a>)>),
    Array(Vec<Value<'a>>),
}

const TYPE_STRING: u8 = 2;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_UINT64: u8 = 9;
const TYPE_ARRAY: u8 = 11;

impl Value<'_> {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Str(s) => {
                control(out, TYPE_STRING, s.len());
                out.extend_from_slice(s.as_bytes());
            }
            Value::U16(v) => uint(out, TYPE_UINT16, u64::from(*v)),
            Value::U32(v) => uint(out, TYPE_UINT32, u64::from(*v)),
            Value::U64(v) => uint(out, TYPE_UINT64, *v),
            Value::Map(entries) => {
                control(out, TYPE_MAP, entries.len());
                for (key, value) in entries {
                    Value::Str(*key).encode(out);
                    value.encode(out);
                }
            }
            Value::Array(items) => {
                control(out, TYPE_ARRAY, items.len());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

/// Unsigned integers are stored big-endian with leading zero bytes dropped.
fn uint(out: &mut Vec<u8>, type_num: u8, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    control(out, type_num, bytes.len() - skip);
    out.extend_from_slice(&bytes[skip..]);
}

/// Control byte: 3 type bits and 5 size bits, then the extended type byte
/// (types above 7), then any size extension bytes.
fn control(out: &mut Vec<u8>, type_num: u8, size: usize) {
    let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
        (size as u8, Vec::new())
    } else if size < 29 + 256 {
        (29, vec![(size - 29) as u8])
    } else if size < 285 + 65_536 {
        (30, ((size - 285) as u16).to_be_bytes().to_vec())
    } else {
        (31, ((size - 65_821) as u32).to_be_bytes()[1..].to_vec())
    };

    if type_num <= 7 {
        out.push((type_num << 5) | size_bits);
    } else {
        out.push(size_bits);
        out.push(type_num - 7);
    }
    out.extend_from_slice(&extra);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: Value<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        value.encode(&mut out);
        out
    }

    #[test]
    fn test_short_string() {
        assert_eq!(encoded(Value::Str("ab")), vec![0x42, b'a', b'b']);
    }

    #[test]
    fn test_long_string_size_extension() {
        let s = "x".repeat(100);
        let out = encoded(Value::Str(&s));
        assert_eq!(&out[..2], &[0x40 | 29, 100 - 29]);
        assert_eq!(out.len(), 102);
    }

    #[test]
    fn test_uints_are_minimal() {
        assert_eq!(encoded(Value::U16(0)), vec![0xA0]);
        assert_eq!(encoded(Value::U16(6)), vec![0xA1, 6]);
        assert_eq!(encoded(Value::U32(0x0102_03)), vec![0xC3, 1, 2, 3]);
        // uint64 uses the extended type byte (9 - 7)
        assert_eq!(encoded(Value::U64(1)), vec![0x01, 0x02, 0x01]);
    }

    #[test]
    fn test_map_and_array() {
        let out = encoded(Value::Map(vec![("a", Value::Array(vec![Value::Str("b")]))]));
        assert_eq!(out, vec![0xE1, 0x41, b'a', 0x01, 0x04, 0x41, b'b']);
    }
}
