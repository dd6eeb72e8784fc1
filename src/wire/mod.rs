//! Binary wire format for values crossing the process boundary.
//!
//! An encoded value is a fixed header followed by zero or more checksummed
//! chunks:
//!
//! ```text
//! +------------+------------+------------+----------+
//! | compressed | serialized | is_closure | type tag |     header, 1 byte each
//! +------------+------------+------------+----------+
//! +-------------+---------------+---------------------+
//! | len: u16 LE | crc16: u16 LE | payload (len bytes) |  chunk, repeated
//! +-------------+---------------+---------------------+
//! ```
//!
//! Scalars are stored as little-endian bytes. Arrays, objects and closures
//! are serialized with MessagePack. Strings and serialized payloads are raw
//! deflated when that makes them smaller. Payloads longer than
//! [`MAX_CHUNK_LEN`] are split across chunks and every chunk is verified on
//! decode before anything is returned.

mod crc;
mod value;

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use thiserror::Error;

pub use crc::crc16;
pub use value::{BoundClosure, Closure, ClosureFn, ClosureRegistry, Value};

/// Length of the flag header.
pub const HEADER_LEN: usize = 4;

/// Length of a chunk's length + checksum prefix.
pub const CHUNK_PREFIX_LEN: usize = 4;

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Errors raised while encoding or decoding a value.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Truncated input: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error(
        "CRC check failed on chunk {chunk}, data is incomplete or corrupt \
         (expected 0x{expected:04x}, got 0x{actual:04x})"
    )]
    Integrity {
        chunk: usize,
        expected: u16,
        actual: u16,
    },

    #[error("Unknown type tag {0}")]
    UnknownType(u8),

    #[error("Invalid value {value} for header flag '{flag}'")]
    InvalidFlag { flag: &'static str, value: u8 },

    #[error("Invalid {tag:?} payload of {len} bytes")]
    InvalidScalar { tag: TypeTag, len: usize },

    #[error("Invalid UTF-8 in string payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("No closure registered under '{0}'")]
    UnknownClosure(String),

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// The type tag stored in the last header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TypeTag {
    Bool = 1,
    Int = 2,
    Double = 3,
    #[default]
    Null = 4,
    String = 5,
    Array = 6,
    Object = 7,
}

impl TryFrom<u8> for TypeTag {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            1 => TypeTag::Bool,
            2 => TypeTag::Int,
            3 => TypeTag::Double,
            4 => TypeTag::Null,
            5 => TypeTag::String,
            6 => TypeTag::Array,
            7 => TypeTag::Object,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// Decoded form of the 4-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub compressed: bool,
    pub serialized: bool,
    pub is_closure: bool,
    pub tag: TypeTag,
}

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        [
            u8::from(self.compressed),
            u8::from(self.serialized),
            u8::from(self.is_closure),
            self.tag as u8,
        ]
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let raw = bytes.get(..HEADER_LEN).ok_or(WireError::Truncated {
            offset: 0,
            needed: HEADER_LEN,
            available: bytes.len(),
        })?;
        Ok(Self {
            compressed: flag("compressed", raw[0])?,
            serialized: flag("serialized", raw[1])?,
            is_closure: flag("is_closure", raw[2])?,
            tag: TypeTag::try_from(raw[3])?,
        })
    }
}

fn flag(name: &'static str, value: u8) -> Result<bool, WireError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(WireError::InvalidFlag { flag: name, value }),
    }
}

/// Encode a value into the wire envelope.
///
/// With `compress` set, string and serialized payloads are deflated if the
/// compressed form is strictly smaller.
pub fn encode(value: &Value, compress: bool) -> Result<Vec<u8>, WireError> {
    let mut header = Header {
        tag: value.type_tag(),
        ..Header::default()
    };

    let payload = match value {
        Value::Null => Vec::new(),
        Value::Bool(b) => vec![u8::from(*b)],
        Value::Int(i) => i.to_le_bytes().to_vec(),
        Value::Double(d) => d.to_le_bytes().to_vec(),
        Value::String(s) if s.is_empty() => {
            header.tag = TypeTag::Null;
            Vec::new()
        }
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Array(items) => {
            header.serialized = true;
            rmp_serde::to_vec(items)?
        }
        Value::Object(fields) => {
            header.serialized = true;
            rmp_serde::to_vec(fields)?
        }
        Value::Closure(closure) => {
            header.serialized = true;
            header.is_closure = true;
            rmp_serde::to_vec(closure)?
        }
    };

    let compressible = matches!(
        header.tag,
        TypeTag::String | TypeTag::Array | TypeTag::Object
    );
    let payload = if compress && compressible {
        match deflate_if_smaller(&payload)? {
            Some(smaller) => {
                header.compressed = true;
                smaller
            }
            None => payload,
        }
    } else {
        payload
    };

    let chunks = payload.len().div_ceil(MAX_CHUNK_LEN);
    let mut out = Vec::with_capacity(HEADER_LEN + chunks * CHUNK_PREFIX_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    for chunk in payload.chunks(MAX_CHUNK_LEN) {
        // chunks() never yields more than MAX_CHUNK_LEN bytes
        out.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        out.extend_from_slice(&crc16(chunk).to_le_bytes());
        out.extend_from_slice(chunk);
    }
    Ok(out)
}

/// Decode a wire envelope back into a value.
///
/// Every chunk checksum is verified before any payload is interpreted.
pub fn decode(bytes: &[u8]) -> Result<Value, WireError> {
    let header = Header::parse(bytes)?;
    let payload = reassemble(&bytes[HEADER_LEN..])?;
    let payload = if header.compressed {
        inflate(&payload)?
    } else {
        payload
    };

    if header.is_closure {
        if !header.serialized || header.tag != TypeTag::Object {
            return Err(WireError::Malformed(
                "closure payload must be a serialized object".to_string(),
            ));
        }
        let closure: Closure = rmp_serde::from_slice(&payload)?;
        return Ok(Value::Closure(closure));
    }

    if header.serialized {
        return match header.tag {
            TypeTag::Array => Ok(Value::Array(rmp_serde::from_slice(&payload)?)),
            TypeTag::Object => Ok(Value::Object(rmp_serde::from_slice::<
                BTreeMap<String, Value>,
            >(&payload)?)),
            tag => Err(WireError::Malformed(format!(
                "{:?} payload cannot be structurally serialized",
                tag
            ))),
        };
    }

    let scalar_error = |tag| WireError::InvalidScalar {
        tag,
        len: payload.len(),
    };
    match header.tag {
        TypeTag::Null => Ok(Value::Null),
        TypeTag::Bool => match payload.as_slice() {
            [b] => Ok(Value::Bool(*b != 0)),
            _ => Err(scalar_error(TypeTag::Bool)),
        },
        TypeTag::Int => {
            let raw: [u8; 8] = payload
                .as_slice()
                .try_into()
                .map_err(|_| scalar_error(TypeTag::Int))?;
            Ok(Value::Int(i64::from_le_bytes(raw)))
        }
        TypeTag::Double => {
            let raw: [u8; 8] = payload
                .as_slice()
                .try_into()
                .map_err(|_| scalar_error(TypeTag::Double))?;
            Ok(Value::Double(f64::from_le_bytes(raw)))
        }
        TypeTag::String => Ok(Value::String(String::from_utf8(payload)?)),
        tag @ (TypeTag::Array | TypeTag::Object) => Err(WireError::Malformed(format!(
            "{:?} payload is missing the serialized flag",
            tag
        ))),
    }
}

/// Concatenate chunk payloads, verifying each checksum.
fn reassemble(mut rest: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut payload = Vec::with_capacity(rest.len());
    let mut offset = HEADER_LEN;
    let mut index = 0;

    while !rest.is_empty() {
        if rest.len() < CHUNK_PREFIX_LEN {
            return Err(WireError::Truncated {
                offset,
                needed: CHUNK_PREFIX_LEN,
                available: rest.len(),
            });
        }
        let len = usize::from(u16::from_le_bytes([rest[0], rest[1]]));
        let expected = u16::from_le_bytes([rest[2], rest[3]]);
        let body = rest
            .get(CHUNK_PREFIX_LEN..CHUNK_PREFIX_LEN + len)
            .ok_or(WireError::Truncated {
                offset: offset + CHUNK_PREFIX_LEN,
                needed: len,
                available: rest.len() - CHUNK_PREFIX_LEN,
            })?;

        let actual = crc16(body);
        if actual != expected {
            return Err(WireError::Integrity {
                chunk: index,
                expected,
                actual,
            });
        }

        payload.extend_from_slice(body);
        rest = &rest[CHUNK_PREFIX_LEN + len..];
        offset += CHUNK_PREFIX_LEN + len;
        index += 1;
    }

    Ok(payload)
}

fn deflate_if_smaller(data: &[u8]) -> Result<Option<Vec<u8>>, WireError> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len()), Compression::best());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok((compressed.len() < data.len()).then_some(compressed))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        decode(&encode(&value, true).unwrap()).unwrap()
    }

    fn nested() -> Value {
        Value::Array(vec![
            Value::Int(1),
            Value::Array(vec![Value::from("two"), Value::Double(3.5)]),
            Value::object([("flag", Value::Bool(false)), ("none", Value::Null)]),
        ])
    }

    #[test]
    fn test_scalars_keep_their_type() {
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Int(-17)), Value::Int(-17));
        assert_eq!(roundtrip(Value::Int(i64::MAX)), Value::Int(i64::MAX));
        assert_eq!(roundtrip(Value::Double(0.1)), Value::Double(0.1));
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::from("hello")), Value::from("hello"));
    }

    #[test]
    fn test_structured_values() {
        assert_eq!(roundtrip(nested()), nested());

        let object = Value::object([
            ("name", Value::from("unit")),
            ("items", nested()),
            ("score", Value::Double(9.75)),
        ]);
        assert_eq!(roundtrip(object.clone()), object);
    }

    #[test]
    fn test_empty_string_encodes_as_null() {
        let bytes = encode(&Value::from(""), true).unwrap();
        assert_eq!(bytes, Header::default().to_bytes());
        assert_eq!(decode(&bytes).unwrap(), Value::Null);
    }

    #[test]
    fn test_closure_behaves_the_same_after_decode() {
        let mut registry = ClosureRegistry::new();
        registry.register("greet", |captured, args| {
            let greeting = captured[0].as_str().unwrap_or_default();
            let name = args[0].as_str().unwrap_or_default();
            Ok(Value::String(format!("{greeting}, {name}")))
        });

        let original = Closure::new("greet", vec![Value::from("Hello")]);
        let bytes = encode(&Value::Closure(original.clone()), true).unwrap();
        let header = Header::parse(&bytes).unwrap();
        assert!(header.is_closure);
        assert!(header.serialized);
        assert_eq!(header.tag, TypeTag::Object);

        let decoded = decode(&bytes).unwrap();
        let decoded = decoded.as_closure().unwrap();
        let args = [Value::from("pool")];
        assert_eq!(
            registry.bind(decoded).unwrap().call(&args).unwrap(),
            registry.bind(&original).unwrap().call(&args).unwrap(),
        );
    }

    #[test]
    fn test_compression_only_when_smaller() {
        let repetitive = Value::String("abc".repeat(1000));
        let bytes = encode(&repetitive, true).unwrap();
        assert!(Header::parse(&bytes).unwrap().compressed);
        assert!(bytes.len() < 3000);
        assert_eq!(decode(&bytes).unwrap(), repetitive);

        // Too short to shrink
        let tiny = encode(&Value::from("a"), true).unwrap();
        assert!(!Header::parse(&tiny).unwrap().compressed);

        let plain = encode(&repetitive, false).unwrap();
        assert!(!Header::parse(&plain).unwrap().compressed);
        assert_eq!(decode(&plain).unwrap(), repetitive);
    }

    #[test]
    fn test_scalars_are_never_compressed() {
        let bytes = encode(&Value::Int(0), true).unwrap();
        assert!(!Header::parse(&bytes).unwrap().compressed);
        assert_eq!(bytes.len(), HEADER_LEN + CHUNK_PREFIX_LEN + 8);
    }

    #[test]
    fn test_large_payload_is_chunked() {
        let big = Value::String("x".repeat(MAX_CHUNK_LEN * 2 + 100));
        let bytes = encode(&big, false).unwrap();

        let first_len = u16::from_le_bytes([bytes[HEADER_LEN], bytes[HEADER_LEN + 1]]);
        assert_eq!(usize::from(first_len), MAX_CHUNK_LEN);
        assert_eq!(
            bytes.len(),
            HEADER_LEN + 3 * CHUNK_PREFIX_LEN + MAX_CHUNK_LEN * 2 + 100
        );
        assert_eq!(decode(&bytes).unwrap(), big);
    }

    #[test]
    fn test_any_payload_byte_flip_is_detected() {
        let bytes = encode(&Value::from("integrity matters"), false).unwrap();
        let payload_start = HEADER_LEN + CHUNK_PREFIX_LEN;
        for i in payload_start..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x40;
            let err = decode(&corrupt).unwrap_err();
            assert!(
                matches!(err, WireError::Integrity { chunk: 0, .. }),
                "byte {} gave {:?}",
                i,
                err
            );
        }
    }

    #[test]
    fn test_flip_in_second_chunk_names_that_chunk() {
        let bytes = encode(&Value::String("y".repeat(MAX_CHUNK_LEN + 10)), false).unwrap();
        let mut corrupt = bytes.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        assert!(matches!(
            decode(&corrupt),
            Err(WireError::Integrity { chunk: 1, .. })
        ));
    }

    #[test]
    fn test_truncated_input() {
        assert!(matches!(
            decode(&[0, 0]),
            Err(WireError::Truncated { needed: 4, .. })
        ));

        let bytes = encode(&Value::Int(7), false).unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 2]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(
            decode(&[0, 0, 0, 9]),
            Err(WireError::UnknownType(9))
        ));
        assert!(matches!(
            decode(&[2, 0, 0, 4]),
            Err(WireError::InvalidFlag {
                flag: "compressed",
                ..
            })
        ));
    }

    #[test]
    fn test_scalar_length_mismatch() {
        let mut bytes = Header {
            tag: TypeTag::Int,
            ..Header::default()
        }
        .to_bytes()
        .to_vec();
        let payload = [1u8, 2, 3];
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&crc16(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);

        assert!(matches!(
            decode(&bytes),
            Err(WireError::InvalidScalar {
                tag: TypeTag::Int,
                len: 3
            })
        ));
    }
}
