//! Tagged RPC values exchanged with the core device.
//!
//! Every value on the wire is self-describing: a tag byte followed by a
//! layout the tag fully determines. The kernel additionally publishes the
//! *expected* return type of an RPC as a compact tag string; the send path
//! validates against it before anything is written.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("unknown RPC tag byte {0:#04x}")]
    UnknownTag(u8),
}

/// The RPC return value produced by a host service does not match the type
/// the kernel expects. Must never be answered on the wire: the session is
/// already committed to a reply layout the value cannot fill.
#[derive(Debug, Error)]
#[error("RPC return value mismatch: expected {expected}, got {actual}")]
pub struct RpcReturnValueError {
    pub expected: String,
    pub actual: String,
}

/// Session byte order, fixed by the handshake.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Endianness {
    Big,
    Little,
}

macro_rules! endian_codec {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(self, stream: &mut impl Read) -> std::io::Result<$ty> {
            match self {
                Endianness::Big => stream.$read::<BigEndian>(),
                Endianness::Little => stream.$read::<LittleEndian>(),
            }
        }

        pub fn $write(self, stream: &mut impl Write, value: $ty) -> std::io::Result<()> {
            match self {
                Endianness::Big => stream.$write::<BigEndian>(value),
                Endianness::Little => stream.$write::<LittleEndian>(value),
            }
        }
    };
}

impl Endianness {
    pub fn from_tag(byte: u8) -> Result<Self> {
        match byte {
            b'E' => Ok(Endianness::Big),
            b'e' => Ok(Endianness::Little),
            _ => anyhow::bail!("unknown endianness byte {byte:#04x}"),
        }
    }

    endian_codec!(read_u32, write_u32, u32);
    endian_codec!(read_i32, write_i32, i32);
    endian_codec!(read_u64, write_u64, u64);
    endian_codec!(read_i64, write_i64, i64);
    endian_codec!(read_f64, write_f64, f64);
}

/// RPC type tags. The byte values are a wire contract with the kernel.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Tag {
    None = b'n',
    Bool = b'b',
    Int32 = b'i',
    Int64 = b'I',
    Float64 = b'f',
    Fraction = b'F',
    Str = b's',
    Bytes = b'B',
    ByteArray = b'A',
    ObjectRef = b'O',
    Tuple = b't',
    List = b'l',
    Array = b'a',
    Range = b'r',
    Keyword = b'k',
}

impl Tag {
    pub fn from_byte(byte: u8) -> Result<Tag, CommError> {
        Tag::from_u8(byte).ok_or(CommError::UnknownTag(byte))
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Element storage of a homogeneous sequence. Scalar element types must be
/// kept in the bulk vectors, matching the wire's bulk encoding; `Values` is
/// for every other element type and rejects scalars at encode time.
#[derive(Clone, Debug, PartialEq)]
pub enum ElemSeq {
    Bool(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Values(Vec<Value>),
}

impl ElemSeq {
    pub fn len(&self) -> usize {
        match self {
            ElemSeq::Bool(v) => v.len(),
            ElemSeq::Int32(v) => v.len(),
            ElemSeq::Int64(v) => v.len(),
            ElemSeq::Float64(v) => v.len(),
            ElemSeq::Values(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn elem_tag(&self) -> Tag {
        match self {
            ElemSeq::Bool(_) => Tag::Bool,
            ElemSeq::Int32(_) => Tag::Int32,
            ElemSeq::Int64(_) => Tag::Int64,
            ElemSeq::Float64(_) => Tag::Float64,
            ElemSeq::Values(values) => values.first().map_or(Tag::None, Value::tag),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Fraction {
        numerator: i64,
        denominator: i64,
    },
    Str(String),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    /// Key into the session's embedding map.
    ObjectRef(u32),
    Tuple(Vec<Value>),
    List(ElemSeq),
    Array {
        /// Extent of each dimension; `data` is the row-major flattening.
        shape: Vec<u32>,
        data: ElemSeq,
    },
    Range {
        start: Box<Value>,
        stop: Box<Value>,
        step: Box<Value>,
    },
    Keyword {
        name: String,
        value: Box<Value>,
    },
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::None => Tag::None,
            Value::Bool(_) => Tag::Bool,
            Value::Int32(_) => Tag::Int32,
            Value::Int64(_) => Tag::Int64,
            Value::Float64(_) => Tag::Float64,
            Value::Fraction { .. } => Tag::Fraction,
            Value::Str(_) => Tag::Str,
            Value::Bytes(_) => Tag::Bytes,
            Value::ByteArray(_) => Tag::ByteArray,
            Value::ObjectRef(_) => Tag::ObjectRef,
            Value::Tuple(_) => Tag::Tuple,
            Value::List(_) => Tag::List,
            Value::Array { .. } => Tag::Array,
            Value::Range { .. } => Tag::Range,
            Value::Keyword { .. } => Tag::Keyword,
        }
    }
}

fn read_string(stream: &mut impl Read, endianness: Endianness) -> Result<String> {
    let bytes = read_byte_string(stream, endianness)?;
    String::from_utf8(bytes).context("string is not valid UTF-8")
}

fn read_byte_string(stream: &mut impl Read, endianness: Endianness) -> Result<Vec<u8>> {
    let length = endianness.read_u32(stream)? as usize;
    let mut bytes = vec![0u8; length];
    stream.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn write_byte_string(stream: &mut impl Write, endianness: Endianness, bytes: &[u8]) -> Result<()> {
    endianness.write_u32(stream, u32::try_from(bytes.len()).context("string too long")?)?;
    stream.write_all(bytes)?;
    Ok(())
}

fn decode_elem_seq(
    stream: &mut impl Read,
    endianness: Endianness,
    elem_tag: Tag,
    length: usize,
) -> Result<ElemSeq> {
    Ok(match elem_tag {
        Tag::Bool => {
            let mut elems = Vec::with_capacity(length);
            for _ in 0..length {
                elems.push(stream.read_u8()? != 0);
            }
            ElemSeq::Bool(elems)
        }
        Tag::Int32 => {
            let mut elems = Vec::with_capacity(length);
            for _ in 0..length {
                elems.push(endianness.read_i32(stream)?);
            }
            ElemSeq::Int32(elems)
        }
        Tag::Int64 => {
            let mut elems = Vec::with_capacity(length);
            for _ in 0..length {
                elems.push(endianness.read_i64(stream)?);
            }
            ElemSeq::Int64(elems)
        }
        Tag::Float64 => {
            let mut elems = Vec::with_capacity(length);
            for _ in 0..length {
                elems.push(endianness.read_f64(stream)?);
            }
            ElemSeq::Float64(elems)
        }
        _ => {
            let mut elems = Vec::with_capacity(length);
            for _ in 0..length {
                elems.push(decode_value(stream, endianness)?);
            }
            ElemSeq::Values(elems)
        }
    })
}

fn encode_elem_seq(stream: &mut impl Write, endianness: Endianness, seq: &ElemSeq) -> Result<()> {
    stream.write_u8(seq.elem_tag().byte())?;
    match seq {
        ElemSeq::Bool(elems) => {
            for &elem in elems {
                stream.write_u8(elem as u8)?;
            }
        }
        ElemSeq::Int32(elems) => {
            for &elem in elems {
                endianness.write_i32(stream, elem)?;
            }
        }
        ElemSeq::Int64(elems) => {
            for &elem in elems {
                endianness.write_i64(stream, elem)?;
            }
        }
        ElemSeq::Float64(elems) => {
            for &elem in elems {
                endianness.write_f64(stream, elem)?;
            }
        }
        ElemSeq::Values(elems) => {
            for elem in elems {
                if matches!(
                    elem.tag(),
                    Tag::Bool | Tag::Int32 | Tag::Int64 | Tag::Float64
                ) {
                    anyhow::bail!("scalar sequence elements must use bulk storage");
                }
                encode_value(stream, endianness, elem)?;
            }
        }
    }
    Ok(())
}

/// Decode one tagged value.
pub fn decode_value(stream: &mut impl Read, endianness: Endianness) -> Result<Value> {
    let tag = Tag::from_byte(stream.read_u8()?)?;
    decode_value_payload(stream, endianness, tag)
}

fn decode_value_payload(
    stream: &mut impl Read,
    endianness: Endianness,
    tag: Tag,
) -> Result<Value> {
    Ok(match tag {
        Tag::None => Value::None,
        Tag::Bool => Value::Bool(stream.read_u8()? != 0),
        Tag::Int32 => Value::Int32(endianness.read_i32(stream)?),
        Tag::Int64 => Value::Int64(endianness.read_i64(stream)?),
        Tag::Float64 => Value::Float64(endianness.read_f64(stream)?),
        Tag::Fraction => Value::Fraction {
            numerator: endianness.read_i64(stream)?,
            denominator: endianness.read_i64(stream)?,
        },
        Tag::Str => Value::Str(read_string(stream, endianness)?),
        Tag::Bytes => Value::Bytes(read_byte_string(stream, endianness)?),
        Tag::ByteArray => Value::ByteArray(read_byte_string(stream, endianness)?),
        Tag::ObjectRef => Value::ObjectRef(endianness.read_u32(stream)?),
        Tag::Tuple => {
            let length = stream.read_u8()? as usize;
            let mut elems = Vec::with_capacity(length);
            for _ in 0..length {
                elems.push(decode_value(stream, endianness)?);
            }
            Value::Tuple(elems)
        }
        Tag::List => {
            let length = endianness.read_u32(stream)? as usize;
            let elem_tag = Tag::from_byte(stream.read_u8()?)?;
            Value::List(decode_elem_seq(stream, endianness, elem_tag, length)?)
        }
        Tag::Array => {
            let ndims = stream.read_u8()? as usize;
            let mut shape = Vec::with_capacity(ndims);
            for _ in 0..ndims {
                shape.push(endianness.read_u32(stream)?);
            }
            let length = shape
                .iter()
                .try_fold(1usize, |acc, &extent| acc.checked_mul(extent as usize))
                .context("array element count overflows")?;
            let elem_tag = Tag::from_byte(stream.read_u8()?)?;
            Value::Array {
                shape,
                data: decode_elem_seq(stream, endianness, elem_tag, length)?,
            }
        }
        Tag::Range => Value::Range {
            start: Box::new(decode_value(stream, endianness)?),
            stop: Box::new(decode_value(stream, endianness)?),
            step: Box::new(decode_value(stream, endianness)?),
        },
        Tag::Keyword => Value::Keyword {
            name: read_string(stream, endianness)?,
            value: Box::new(decode_value(stream, endianness)?),
        },
    })
}

/// Encode one tagged value; the exact inverse of [`decode_value`].
pub fn encode_value(stream: &mut impl Write, endianness: Endianness, value: &Value) -> Result<()> {
    stream.write_u8(value.tag().byte())?;
    match value {
        Value::None => {}
        Value::Bool(b) => stream.write_u8(*b as u8)?,
        Value::Int32(v) => endianness.write_i32(stream, *v)?,
        Value::Int64(v) => endianness.write_i64(stream, *v)?,
        Value::Float64(v) => endianness.write_f64(stream, *v)?,
        Value::Fraction {
            numerator,
            denominator,
        } => {
            endianness.write_i64(stream, *numerator)?;
            endianness.write_i64(stream, *denominator)?;
        }
        Value::Str(s) => write_byte_string(stream, endianness, s.as_bytes())?,
        Value::Bytes(b) | Value::ByteArray(b) => write_byte_string(stream, endianness, b)?,
        Value::ObjectRef(key) => endianness.write_u32(stream, *key)?,
        Value::Tuple(elems) => {
            stream.write_u8(u8::try_from(elems.len()).context("tuple too long")?)?;
            for elem in elems {
                encode_value(stream, endianness, elem)?;
            }
        }
        Value::List(seq) => {
            endianness.write_u32(stream, u32::try_from(seq.len()).context("list too long")?)?;
            encode_elem_seq(stream, endianness, seq)?;
        }
        Value::Array { shape, data } => {
            stream.write_u8(u8::try_from(shape.len()).context("too many dimensions")?)?;
            for &extent in shape {
                endianness.write_u32(stream, extent)?;
            }
            encode_elem_seq(stream, endianness, data)?;
        }
        Value::Range { start, stop, step } => {
            encode_value(stream, endianness, start)?;
            encode_value(stream, endianness, stop)?;
            encode_value(stream, endianness, step)?;
        }
        Value::Keyword { name, value } => {
            write_byte_string(stream, endianness, name.as_bytes())?;
            encode_value(stream, endianness, value)?;
        }
    }
    Ok(())
}

/// Read RPC call arguments up to the end-of-arguments sentinel. Keyword
/// values are split off into the second return.
pub fn decode_rpc_args(
    stream: &mut impl Read,
    endianness: Endianness,
) -> Result<(Vec<Value>, BTreeMap<String, Value>)> {
    let mut args = Vec::new();
    let mut kwargs = BTreeMap::new();
    loop {
        let byte = stream.read_u8()?;
        if byte == 0 {
            return Ok((args, kwargs));
        }
        let tag = Tag::from_byte(byte)?;
        match decode_value_payload(stream, endianness, tag)? {
            Value::Keyword { name, value } => {
                kwargs.insert(name, *value);
            }
            value => args.push(value),
        }
    }
}

/// Cursor over an expected-type tag string. Cheap to copy; forks of the
/// cursor validate each element of a homogeneous container against the same
/// element type.
#[derive(Copy, Clone, Debug)]
pub struct TagCursor<'a> {
    tags: &'a [u8],
    pos: usize,
}

impl<'a> TagCursor<'a> {
    pub fn new(tags: &'a [u8]) -> Self {
        TagCursor { tags, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tags.len()
    }

    fn next_byte(&mut self) -> Result<u8, RpcReturnValueError> {
        let byte = *self.tags.get(self.pos).ok_or_else(|| RpcReturnValueError {
            expected: "end of type".to_string(),
            actual: "more data".to_string(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn next_tag(&mut self) -> Result<Tag, RpcReturnValueError> {
        let byte = self.next_byte()?;
        Tag::from_byte(byte).map_err(|_| RpcReturnValueError {
            expected: "a known tag".to_string(),
            actual: format!("tag byte {byte:#04x}"),
        })
    }
}

fn mismatch(tag: Tag, value: &Value) -> RpcReturnValueError {
    RpcReturnValueError {
        expected: format!("{tag:?}"),
        actual: format!("{value:?}"),
    }
}

/// Advance the cursor over one complete type.
pub fn skip_rpc_value(tags: &mut TagCursor) -> Result<(), RpcReturnValueError> {
    match tags.next_tag()? {
        Tag::Tuple => {
            let length = tags.next_byte()?;
            for _ in 0..length {
                skip_rpc_value(tags)?;
            }
        }
        Tag::List | Tag::Range | Tag::Keyword => skip_rpc_value(tags)?,
        Tag::Array => {
            // Dimension count byte, then the element type.
            tags.next_byte()?;
            skip_rpc_value(tags)?;
        }
        _ => {}
    }
    Ok(())
}

fn validate_elem_seq(
    tags: &mut TagCursor,
    seq: &ElemSeq,
    container: &Value,
) -> Result<(), RpcReturnValueError> {
    let elem_start = *tags;
    let expected = {
        let mut peek = elem_start;
        peek.next_tag()?
    };
    let matches = match (seq, expected) {
        (ElemSeq::Bool(_), Tag::Bool)
        | (ElemSeq::Int32(_), Tag::Int32)
        | (ElemSeq::Int64(_), Tag::Int64)
        | (ElemSeq::Float64(_), Tag::Float64) => true,
        (ElemSeq::Values(elems), _) => {
            for elem in elems {
                let mut fork = elem_start;
                validate_rpc_value(&mut fork, elem)?;
            }
            true
        }
        _ => false,
    };
    if !matches {
        return Err(mismatch(expected, container));
    }
    skip_rpc_value(tags)
}

/// Check `value` against one complete expected type, consuming it from the
/// cursor. Nothing is written anywhere on failure.
fn validate_rpc_value(tags: &mut TagCursor, value: &Value) -> Result<(), RpcReturnValueError> {
    let tag = tags.next_tag()?;
    match (tag, value) {
        (Tag::None, Value::None)
        | (Tag::Bool, Value::Bool(_))
        | (Tag::Int32, Value::Int32(_))
        | (Tag::Int64, Value::Int64(_) | Value::Int32(_))
        | (Tag::Float64, Value::Float64(_))
        | (Tag::Fraction, Value::Fraction { .. })
        | (Tag::Str, Value::Str(_))
        | (Tag::Bytes, Value::Bytes(_))
        | (Tag::ByteArray, Value::ByteArray(_))
        | (Tag::ObjectRef, Value::ObjectRef(_)) => Ok(()),
        (Tag::Int32, Value::Int64(v)) => {
            // A wider host integer is fine as long as the value fits.
            if i32::try_from(*v).is_ok() {
                Ok(())
            } else {
                Err(RpcReturnValueError {
                    expected: "a 32-bit integer".to_string(),
                    actual: format!("{v} (overflow)"),
                })
            }
        }
        (Tag::Tuple, Value::Tuple(elems)) => {
            let length = tags.next_byte()? as usize;
            if length != elems.len() {
                return Err(RpcReturnValueError {
                    expected: format!("a tuple of {length} elements"),
                    actual: format!("a tuple of {} elements", elems.len()),
                });
            }
            for elem in elems {
                validate_rpc_value(tags, elem)?;
            }
            Ok(())
        }
        (Tag::List, Value::List(seq)) => validate_elem_seq(tags, seq, value),
        (Tag::Array, Value::Array { shape, data }) => {
            let ndims = tags.next_byte()? as usize;
            if ndims != shape.len() {
                return Err(RpcReturnValueError {
                    expected: format!("an array of {ndims} dimensions"),
                    actual: format!("an array of {} dimensions", shape.len()),
                });
            }
            let length = shape.iter().map(|&e| e as usize).product::<usize>();
            if length != data.len() {
                return Err(RpcReturnValueError {
                    expected: format!("{length} array elements"),
                    actual: format!("{} array elements", data.len()),
                });
            }
            validate_elem_seq(tags, data, value)
        }
        (Tag::Range, Value::Range { start, stop, step }) => {
            for bound in [start, stop, step] {
                let mut fork = *tags;
                validate_rpc_value(&mut fork, bound)?;
            }
            skip_rpc_value(tags)
        }
        (Tag::Keyword, Value::Keyword { value, .. }) => validate_rpc_value(tags, value),
        (tag, value) => Err(mismatch(tag, value)),
    }
}

/// Validate `value` against the expected type at the cursor, then write it.
pub fn send_rpc_value(
    stream: &mut impl Write,
    endianness: Endianness,
    tags: &mut TagCursor,
    value: &Value,
) -> Result<()> {
    validate_rpc_value(tags, value)?;
    encode_value(stream, endianness, value)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn round_trip(value: Value) {
        for endianness in [Endianness::Big, Endianness::Little] {
            let mut wire = Vec::new();
            encode_value(&mut wire, endianness, &value).unwrap();
            let decoded = decode_value(&mut Cursor::new(&wire), endianness).unwrap();
            assert_eq!(decoded, value, "endianness {endianness:?}");
        }
    }

    #[test]
    fn test_scalar_round_trips() {
        round_trip(Value::None);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Int32(i32::MIN));
        round_trip(Value::Int32(i32::MAX));
        round_trip(Value::Int64(i64::MIN));
        round_trip(Value::Int64(i64::MAX));
        round_trip(Value::Float64(-0.0));
        round_trip(Value::Float64(1.5e300));
        round_trip(Value::Fraction {
            numerator: -3,
            denominator: 7,
        });
        round_trip(Value::ObjectRef(42));
    }

    #[test]
    fn test_string_round_trips() {
        round_trip(Value::Str(String::new()));
        round_trip(Value::Str("héllo wörld ∞".to_string()));
        round_trip(Value::Bytes(vec![0, 1, 255]));
        round_trip(Value::ByteArray(vec![]));
    }

    #[test]
    fn test_container_round_trips() {
        round_trip(Value::Tuple(vec![]));
        round_trip(Value::Tuple(vec![
            Value::Int32(1),
            Value::Str("x".to_string()),
            Value::Tuple(vec![Value::Bool(false)]),
        ]));
        round_trip(Value::List(ElemSeq::Int32(vec![1, 2, 3])));
        round_trip(Value::List(ElemSeq::Float64(vec![0.5, -0.5])));
        round_trip(Value::List(ElemSeq::Bool(vec![true, false])));
        round_trip(Value::List(ElemSeq::Values(vec![
            Value::Str("a".to_string()),
            Value::Str("b".to_string()),
        ])));
        round_trip(Value::List(ElemSeq::Values(vec![])));
        round_trip(Value::Range {
            start: Box::new(Value::Int32(0)),
            stop: Box::new(Value::Int32(10)),
            step: Box::new(Value::Int32(2)),
        });
        round_trip(Value::Keyword {
            name: "power".to_string(),
            value: Box::new(Value::Float64(0.25)),
        });
    }

    #[test]
    fn test_array_round_trips() {
        round_trip(Value::Array {
            shape: vec![2, 3],
            data: ElemSeq::Int64(vec![1, 2, 3, 4, 5, 6]),
        });
        round_trip(Value::Array {
            shape: vec![2, 2, 2],
            data: ElemSeq::Float64(vec![0.0; 8]),
        });
    }

    #[test]
    fn test_scalars_in_values_storage_fail_to_encode() {
        let mut wire = Vec::new();
        let value = Value::List(ElemSeq::Values(vec![Value::Int32(1)]));
        assert!(encode_value(&mut wire, Endianness::Big, &value).is_err());
    }

    #[test]
    fn test_unknown_tag_fails() {
        let result = decode_value(&mut Cursor::new(b"Z"), Endianness::Big);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_rpc_args() {
        let endianness = Endianness::Big;
        let mut wire = Vec::new();
        encode_value(&mut wire, endianness, &Value::Int32(5)).unwrap();
        encode_value(
            &mut wire,
            endianness,
            &Value::Keyword {
                name: "gain".to_string(),
                value: Box::new(Value::Float64(2.0)),
            },
        )
        .unwrap();
        encode_value(&mut wire, endianness, &Value::Str("probe".to_string())).unwrap();
        wire.push(0);

        let (args, kwargs) = decode_rpc_args(&mut Cursor::new(&wire), endianness).unwrap();
        assert_eq!(args, vec![Value::Int32(5), Value::Str("probe".to_string())]);
        assert_eq!(kwargs.len(), 1);
        assert_eq!(kwargs["gain"], Value::Float64(2.0));
    }

    fn validate(tags: &[u8], value: &Value) -> Result<(), RpcReturnValueError> {
        let mut cursor = TagCursor::new(tags);
        validate_rpc_value(&mut cursor, value)?;
        assert!(cursor.at_end(), "cursor not fully consumed");
        Ok(())
    }

    #[test]
    fn test_validation_accepts_matching_types() {
        validate(b"n", &Value::None).unwrap();
        validate(b"i", &Value::Int32(3)).unwrap();
        validate(b"I", &Value::Int32(3)).unwrap();
        validate(b"i", &Value::Int64(3)).unwrap();
        validate(b"li", &Value::List(ElemSeq::Int32(vec![1]))).unwrap();
        validate(b"ls", &Value::List(ElemSeq::Values(vec![Value::Str("x".into())]))).unwrap();
        validate(
            b"t\x02if",
            &Value::Tuple(vec![Value::Int32(0), Value::Float64(0.0)]),
        )
        .unwrap();
        validate(
            b"a\x02I",
            &Value::Array {
                shape: vec![1, 2],
                data: ElemSeq::Int64(vec![7, 8]),
            },
        )
        .unwrap();
        validate(
            b"ri",
            &Value::Range {
                start: Box::new(Value::Int32(0)),
                stop: Box::new(Value::Int32(4)),
                step: Box::new(Value::Int32(1)),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_validation_rejects_mismatches() {
        assert!(validate(b"i", &Value::Str("no".to_string())).is_err());
        assert!(validate(b"i", &Value::Int64(i64::MAX)).is_err());
        assert!(validate(b"li", &Value::List(ElemSeq::Float64(vec![1.0]))).is_err());
        assert!(validate(b"t\x02ii", &Value::Tuple(vec![Value::Int32(0)])).is_err());
        assert!(validate(
            b"a\x01i",
            &Value::Array {
                shape: vec![2, 2],
                data: ElemSeq::Int32(vec![0; 4]),
            }
        )
        .is_err());
        assert!(validate(
            b"a\x01i",
            &Value::Array {
                shape: vec![3],
                data: ElemSeq::Int32(vec![0; 4]),
            }
        )
        .is_err());
        // Heterogeneous element sneaks past the first element's type.
        assert!(validate(
            b"ls",
            &Value::List(ElemSeq::Values(vec![
                Value::Str("ok".to_string()),
                Value::Int32(1),
            ]))
        )
        .is_err());
    }

    #[test]
    fn test_skip_rpc_value() {
        let mut cursor = TagCursor::new(b"t\x02lifsI");
        skip_rpc_value(&mut cursor).unwrap();
        // The tuple consumed "t\x02lif"; "s" is next.
        assert_eq!(cursor.next_tag().unwrap(), Tag::Str);
        assert_eq!(cursor.next_tag().unwrap(), Tag::Int64);
        assert!(cursor.at_end());
    }

    #[test]
    fn test_send_rpc_value_writes_nothing_on_mismatch() {
        let mut wire = Vec::new();
        let mut cursor = TagCursor::new(b"i");
        let result = send_rpc_value(
            &mut wire,
            Endianness::Big,
            &mut cursor,
            &Value::Str("oops".to_string()),
        );
        assert!(result.is_err());
        assert!(wire.is_empty());
    }
}
