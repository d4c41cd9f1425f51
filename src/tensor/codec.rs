//! Tensor codec.
//!
//! Converts between [`TensorData`] and the three byte-level representations
//! used by the inference protocol:
//!
//! - **wire** (`encode` / `decode`): little-endian, with INT8/INT16 widened to
//!   32-bit signed, UINT8/UINT16 widened to 32-bit unsigned and FP16 promoted
//!   to FP32. Widening never truncates, so a round trip is exact.
//! - **raw** (`encode_raw` / `decode_raw`): little-endian at each datatype's
//!   native width. This is the layout of shared-memory regions and of
//!   `raw_output_contents` in responses.
//! - **typed contents** (`to_contents` / `from_contents`): the protocol's
//!   `InferTensorContents` message, which applies the same widening as the
//!   wire layout.
//!
//! `BYTES` elements are always serialized as a 4-byte little-endian length
//! followed by the raw bytes, and are never mixed with numeric contents.
//! Every decode path rejects payloads whose length does not match the shape
//! exactly.
//!
//! The client sends inline inputs as typed contents and reads raw outputs,
//! so the wire pair is not on its request path. It is public for callers
//! that need the byte image of typed contents without a client, e.g. to
//! store or forward tensors. `encode_checked` adds the shape check that
//! [`InferInput`](crate::InferInput) performs when data is set.

use super::{check_consistent, element_count, Datatype, TensorData};
use crate::error::{Error, Result};
use crate::proto::inference::InferTensorContents;
use half::f16;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Wire,
    Raw,
}

impl Layout {
    fn element_size(self, datatype: Datatype) -> Option<usize> {
        match self {
            Layout::Wire => datatype.wire_element_size(),
            Layout::Raw => datatype.element_size(),
        }
    }
}

trait LeBytes: Copy {
    const SIZE: usize;
    fn put(self, out: &mut Vec<u8>);
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! le_bytes {
    ($($ty:ty),* $(,)?) => {
        $(
            impl LeBytes for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn get(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

le_bytes!(i8, i16, i32, i64, u8, u16, u32, u64, f16, f32, f64);

fn put_all<T: LeBytes>(out: &mut Vec<u8>, values: impl IntoIterator<Item = T>) {
    for value in values {
        value.put(out);
    }
}

fn get_all<T: LeBytes>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::get).collect()
}

fn narrow<S, T>(values: &[S]) -> Result<Vec<T>>
where
    S: Copy + Display,
    T: TryFrom<S>,
{
    values
        .iter()
        .map(|&v| {
            T::try_from(v).map_err(|_| {
                Error::InvalidData(format!(
                    "value {} does not fit in {}",
                    v,
                    std::any::type_name::<T>()
                ))
            })
        })
        .collect()
}

/// Encodes `data` in the widened wire layout.
pub fn encode(datatype: Datatype, data: &TensorData) -> Result<Vec<u8>> {
    encode_with(Layout::Wire, datatype, data)
}

/// Decodes wire-layout `bytes` into a tensor of `shape`.
pub fn decode(datatype: Datatype, bytes: &[u8], shape: &[i64]) -> Result<TensorData> {
    decode_with(Layout::Wire, datatype, bytes, shape)
}

/// Encodes `data` at native element width.
pub fn encode_raw(datatype: Datatype, data: &TensorData) -> Result<Vec<u8>> {
    encode_with(Layout::Raw, datatype, data)
}

/// Decodes native-width `bytes` into a tensor of `shape`.
pub fn decode_raw(datatype: Datatype, bytes: &[u8], shape: &[i64]) -> Result<TensorData> {
    decode_with(Layout::Raw, datatype, bytes, shape)
}

fn check_datatype(datatype: Datatype, data: &TensorData) -> Result<()> {
    if data.datatype() != datatype {
        return Err(Error::InvalidData(format!(
            "{} data supplied for a {} tensor",
            data.datatype(),
            datatype
        )));
    }
    Ok(())
}

fn encode_with(layout: Layout, datatype: Datatype, data: &TensorData) -> Result<Vec<u8>> {
    check_datatype(datatype, data)?;

    let capacity = match layout.element_size(datatype) {
        Some(size) => data.len() * size,
        None => data.raw_byte_size(),
    };
    let mut out = Vec::with_capacity(capacity);
    let widen = layout == Layout::Wire;

    match data {
        TensorData::Bool(v) => out.extend(v.iter().map(|&b| u8::from(b))),
        TensorData::Int8(v) if widen => put_all(&mut out, v.iter().map(|&x| i32::from(x))),
        TensorData::Int8(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Int16(v) if widen => put_all(&mut out, v.iter().map(|&x| i32::from(x))),
        TensorData::Int16(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Int32(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Int64(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Uint8(v) if widen => put_all(&mut out, v.iter().map(|&x| u32::from(x))),
        TensorData::Uint8(v) => out.extend_from_slice(v),
        TensorData::Uint16(v) if widen => put_all(&mut out, v.iter().map(|&x| u32::from(x))),
        TensorData::Uint16(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Uint32(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Uint64(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Fp16(v) if widen => put_all(&mut out, v.iter().map(|x| x.to_f32())),
        TensorData::Fp16(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Fp32(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Fp64(v) => put_all(&mut out, v.iter().copied()),
        TensorData::Bytes(v) => serialize_bytes_into(&mut out, v)?,
    }

    Ok(out)
}

fn decode_with(
    layout: Layout,
    datatype: Datatype,
    bytes: &[u8],
    shape: &[i64],
) -> Result<TensorData> {
    let count = element_count(shape)?;

    let Some(size) = layout.element_size(datatype) else {
        return deserialize_bytes_tensor(bytes, count).map(TensorData::Bytes);
    };

    let expected = count
        .checked_mul(size)
        .ok_or_else(|| Error::InvalidData(format!("shape {:?} overflows", shape)))?;
    if bytes.len() != expected {
        return Err(Error::ShapeMismatch(format!(
            "{} tensor of shape {:?} needs {} bytes, got {}",
            datatype,
            shape,
            expected,
            bytes.len()
        )));
    }

    let widened = layout == Layout::Wire;
    let data = match datatype {
        Datatype::Bool => TensorData::Bool(bytes.iter().map(|&b| b != 0).collect()),
        Datatype::Int8 if widened => TensorData::Int8(narrow(&get_all::<i32>(bytes))?),
        Datatype::Int8 => TensorData::Int8(get_all(bytes)),
        Datatype::Int16 if widened => TensorData::Int16(narrow(&get_all::<i32>(bytes))?),
        Datatype::Int16 => TensorData::Int16(get_all(bytes)),
        Datatype::Int32 => TensorData::Int32(get_all(bytes)),
        Datatype::Int64 => TensorData::Int64(get_all(bytes)),
        Datatype::Uint8 if widened => TensorData::Uint8(narrow(&get_all::<u32>(bytes))?),
        Datatype::Uint8 => TensorData::Uint8(bytes.to_vec()),
        Datatype::Uint16 if widened => TensorData::Uint16(narrow(&get_all::<u32>(bytes))?),
        Datatype::Uint16 => TensorData::Uint16(get_all(bytes)),
        Datatype::Uint32 => TensorData::Uint32(get_all(bytes)),
        Datatype::Uint64 => TensorData::Uint64(get_all(bytes)),
        Datatype::Fp16 if widened => TensorData::Fp16(
            get_all::<f32>(bytes)
                .into_iter()
                .map(f16::from_f32)
                .collect(),
        ),
        Datatype::Fp16 => TensorData::Fp16(get_all(bytes)),
        Datatype::Fp32 => TensorData::Fp32(get_all(bytes)),
        Datatype::Fp64 => TensorData::Fp64(get_all(bytes)),
        Datatype::Bytes => unreachable!("BYTES has no fixed element size"),
    };

    Ok(data)
}

fn serialize_bytes_into(out: &mut Vec<u8>, elements: &[Vec<u8>]) -> Result<()> {
    for element in elements {
        let len = u32::try_from(element.len()).map_err(|_| {
            Error::InvalidData(format!(
                "BYTES element of {} bytes exceeds the 4-byte length prefix",
                element.len()
            ))
        })?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(element);
    }
    Ok(())
}

/// Serializes `BYTES` elements as length-prefixed records.
pub fn serialize_bytes_tensor(elements: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(elements.iter().map(|e| 4 + e.len()).sum());
    serialize_bytes_into(&mut out, elements)?;
    Ok(out)
}

/// Parses `count` length-prefixed elements from the front of `bytes`.
///
/// Returns the elements and the number of bytes consumed; trailing bytes are
/// left to the caller.
pub fn deserialize_bytes_prefix(bytes: &[u8], count: usize) -> Result<(Vec<Vec<u8>>, usize)> {
    let mut elements = Vec::with_capacity(count.min(bytes.len() / 4));
    let mut pos = 0usize;

    for index in 0..count {
        let header = bytes.get(pos..pos + 4).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "BYTES payload truncated at element {} of {}",
                index, count
            ))
        })?;
        let len = u32::get(header) as usize;
        pos += 4;
        let body = bytes.get(pos..pos + len).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "BYTES element {} declares {} bytes, {} available",
                index,
                len,
                bytes.len() - pos
            ))
        })?;
        elements.push(body.to_vec());
        pos += len;
    }

    Ok((elements, pos))
}

/// Parses exactly `count` length-prefixed elements occupying all of `bytes`.
pub fn deserialize_bytes_tensor(bytes: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
    let (elements, consumed) = deserialize_bytes_prefix(bytes, count)?;
    if consumed != bytes.len() {
        return Err(Error::ShapeMismatch(format!(
            "BYTES payload has {} trailing bytes after {} elements",
            bytes.len() - consumed,
            count
        )));
    }
    Ok(elements)
}

/// Moves `data` into the protocol's typed contents message.
pub fn to_contents(datatype: Datatype, data: TensorData) -> Result<InferTensorContents> {
    check_datatype(datatype, &data)?;

    let mut contents = InferTensorContents::default();
    match data {
        TensorData::Bool(v) => contents.bool_contents = v,
        TensorData::Int8(v) => contents.int_contents = v.into_iter().map(i32::from).collect(),
        TensorData::Int16(v) => contents.int_contents = v.into_iter().map(i32::from).collect(),
        TensorData::Int32(v) => contents.int_contents = v,
        TensorData::Int64(v) => contents.int64_contents = v,
        TensorData::Uint8(v) => contents.uint_contents = v.into_iter().map(u32::from).collect(),
        TensorData::Uint16(v) => contents.uint_contents = v.into_iter().map(u32::from).collect(),
        TensorData::Uint32(v) => contents.uint_contents = v,
        TensorData::Uint64(v) => contents.uint64_contents = v,
        TensorData::Fp16(v) => contents.fp32_contents = v.into_iter().map(f16::to_f32).collect(),
        TensorData::Fp32(v) => contents.fp32_contents = v,
        TensorData::Fp64(v) => contents.fp64_contents = v,
        TensorData::Bytes(v) => contents.bytes_contents = v,
    }
    Ok(contents)
}

/// Extracts a tensor of `shape` from typed contents.
pub fn from_contents(
    datatype: Datatype,
    contents: &InferTensorContents,
    shape: &[i64],
) -> Result<TensorData> {
    let count = element_count(shape)?;
    let check = |len: usize| -> Result<()> {
        if len != count {
            return Err(Error::ShapeMismatch(format!(
                "{} tensor of shape {:?} holds {} elements, contents have {}",
                datatype, shape, count, len
            )));
        }
        Ok(())
    };

    let data = match datatype {
        Datatype::Bool => {
            check(contents.bool_contents.len())?;
            TensorData::Bool(contents.bool_contents.clone())
        }
        Datatype::Int8 => {
            check(contents.int_contents.len())?;
            TensorData::Int8(narrow(&contents.int_contents)?)
        }
        Datatype::Int16 => {
            check(contents.int_contents.len())?;
            TensorData::Int16(narrow(&contents.int_contents)?)
        }
        Datatype::Int32 => {
            check(contents.int_contents.len())?;
            TensorData::Int32(contents.int_contents.clone())
        }
        Datatype::Int64 => {
            check(contents.int64_contents.len())?;
            TensorData::Int64(contents.int64_contents.clone())
        }
        Datatype::Uint8 => {
            check(contents.uint_contents.len())?;
            TensorData::Uint8(narrow(&contents.uint_contents)?)
        }
        Datatype::Uint16 => {
            check(contents.uint_contents.len())?;
            TensorData::Uint16(narrow(&contents.uint_contents)?)
        }
        Datatype::Uint32 => {
            check(contents.uint_contents.len())?;
            TensorData::Uint32(contents.uint_contents.clone())
        }
        Datatype::Uint64 => {
            check(contents.uint64_contents.len())?;
            TensorData::Uint64(contents.uint64_contents.clone())
        }
        Datatype::Fp16 => {
            check(contents.fp32_contents.len())?;
            TensorData::Fp16(contents.fp32_contents.iter().map(|&x| f16::from_f32(x)).collect())
        }
        Datatype::Fp32 => {
            check(contents.fp32_contents.len())?;
            TensorData::Fp32(contents.fp32_contents.clone())
        }
        Datatype::Fp64 => {
            check(contents.fp64_contents.len())?;
            TensorData::Fp64(contents.fp64_contents.clone())
        }
        Datatype::Bytes => {
            check(contents.bytes_contents.len())?;
            TensorData::Bytes(contents.bytes_contents.clone())
        }
    };

    Ok(data)
}

/// Validates `data` against a header and encodes it in one step.
pub fn encode_checked(datatype: Datatype, shape: &[i64], data: &TensorData) -> Result<Vec<u8>> {
    check_consistent(datatype, shape, data)?;
    encode(datatype, data)
}
