//! Tensor data model.
//!
//! This module provides the closed set of datatypes understood by the
//! inference protocol and an owned, typed array (`TensorData`) for each of
//! them. Conversion to and from the wire lives in [`codec`].

pub mod codec;

use crate::error::{Error, Result};
use half::f16;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Element datatype of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Datatype {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Fp16,
    Fp32,
    Fp64,
    Bytes,
}

/// Static per-datatype properties: protocol name, native element size and
/// the element size of the widened wire container.
struct DatatypeInfo {
    name: &'static str,
    native_size: Option<usize>,
    wire_size: Option<usize>,
}

const DATATYPE_TABLE: [(Datatype, DatatypeInfo); 13] = [
    (Datatype::Bool, DatatypeInfo { name: "BOOL", native_size: Some(1), wire_size: Some(1) }),
    (Datatype::Int8, DatatypeInfo { name: "INT8", native_size: Some(1), wire_size: Some(4) }),
    (Datatype::Int16, DatatypeInfo { name: "INT16", native_size: Some(2), wire_size: Some(4) }),
    (Datatype::Int32, DatatypeInfo { name: "INT32", native_size: Some(4), wire_size: Some(4) }),
    (Datatype::Int64, DatatypeInfo { name: "INT64", native_size: Some(8), wire_size: Some(8) }),
    (Datatype::Uint8, DatatypeInfo { name: "UINT8", native_size: Some(1), wire_size: Some(4) }),
    (Datatype::Uint16, DatatypeInfo { name: "UINT16", native_size: Some(2), wire_size: Some(4) }),
    (Datatype::Uint32, DatatypeInfo { name: "UINT32", native_size: Some(4), wire_size: Some(4) }),
    (Datatype::Uint64, DatatypeInfo { name: "UINT64", native_size: Some(8), wire_size: Some(8) }),
    (Datatype::Fp16, DatatypeInfo { name: "FP16", native_size: Some(2), wire_size: Some(4) }),
    (Datatype::Fp32, DatatypeInfo { name: "FP32", native_size: Some(4), wire_size: Some(4) }),
    (Datatype::Fp64, DatatypeInfo { name: "FP64", native_size: Some(8), wire_size: Some(8) }),
    (Datatype::Bytes, DatatypeInfo { name: "BYTES", native_size: None, wire_size: None }),
];

lazy_static! {
    static ref DATATYPES_BY_NAME: HashMap<&'static str, Datatype> = DATATYPE_TABLE
        .iter()
        .map(|(dtype, info)| (info.name, *dtype))
        .collect();
}

impl Datatype {
    /// Every supported datatype, in protocol order.
    pub const ALL: [Datatype; 13] = [
        Datatype::Bool,
        Datatype::Int8,
        Datatype::Int16,
        Datatype::Int32,
        Datatype::Int64,
        Datatype::Uint8,
        Datatype::Uint16,
        Datatype::Uint32,
        Datatype::Uint64,
        Datatype::Fp16,
        Datatype::Fp32,
        Datatype::Fp64,
        Datatype::Bytes,
    ];

    fn info(self) -> &'static DatatypeInfo {
        &DATATYPE_TABLE[self as usize].1
    }

    /// Protocol name, e.g. `"FP32"`.
    pub fn as_str(self) -> &'static str {
        self.info().name
    }

    /// Size of one element in the native (raw / shared memory) layout.
    /// `None` for variable-length `BYTES`.
    pub fn element_size(self) -> Option<usize> {
        self.info().native_size
    }

    /// Size of one element in the widened wire container.
    ///
    /// INT8/INT16 travel as 32-bit signed, UINT8/UINT16 as 32-bit unsigned and
    /// FP16 as FP32. Widening is lossless.
    pub fn wire_element_size(self) -> Option<usize> {
        self.info().wire_size
    }

    pub fn is_variable_length(self) -> bool {
        self.element_size().is_none()
    }
}

impl FromStr for Datatype {
    type Err = Error;

    /// Case-insensitive match against the protocol names.
    fn from_str(s: &str) -> Result<Self> {
        DATATYPES_BY_NAME
            .get(s.to_ascii_uppercase().as_str())
            .copied()
            .ok_or_else(|| Error::UnsupportedDatatype(s.to_string()))
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned, flat (row-major) tensor contents.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Fp16(Vec<f16>),
    Fp32(Vec<f32>),
    Fp64(Vec<f64>),
    Bytes(Vec<Vec<u8>>),
}

macro_rules! tensor_data_conversions {
    ($($variant:ident => $ty:ty, $as_fn:ident);* $(;)?) => {
        $(
            impl From<Vec<$ty>> for TensorData {
                fn from(values: Vec<$ty>) -> Self {
                    TensorData::$variant(values)
                }
            }

            impl TensorData {
                pub fn $as_fn(&self) -> Option<&[$ty]> {
                    match self {
                        TensorData::$variant(values) => Some(values),
                        _ => None,
                    }
                }
            }
        )*
    };
}

tensor_data_conversions! {
    Bool => bool, as_bool;
    Int8 => i8, as_int8;
    Int16 => i16, as_int16;
    Int32 => i32, as_int32;
    Int64 => i64, as_int64;
    Uint8 => u8, as_uint8;
    Uint16 => u16, as_uint16;
    Uint32 => u32, as_uint32;
    Uint64 => u64, as_uint64;
    Fp16 => f16, as_fp16;
    Fp32 => f32, as_fp32;
    Fp64 => f64, as_fp64;
    Bytes => Vec<u8>, as_bytes;
}

impl From<Vec<String>> for TensorData {
    fn from(values: Vec<String>) -> Self {
        TensorData::Bytes(values.into_iter().map(String::into_bytes).collect())
    }
}

impl TensorData {
    pub fn datatype(&self) -> Datatype {
        match self {
            TensorData::Bool(_) => Datatype::Bool,
            TensorData::Int8(_) => Datatype::Int8,
            TensorData::Int16(_) => Datatype::Int16,
            TensorData::Int32(_) => Datatype::Int32,
            TensorData::Int64(_) => Datatype::Int64,
            TensorData::Uint8(_) => Datatype::Uint8,
            TensorData::Uint16(_) => Datatype::Uint16,
            TensorData::Uint32(_) => Datatype::Uint32,
            TensorData::Uint64(_) => Datatype::Uint64,
            TensorData::Fp16(_) => Datatype::Fp16,
            TensorData::Fp32(_) => Datatype::Fp32,
            TensorData::Fp64(_) => Datatype::Fp64,
            TensorData::Bytes(_) => Datatype::Bytes,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::Int8(v) => v.len(),
            TensorData::Int16(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Uint8(v) => v.len(),
            TensorData::Uint16(v) => v.len(),
            TensorData::Uint32(v) => v.len(),
            TensorData::Uint64(v) => v.len(),
            TensorData::Fp16(v) => v.len(),
            TensorData::Fp32(v) => v.len(),
            TensorData::Fp64(v) => v.len(),
            TensorData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte length in the native (raw) layout, including the 4-byte length
    /// prefix of every `BYTES` element.
    pub fn raw_byte_size(&self) -> usize {
        match self {
            TensorData::Bytes(elements) => elements.iter().map(|e| 4 + e.len()).sum(),
            other => other.len() * other.datatype().element_size().unwrap_or(0),
        }
    }
}

/// Number of elements described by `shape`.
///
/// Fails on negative dimensions (wildcards are not valid for concrete
/// tensors) and on overflow.
pub fn element_count(shape: &[i64]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        let dim = usize::try_from(dim).map_err(|_| {
            Error::InvalidData(format!("negative dimension {} in shape {:?}", dim, shape))
        })?;
        acc.checked_mul(dim)
            .ok_or_else(|| Error::InvalidData(format!("shape {:?} overflows", shape)))
    })
}

/// Validates that `data` has the datatype and element count declared by a
/// tensor header.
pub fn check_consistent(datatype: Datatype, shape: &[i64], data: &TensorData) -> Result<()> {
    if data.datatype() != datatype {
        return Err(Error::InvalidData(format!(
            "{} data supplied for a {} tensor",
            data.datatype(),
            datatype
        )));
    }
    let expected = element_count(shape)?;
    if data.len() != expected {
        return Err(Error::ShapeMismatch(format!(
            "shape {:?} holds {} elements, got {}",
            shape,
            expected,
            data.len()
        )));
    }
    Ok(())
}
