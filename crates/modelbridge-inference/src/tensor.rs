//! Tensor descriptors and the encoded (name + dims + dtype + bytes) tensor form.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::buffer::NativeBuffer;
use crate::error::InferenceError;
use crate::Result;

/// Supported tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    Int8,
    Uint8,
    Int16,
    Int32,
    Int64,
    Bool,
}

impl DataType {
    /// Size in bytes of a single element.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Bool => 1,
            Self::Int16 => 2,
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "float32" | "float" => Ok(Self::Float32),
            "float64" | "double" => Ok(Self::Float64),
            "int8" => Ok(Self::Int8),
            "uint8" => Ok(Self::Uint8),
            "int16" => Ok(Self::Int16),
            "int32" => Ok(Self::Int32),
            "int64" => Ok(Self::Int64),
            "bool" => Ok(Self::Bool),
            other => Err(format!("unknown tensor type '{}'", other)),
        }
    }
}

/// Declared model input or output.
///
/// Negative entries in `dims` are dynamic axes; any concrete size is accepted
/// for them at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: DataType,
    pub dims: Vec<i64>,
}

impl TensorDescriptor {
    pub fn new(name: impl Into<String>, dtype: DataType, dims: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
        }
    }

    /// Whether any axis is dynamic.
    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(|&d| d < 0)
    }

    /// Check a fed tensor against this declaration.
    ///
    /// The dtype must match exactly, ranks must agree, fixed axes must match
    /// and dynamic axes accept any non-negative size. The byte length of the
    /// data must equal the element count implied by the tensor's dims.
    pub fn check(&self, tensor: &EncodedTensor) -> Result<()> {
        let dtype = tensor.data_type()?;
        if dtype != self.dtype {
            return Err(InferenceError::TypeMismatch {
                name: self.name.clone(),
                expected: self.dtype.to_string(),
                actual: dtype.to_string(),
            });
        }

        if tensor.dims.len() != self.dims.len() {
            return Err(InferenceError::ShapeMismatch {
                name: self.name.clone(),
                reason: format!(
                    "expected rank {} {:?}, got rank {} {:?}",
                    self.dims.len(),
                    self.dims,
                    tensor.dims.len(),
                    tensor.dims
                ),
            });
        }

        for (axis, (&declared, &given)) in self.dims.iter().zip(&tensor.dims).enumerate() {
            if given < 0 {
                return Err(InferenceError::ShapeMismatch {
                    name: self.name.clone(),
                    reason: format!("axis {} has unresolved size {}", axis, given),
                });
            }
            if declared >= 0 && declared != given {
                return Err(InferenceError::ShapeMismatch {
                    name: self.name.clone(),
                    reason: format!("expected {:?}, got {:?}", self.dims, tensor.dims),
                });
            }
        }

        let expected = tensor.byte_len()?;
        if tensor.data.len() != expected {
            return Err(InferenceError::ShapeMismatch {
                name: self.name.clone(),
                reason: format!(
                    "dims {:?} imply {} bytes of {}, data holds {}",
                    tensor.dims,
                    expected,
                    dtype,
                    tensor.data.len()
                ),
            });
        }

        Ok(())
    }
}

/// A named, shaped, typed byte buffer fed to a run.
///
/// `dtype` keeps the caller's type string; it is only interpreted when the
/// tensor is checked against a model input.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTensor {
    pub name: String,
    pub dtype: String,
    pub dims: Vec<i64>,
    pub data: NativeBuffer,
}

impl EncodedTensor {
    pub fn new(name: impl Into<String>, dtype: DataType, dims: Vec<i64>, data: NativeBuffer) -> Self {
        Self {
            name: name.into(),
            dtype: dtype.to_string(),
            dims,
            data,
        }
    }

    /// Encode an ndarray as a little-endian tensor.
    pub fn from_array<T: Element>(name: impl Into<String>, array: &ArrayD<T>) -> Self {
        let dims = array.shape().iter().map(|&s| s as i64).collect();
        let data = encode(array.iter().copied());
        Self::new(name, T::DATA_TYPE, dims, data)
    }

    /// Parse the dtype string.
    pub fn data_type(&self) -> Result<DataType> {
        self.dtype
            .parse()
            .map_err(|reason: String| InferenceError::TypeMismatch {
                name: self.name.clone(),
                expected: "a supported tensor type".to_string(),
                actual: reason,
            })
    }

    /// Dims as unsigned sizes.
    pub fn shape(&self) -> Result<Vec<usize>> {
        self.dims
            .iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| InferenceError::ShapeMismatch {
                    name: self.name.clone(),
                    reason: format!("negative dimension {} in {:?}", d, self.dims),
                })
            })
            .collect()
    }

    /// Number of bytes the dims and dtype call for.
    pub fn byte_len(&self) -> Result<usize> {
        let dtype = self.data_type()?;
        self.shape()?
            .into_iter()
            .try_fold(dtype.byte_size(), |acc, d| acc.checked_mul(d))
            .ok_or_else(|| InferenceError::ShapeMismatch {
                name: self.name.clone(),
                reason: format!("dims {:?} overflow the addressable size", self.dims),
            })
    }

    /// Decode the data as elements of `T`.
    pub fn values<T: Element>(&self) -> Result<Vec<T>> {
        let dtype = self.data_type()?;
        if dtype != T::DATA_TYPE {
            return Err(InferenceError::TypeMismatch {
                name: self.name.clone(),
                expected: T::DATA_TYPE.to_string(),
                actual: dtype.to_string(),
            });
        }
        Ok(decode(&self.data))
    }

    /// Decode into an ndarray of the tensor's shape.
    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>> {
        let shape = self.shape()?;
        let values = self.values::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| {
            InferenceError::ShapeMismatch {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }
}

/// Element types with a fixed little-endian byte encoding.
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Read one element from exactly `DATA_TYPE.byte_size()` bytes.
    fn read_le(chunk: &[u8]) -> Self;

    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dtype;

                fn read_le(chunk: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(chunk);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element! {
    f32 => Float32,
    f64 => Float64,
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
}

impl Element for bool {
    const DATA_TYPE: DataType = DataType::Bool;

    fn read_le(chunk: &[u8]) -> Self {
        chunk[0] != 0
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
}

/// Decode little-endian bytes. Trailing bytes that do not form a whole
/// element are ignored.
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DATA_TYPE.byte_size())
        .map(T::read_le)
        .collect()
}

/// Encode elements into a fresh buffer.
pub fn encode<T: Element>(values: impl IntoIterator<Item = T>) -> NativeBuffer {
    let values = values.into_iter();
    let mut out = Vec::with_capacity(values.size_hint().0 * T::DATA_TYPE.byte_size());
    for v in values {
        v.write_le(&mut out);
    }
    NativeBuffer::from_vec(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn f32_tensor(name: &str, dims: Vec<i64>) -> EncodedTensor {
        let count: i64 = dims.iter().product();
        let data = encode((0..count).map(|v| v as f32));
        EncodedTensor::new(name, DataType::Float32, dims, data)
    }

    #[test]
    fn test_matching_shape_is_accepted() {
        let declared = TensorDescriptor::new("x", DataType::Float32, vec![2, 2]);
        let tensor = f32_tensor("x", vec![2, 2]);
        assert_eq!(tensor.data.len(), 16);
        declared.check(&tensor).unwrap();
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let declared = TensorDescriptor::new("x", DataType::Float32, vec![2, 2]);
        let err = declared.check(&f32_tensor("x", vec![3, 3])).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { ref name, .. } if name == "x"));
    }

    #[test]
    fn test_dynamic_axis_accepts_any_size() {
        let declared = TensorDescriptor::new("x", DataType::Float32, vec![-1, 3]);
        assert!(declared.is_dynamic());
        for batch in [1, 2, 7] {
            declared.check(&f32_tensor("x", vec![batch, 3])).unwrap();
        }
        let err = declared.check(&f32_tensor("x", vec![4, 4])).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rank_mismatch_is_shape_error() {
        let declared = TensorDescriptor::new("x", DataType::Float32, vec![-1, 3]);
        let err = declared.check(&f32_tensor("x", vec![3])).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_dtype_mismatch_names_tensor() {
        let declared = TensorDescriptor::new("ids", DataType::Int64, vec![4]);
        let err = declared.check(&f32_tensor("ids", vec![4])).unwrap_err();
        match err {
            InferenceError::TypeMismatch { name, expected, actual } => {
                assert_eq!(name, "ids");
                assert_eq!(expected, "int64");
                assert_eq!(actual, "float32");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dtype_string_is_type_error() {
        let declared = TensorDescriptor::new("x", DataType::Float32, vec![1]);
        let mut tensor = f32_tensor("x", vec![1]);
        tensor.dtype = "complex128".to_string();
        assert!(matches!(
            declared.check(&tensor).unwrap_err(),
            InferenceError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_short_data_is_rejected() {
        let declared = TensorDescriptor::new("x", DataType::Float32, vec![2, 2]);
        let mut tensor = f32_tensor("x", vec![2, 2]);
        tensor.data = NativeBuffer::from_vec(vec![0; 12]);
        assert!(matches!(
            declared.check(&tensor).unwrap_err(),
            InferenceError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_array_conversion() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1i64, 2, 3, 4, 5, 6]).unwrap();
        let tensor = EncodedTensor::from_array("ids", &array);
        assert_eq!(tensor.dtype, "int64");
        assert_eq!(tensor.dims, vec![2, 3]);
        assert_eq!(tensor.to_array::<i64>().unwrap(), array);
        assert!(tensor.values::<f32>().is_err());
    }

    #[test]
    fn test_bool_encoding() {
        let buf = encode([true, false, true]);
        assert_eq!(buf.as_slice(), &[1, 0, 1]);
        assert_eq!(decode::<bool>(&buf), vec![true, false, true]);
    }
}
