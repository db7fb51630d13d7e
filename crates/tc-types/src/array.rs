//! Dense, dynamically typed arrays.
//!
//! [`NdArray`] stores elements as little-endian bytes in row-major order next
//! to a [`DType`] tag and a shape. It is the value every codec consumes and
//! every read returns. Element-wise work goes through [`Scalar`]; axis work
//! (slicing, reversal) is delegated to `ndarray` over a byte view whose last
//! axis is the element width.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use serde_json::Value;

use crate::dtype::DType;
use crate::error::{TypeError, TypeResult};
use crate::index::IndexEntry;

/// A single element value, wide enough to hold any supported dtype.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i128),
    Float(f64),
}

impl Scalar {
    pub fn as_i128(&self) -> i128 {
        match *self {
            Self::Bool(b) => b as i128,
            Self::Int(v) => v,
            Self::Float(f) => f as i128,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(b) => b as u8 as f64,
            Self::Int(v) => v as f64,
            Self::Float(f) => f,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(b) => b,
            Self::Int(v) => v != 0,
            Self::Float(f) => f != 0.0,
        }
    }

    /// Whether this value survives a round trip through `dtype` unchanged.
    pub fn fits(&self, dtype: DType) -> bool {
        match (dtype.int_range(), *self) {
            (_, Self::Bool(_)) => true,
            (Some((lo, hi)), Self::Int(v)) => v >= lo && v <= hi,
            (Some((lo, hi)), Self::Float(f)) => {
                f.is_finite() && f.fract() == 0.0 && (f as i128) >= lo && (f as i128) <= hi
            }
            (None, _) => true,
        }
    }

    fn write(&self, dtype: DType, out: &mut Vec<u8>) {
        macro_rules! put {
            ($v:expr) => {
                out.extend_from_slice(&$v.to_le_bytes())
            };
        }
        match dtype {
            DType::Bool => out.push(self.as_bool() as u8),
            DType::U8 => put!(self.as_i128() as u8),
            DType::U16 => put!(self.as_i128() as u16),
            DType::U32 => put!(self.as_i128() as u32),
            DType::U64 => put!(self.as_i128() as u64),
            DType::I8 => put!(self.as_i128() as i8),
            DType::I16 => put!(self.as_i128() as i16),
            DType::I32 => put!(self.as_i128() as i32),
            DType::I64 => put!(self.as_i128() as i64),
            DType::F32 => put!(self.as_f64() as f32),
            DType::F64 => put!(self.as_f64()),
        }
    }

    fn read(dtype: DType, bytes: &[u8]) -> Self {
        fn le<const N: usize>(b: &[u8]) -> [u8; N] {
            let mut buf = [0u8; N];
            buf.copy_from_slice(&b[..N]);
            buf
        }
        match dtype {
            DType::Bool => Self::Bool(bytes[0] != 0),
            DType::U8 => Self::Int(bytes[0] as i128),
            DType::U16 => Self::Int(u16::from_le_bytes(le(bytes)) as i128),
            DType::U32 => Self::Int(u32::from_le_bytes(le(bytes)) as i128),
            DType::U64 => Self::Int(u64::from_le_bytes(le(bytes)) as i128),
            DType::I8 => Self::Int(bytes[0] as i8 as i128),
            DType::I16 => Self::Int(i16::from_le_bytes(le(bytes)) as i128),
            DType::I32 => Self::Int(i32::from_le_bytes(le(bytes)) as i128),
            DType::I64 => Self::Int(i64::from_le_bytes(le(bytes)) as i128),
            DType::F32 => Self::Float(f32::from_le_bytes(le(bytes)) as f64),
            DType::F64 => Self::Float(f64::from_le_bytes(le(bytes))),
        }
    }
}

/// Rust element types that map one-to-one onto a [`DType`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Row-major dense array with a runtime element type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    /// Wrap raw little-endian bytes. Fails if the length does not match the shape.
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> TypeResult<Self> {
        let expected = shape.iter().product::<usize>() * dtype.itemsize();
        if expected != data.len() {
            return Err(TypeError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> TypeResult<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.itemsize());
        for v in values {
            v.write_le(&mut data);
        }
        Self::from_bytes(T::DTYPE, shape, data)
    }

    /// Array of `shape` with every element set to `value`.
    pub fn filled<T: Element>(shape: Vec<usize>, value: T) -> Self {
        let count: usize = shape.iter().product();
        let mut one = Vec::with_capacity(T::DTYPE.itemsize());
        value.write_le(&mut one);
        Self {
            dtype: T::DTYPE,
            data: one.repeat(count),
            shape,
        }
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product::<usize>() * dtype.itemsize();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// Build from scalars, optionally refusing values that do not fit `dtype`.
    pub fn from_scalars(
        dtype: DType,
        shape: Vec<usize>,
        values: impl IntoIterator<Item = Scalar>,
        checked: bool,
    ) -> TypeResult<Self> {
        let mut data = Vec::new();
        for v in values {
            if checked && !v.fits(dtype) {
                return Err(TypeError::UnsafeCast {
                    value: format!("{v:?}"),
                    from: "scalar".into(),
                    to: dtype.name().into(),
                });
            }
            v.write(dtype, &mut data);
        }
        Self::from_bytes(dtype, shape, data)
    }

    /// Parse a nested JSON list.
    ///
    /// With `dtype` set, values are safely downcast (every value must fit);
    /// otherwise the dtype is inferred: `bool`, `int64`, or `float64`.
    pub fn from_json(value: &Value, dtype: Option<DType>) -> TypeResult<Self> {
        let mut shape = Vec::new();
        let mut leaf_depth = None;
        let mut scalars = Vec::new();
        collect_json(value, 0, &mut shape, &mut leaf_depth, &mut scalars)?;
        if let Some(depth) = leaf_depth {
            if depth != shape.len() {
                return Err(TypeError::Ragged(format!(
                    "scalars at depth {depth}, lists nested {} deep",
                    shape.len()
                )));
            }
        }
        let dtype = dtype.unwrap_or_else(|| infer_dtype(&scalars));
        Self::from_scalars(dtype, shape, scalars, true)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the raw element buffer in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Copy out typed elements. The requested type must match the dtype.
    pub fn to_vec<T: Element>(&self) -> TypeResult<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(TypeError::ElementType {
                expected: T::DTYPE.name().into(),
                actual: self.dtype.name().into(),
            });
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.itemsize())
            .map(T::read_le)
            .collect())
    }

    pub fn scalars(&self) -> impl Iterator<Item = Scalar> + '_ {
        let dtype = self.dtype;
        self.data
            .chunks_exact(dtype.itemsize())
            .map(move |b| Scalar::read(dtype, b))
    }

    /// Unchecked element-wise conversion (numpy `astype`).
    pub fn cast(&self, dtype: DType) -> NdArray {
        if dtype == self.dtype {
            return self.clone();
        }
        let mut data = Vec::with_capacity(self.num_elements() * dtype.itemsize());
        for s in self.scalars() {
            s.write(dtype, &mut data);
        }
        NdArray {
            dtype,
            shape: self.shape.clone(),
            data,
        }
    }

    /// Conversion that fails if any element would change value.
    pub fn safe_cast(&self, dtype: DType) -> TypeResult<NdArray> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        Self::from_scalars(dtype, self.shape.clone(), self.scalars(), true).map_err(|e| match e {
            TypeError::UnsafeCast { value, to, .. } => TypeError::UnsafeCast {
                value,
                from: self.dtype.name().into(),
                to,
            },
            other => other,
        })
    }

    pub fn reshape(self, shape: Vec<usize>) -> TypeResult<Self> {
        Self::from_bytes(self.dtype, shape, self.data)
    }

    /// Drop a length-one axis.
    pub fn squeeze_axis(&mut self, axis: usize) -> TypeResult<()> {
        match self.shape.get(axis) {
            Some(1) => {
                self.shape.remove(axis);
                Ok(())
            }
            Some(&size) => Err(TypeError::IndexOutOfBounds {
                index: 1,
                axis,
                size,
            }),
            None => Err(TypeError::TooManyIndices {
                ndim: self.ndim(),
                given: axis + 1,
            }),
        }
    }

    /// Apply `entries` to the leading axes. Integer entries collapse their axis.
    pub fn slice(&self, entries: &[IndexEntry]) -> TypeResult<NdArray> {
        if entries.is_empty() {
            return Ok(self.clone());
        }
        if entries.len() > self.ndim() {
            return Err(TypeError::TooManyIndices {
                ndim: self.ndim(),
                given: entries.len(),
            });
        }

        let mut byte_shape = self.shape.clone();
        byte_shape.push(self.dtype.itemsize());
        let view = ArrayViewD::from_shape(IxDyn(&byte_shape), &self.data).map_err(|_| {
            TypeError::ShapeMismatch {
                shape: self.shape.clone(),
                expected: byte_shape.iter().product(),
                actual: self.data.len(),
            }
        })?;

        let mut selected: ArrayD<u8> = view.to_owned();
        for (axis, entry) in entries.iter().enumerate() {
            let positions = entry.positions(axis, self.shape[axis])?;
            selected = selected.select(Axis(axis), &positions);
        }
        for (axis, entry) in entries.iter().enumerate().rev() {
            if entry.is_int() {
                selected = selected.index_axis_move(Axis(axis), 0);
            }
        }

        let mut shape = selected.shape().to_vec();
        shape.pop();
        Ok(NdArray {
            dtype: self.dtype,
            shape,
            data: selected.iter().copied().collect(),
        })
    }
}

fn collect_json(
    value: &Value,
    depth: usize,
    shape: &mut Vec<usize>,
    leaf_depth: &mut Option<usize>,
    out: &mut Vec<Scalar>,
) -> TypeResult<()> {
    let scalar = match value {
        Value::Array(items) => {
            if shape.len() == depth {
                if leaf_depth.is_some_and(|d| d <= depth) {
                    return Err(TypeError::Ragged("list where a scalar was expected".into()));
                }
                shape.push(items.len());
            } else if shape[depth] != items.len() {
                return Err(TypeError::Ragged(format!(
                    "axis {depth} has lengths {} and {}",
                    shape[depth],
                    items.len()
                )));
            }
            for item in items {
                collect_json(item, depth + 1, shape, leaf_depth, out)?;
            }
            return Ok(());
        }
        Value::Bool(b) => Scalar::Bool(*b),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Scalar::Int(v as i128)
            } else if let Some(v) = n.as_u64() {
                Scalar::Int(v as i128)
            } else {
                Scalar::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        other => return Err(TypeError::UnsupportedValue(other.to_string())),
    };
    match *leaf_depth {
        Some(d) if d != depth => {
            return Err(TypeError::Ragged(format!(
                "scalars at depths {d} and {depth}"
            )))
        }
        _ => *leaf_depth = Some(depth),
    }
    out.push(scalar);
    Ok(())
}

fn infer_dtype(scalars: &[Scalar]) -> DType {
    if scalars.iter().any(|s| matches!(s, Scalar::Float(_))) {
        DType::F64
    } else if !scalars.is_empty() && scalars.iter().all(|s| matches!(s, Scalar::Bool(_))) {
        DType::Bool
    } else if scalars.iter().any(|s| s.as_i128() > i64::MAX as i128) {
        DType::U64
    } else {
        DType::I64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn arange(shape: Vec<usize>) -> NdArray {
        let n: usize = shape.iter().product();
        NdArray::from_vec(shape, (0..n as i32).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn from_bytes_checks_length() {
        let err = NdArray::from_bytes(DType::U16, vec![2, 2], vec![0; 7]).unwrap_err();
        assert!(matches!(err, TypeError::ShapeMismatch { expected: 8, actual: 7, .. }));
    }

    #[test]
    fn filled_and_to_vec() {
        let a = NdArray::filled(vec![2, 3], 1u8);
        assert_eq!(a.nbytes(), 6);
        assert_eq!(a.to_vec::<u8>().unwrap(), vec![1; 6]);
        assert!(a.to_vec::<i32>().is_err());
    }

    #[test]
    fn slice_keeps_and_collapses_axes() {
        let a = arange(vec![3, 4]);
        let row = a.slice(&[IndexEntry::Int(1)]).unwrap();
        assert_eq!(row.shape(), &[4]);
        assert_eq!(row.to_vec::<i32>().unwrap(), vec![4, 5, 6, 7]);

        let cols = a.slice(&[IndexEntry::all(), IndexEntry::range(1, 3)]).unwrap();
        assert_eq!(cols.shape(), &[3, 2]);
        assert_eq!(cols.to_vec::<i32>().unwrap(), vec![1, 2, 5, 6, 9, 10]);
    }

    #[test]
    fn slice_negative_step_reverses() {
        let a = arange(vec![4]);
        let rev = a
            .slice(&[IndexEntry::Slice {
                start: None,
                stop: None,
                step: Some(-1),
            }])
            .unwrap();
        assert_eq!(rev.to_vec::<i32>().unwrap(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn slice_errors() {
        let a = arange(vec![2, 2]);
        assert!(matches!(
            a.slice(&[IndexEntry::Int(0), IndexEntry::Int(0), IndexEntry::Int(0)]),
            Err(TypeError::TooManyIndices { ndim: 2, given: 3 })
        ));
        assert!(matches!(
            a.slice(&[IndexEntry::Int(5)]),
            Err(TypeError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn json_ints_downcast_to_u8() {
        let value = json!([[1, 1], [1, 1]]);
        let a = NdArray::from_json(&value, Some(DType::U8)).unwrap();
        assert_eq!(a.dtype(), DType::U8);
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(a, NdArray::filled(vec![2, 2], 1u8));
    }

    #[test]
    fn json_out_of_range_rejected() {
        let err = NdArray::from_json(&json!([1, 300]), Some(DType::U8)).unwrap_err();
        assert!(matches!(err, TypeError::UnsafeCast { .. }));
    }

    #[test]
    fn json_infers_dtype() {
        assert_eq!(NdArray::from_json(&json!([1, 2]), None).unwrap().dtype(), DType::I64);
        assert_eq!(NdArray::from_json(&json!([1, 2.5]), None).unwrap().dtype(), DType::F64);
        assert_eq!(NdArray::from_json(&json!([true]), None).unwrap().dtype(), DType::Bool);
    }

    #[test]
    fn json_ragged_rejected() {
        assert!(matches!(
            NdArray::from_json(&json!([[1, 2], [3]]), None),
            Err(TypeError::Ragged(_))
        ));
        assert!(matches!(
            NdArray::from_json(&json!([1, [2]]), None),
            Err(TypeError::Ragged(_))
        ));
    }

    #[test]
    fn safe_cast_reports_source_dtype() {
        let a = NdArray::from_vec(vec![2], vec![1.5f64, 2.0]).unwrap();
        match a.safe_cast(DType::U8).unwrap_err() {
            TypeError::UnsafeCast { from, to, .. } => {
                assert_eq!(from, "float64");
                assert_eq!(to, "uint8");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(a.cast(DType::U8).to_vec::<u8>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn squeeze_axis() {
        let mut a = NdArray::zeros(DType::U8, vec![1, 3]);
        a.squeeze_axis(0).unwrap();
        assert_eq!(a.shape(), &[3]);
        assert!(a.squeeze_axis(0).is_err());
    }

    proptest! {
        #[test]
        fn safe_cast_roundtrips_small_ints(values in proptest::collection::vec(0i64..256, 0..64)) {
            let n = values.len();
            let a = NdArray::from_vec(vec![n], values.clone()).unwrap();
            let down = a.safe_cast(DType::U8).unwrap();
            let up = down.safe_cast(DType::I64).unwrap();
            prop_assert_eq!(up.to_vec::<i64>().unwrap(), values);
        }
    }
}
