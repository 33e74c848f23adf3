//! Stack value and array descriptor types.
//!
//! Kind codes are stable: the assignment dispatch and the diagnostic
//! messages both identify values by these numbers, so they must not drift.

use crate::errors::{BResult, BasicError, ErrorKind};

/// Longest string the heap will hold.
pub const MAXSTRING: usize = 65536;

/// Scalar element kinds an array (or variable) can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Int32,
    Float,
    Str,
    Int64,
    Uint8,
}

impl ElementKind {
    /// Stack kind code of a scalar of this kind.
    pub fn scalar_code(self) -> u8 {
        match self {
            ElementKind::Int32 => 2,
            ElementKind::Float => 3,
            ElementKind::Str => 4,
            ElementKind::Int64 => 6,
            ElementKind::Uint8 => 7,
        }
    }

    /// Stack kind code of an array of this kind.
    pub fn array_code(self) -> u8 {
        match self {
            ElementKind::Int32 => 10,
            ElementKind::Float => 11,
            ElementKind::Str => 12,
            ElementKind::Int64 => 14,
            ElementKind::Uint8 => 15,
        }
    }
}

/// A string on the stack. `temp` marks ownership of a pending release:
/// a concatenation result the consumer must adopt or drop. `source` is the
/// variable slot the bytes were read from, when they came from one; the
/// self-assignment fast path compares it.
#[derive(Debug, Clone, PartialEq)]
pub struct BStr {
    pub bytes: Vec<u8>,
    pub temp: bool,
    pub source: Option<usize>,
}

impl BStr {
    pub fn temp(bytes: Vec<u8>) -> Self {
        BStr { bytes, temp: true, source: None }
    }

    pub fn borrowed(bytes: Vec<u8>, source: usize) -> Self {
        BStr { bytes, temp: false, source: Some(source) }
    }

    pub fn literal(bytes: Vec<u8>) -> Self {
        BStr { bytes, temp: false, source: None }
    }
}

/// Element storage of an array, one vector per element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Int32(Vec<i32>),
    Float(Vec<f64>),
    Str(Vec<Vec<u8>>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
}

impl ArrayData {
    pub fn kind(&self) -> ElementKind {
        match self {
            ArrayData::Int32(_) => ElementKind::Int32,
            ArrayData::Float(_) => ElementKind::Float,
            ArrayData::Str(_) => ElementKind::Str,
            ArrayData::Int64(_) => ElementKind::Int64,
            ArrayData::Uint8(_) => ElementKind::Uint8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int32(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Str(v) => v.len(),
            ArrayData::Int64(v) => v.len(),
            ArrayData::Uint8(v) => v.len(),
        }
    }

    pub fn zeroed(kind: ElementKind, count: usize) -> Self {
        match kind {
            ElementKind::Int32 => ArrayData::Int32(vec![0; count]),
            ElementKind::Float => ArrayData::Float(vec![0.0; count]),
            ElementKind::Str => ArrayData::Str(vec![Vec::new(); count]),
            ElementKind::Int64 => ArrayData::Int64(vec![0; count]),
            ElementKind::Uint8 => ArrayData::Uint8(vec![0; count]),
        }
    }
}

/// Array shape: per-dimension upper bounds (inclusive, zero-based as in the
/// dialect: `DIM a(3)` has four elements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayShape {
    pub bounds: Vec<usize>,
}

impl ArrayShape {
    pub fn new(bounds: Vec<usize>) -> Self {
        ArrayShape { bounds }
    }

    pub fn count(&self) -> usize {
        self.bounds.iter().map(|b| b + 1).product()
    }

    pub fn dims(&self) -> usize {
        self.bounds.len()
    }

    /// Row-major flat index of a full index list, checking each subscript.
    pub fn flatten(&self, indexes: &[usize]) -> BResult<usize> {
        if indexes.len() != self.bounds.len() {
            return Err(BasicError::new(ErrorKind::IndexCo));
        }
        let mut flat = 0usize;
        for (&ix, &bound) in indexes.iter().zip(self.bounds.iter()) {
            if ix > bound {
                return Err(BasicError::with_val(ErrorKind::BadIndex, ix as i64));
            }
            flat = flat * (bound + 1) + ix;
        }
        Ok(flat)
    }
}

/// An array temporary: the result of array arithmetic. Ownership of the
/// element storage transfers to whatever consumes the stack entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayTemp {
    pub shape: ArrayShape,
    pub data: ArrayData,
}

/// One entry of the evaluation stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Float(f64),
    Str(BStr),
    Int64(i64),
    Uint8(u8),
    /// A named array, identified by its variable slot.
    ArrayRef { slot: usize, kind: ElementKind },
    /// An owned array temporary.
    ArrayTemp(ArrayTemp),
}

impl Value {
    /// The stable kind code of this entry (temporaries are kind + 1).
    pub fn code(&self) -> u8 {
        match self {
            Value::Int32(_) => 2,
            Value::Float(_) => 3,
            Value::Str(s) if s.temp => 5,
            Value::Str(_) => 4,
            Value::Int64(_) => 6,
            Value::Uint8(_) => 7,
            Value::ArrayRef { kind, .. } => kind.array_code(),
            Value::ArrayTemp(t) => t.data.kind().array_code() + 1,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int32(_) | Value::Float(_) | Value::Int64(_) | Value::Uint8(_)
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::Str(_))
    }
}

/// Round half away from zero, the dialect's float-to-integer rule.
fn round_away(f: f64) -> f64 {
    if f >= 0.0 { (f + 0.5).floor() } else { (f - 0.5).ceil() }
}

/// `TOINT`: float to INT32, rounding half away from zero.
pub fn toint32(f: f64) -> BResult<i32> {
    let r = round_away(f);
    if r < i32::MIN as f64 || r > i32::MAX as f64 {
        return Err(BasicError::new(ErrorKind::Range));
    }
    Ok(r as i32)
}

/// `TOINT64`: float to INT64, rounding half away from zero.
pub fn toint64(f: f64) -> BResult<i64> {
    let r = round_away(f);
    if r < i64::MIN as f64 || r >= i64::MAX as f64 {
        return Err(BasicError::new(ErrorKind::Range));
    }
    Ok(r as i64)
}

/// INT64 to INT32 with the mandatory range check.
pub fn narrow64(v: i64) -> BResult<i32> {
    i32::try_from(v).map_err(|_| BasicError::new(ErrorKind::Range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(toint32(2.5).unwrap(), 3);
        assert_eq!(toint32(-2.5).unwrap(), -3);
        assert_eq!(toint32(2.4).unwrap(), 2);
        assert_eq!(toint32(-2.4).unwrap(), -2);
        assert_eq!(toint64(1e15 + 0.5).unwrap(), 1_000_000_000_000_001);
    }

    #[test]
    fn narrowing_checks_signed_32_bounds() {
        assert_eq!(narrow64(i32::MAX as i64).unwrap(), i32::MAX);
        assert_eq!(narrow64(i32::MIN as i64).unwrap(), i32::MIN);
        assert_eq!(
            narrow64(i32::MAX as i64 + 1).unwrap_err().kind,
            ErrorKind::Range
        );
        assert_eq!(narrow64(0xFFFF_FFFF_FFFF).unwrap_err().kind, ErrorKind::Range);
    }

    #[test]
    fn shape_flattening_checks_subscripts() {
        let shape = ArrayShape::new(vec![2, 3]);
        assert_eq!(shape.count(), 12);
        assert_eq!(shape.flatten(&[0, 0]).unwrap(), 0);
        assert_eq!(shape.flatten(&[1, 2]).unwrap(), 6);
        assert_eq!(shape.flatten(&[2, 3]).unwrap(), 11);
        assert_eq!(shape.flatten(&[3, 0]).unwrap_err().kind, ErrorKind::BadIndex);
        assert_eq!(shape.flatten(&[0]).unwrap_err().kind, ErrorKind::IndexCo);
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(Value::Int32(0).code(), 2);
        assert_eq!(Value::Float(0.0).code(), 3);
        assert_eq!(Value::Str(BStr::literal(vec![])).code(), 4);
        assert_eq!(Value::Str(BStr::temp(vec![])).code(), 5);
        assert_eq!(Value::Int64(0).code(), 6);
        assert_eq!(Value::Uint8(0).code(), 7);
        let temp = ArrayTemp {
            shape: ArrayShape::new(vec![1]),
            data: ArrayData::zeroed(ElementKind::Float, 2),
        };
        assert_eq!(Value::ArrayTemp(temp).code(), 12);
    }
}
