//! Element types supported by kestrel tensors.
use crate::tensor::litteral::tensor0;
use crate::tensor::Tensor;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Affine quantization parameters: `real = scale * (q - zero_point)`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct QParams {
    pub zero_point: i32,
    pub scale: f32,
}

impl Eq for QParams {}

#[allow(clippy::derived_hash_with_manual_eq)]
impl Hash for QParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.zero_point.hash(state);
        self.scale.to_bits().hash(state);
    }
}

impl Default for QParams {
    fn default() -> QParams {
        QParams { zero_point: 0, scale: 1.0 }
    }
}

impl QParams {
    pub fn new(zero_point: i32, scale: f32) -> QParams {
        QParams { zero_point, scale }
    }

    /// Pick parameters so that `[min, max]` (extended to contain 0) spans the
    /// whole range of the storage type `T`.
    pub fn from_min_max<T: QuantizedDatum>(min: f32, max: f32) -> QParams {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let range = (T::QMAX - T::QMIN) as f32;
        let scale = if max > min { (max - min) / range } else { 1.0 };
        let zero_point = (T::QMIN as f32 - min / scale).round() as i32;
        QParams { zero_point: zero_point.clamp(T::QMIN, T::QMAX), scale }
    }

    #[inline]
    pub fn dequantize(&self, q: i32) -> f32 {
        self.scale * (q - self.zero_point) as f32
    }

    /// Quantize a real value, rounding to nearest (ties away from zero) and
    /// saturating to the storage range.
    #[inline]
    pub fn quantize<T: QuantizedDatum>(&self, x: f32) -> T {
        let q = (x / self.scale).round() as i32 + self.zero_point;
        T::saturate(q)
    }
}

impl fmt::Display for QParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Z:{} S:{}", self.zero_point, self.scale)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DatumType {
    Bool,
    U8,
    I8,
    I32,
    F32,
    QU8(QParams),
    QI8(QParams),
}

/// DatumType stripped of its quantization parameters.
///
/// This is what kernels are registered against: a quantized kernel handles
/// any scale and zero point.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatumKind {
    Bool,
    U8,
    I8,
    I32,
    F32,
    QU8,
    QI8,
}

impl fmt::Display for DatumKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DatumKind::Bool => "bool",
            DatumKind::U8 => "u8",
            DatumKind::I8 => "i8",
            DatumKind::I32 => "i32",
            DatumKind::F32 => "f32",
            DatumKind::QU8 => "qu8",
            DatumKind::QI8 => "qi8",
        };
        write!(f, "{s}")
    }
}

impl DatumType {
    pub fn kind(&self) -> DatumKind {
        match self {
            DatumType::Bool => DatumKind::Bool,
            DatumType::U8 => DatumKind::U8,
            DatumType::I8 => DatumKind::I8,
            DatumType::I32 => DatumKind::I32,
            DatumType::F32 => DatumKind::F32,
            DatumType::QU8(_) => DatumKind::QU8,
            DatumType::QI8(_) => DatumKind::QI8,
        }
    }

    /// Storage type of a quantized type, identity otherwise.
    pub fn unquantized(&self) -> DatumType {
        match self {
            DatumType::QU8(_) => DatumType::U8,
            DatumType::QI8(_) => DatumType::I8,
            _ => *self,
        }
    }

    pub fn quantize(&self, qp: QParams) -> anyhow::Result<DatumType> {
        match self.unquantized() {
            DatumType::U8 => Ok(DatumType::QU8(qp)),
            DatumType::I8 => Ok(DatumType::QI8(qp)),
            _ => anyhow::bail!("{:?} can not be quantized", self),
        }
    }

    pub fn qparams(&self) -> Option<QParams> {
        match self {
            DatumType::QU8(qp) | DatumType::QI8(qp) => Some(*qp),
            _ => None,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.qparams().is_some()
    }

    pub fn is_float(&self) -> bool {
        *self == DatumType::F32
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, DatumType::I8 | DatumType::I32 | DatumType::QI8(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DatumType::U8 | DatumType::I8 | DatumType::I32)
    }

    #[inline]
    pub fn size_of(&self) -> usize {
        dispatch_copy!(std::mem::size_of(self)())
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.size_of()
    }
}

impl std::str::FromStr for DatumType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bool" | "bool" => Ok(DatumType::Bool),
            "U8" | "u8" => Ok(DatumType::U8),
            "I8" | "i8" => Ok(DatumType::I8),
            "I32" | "i32" => Ok(DatumType::I32),
            "F32" | "f32" => Ok(DatumType::F32),
            _ => anyhow::bail!("Unknown type {}", s),
        }
    }
}

pub trait Datum:
    Copy + Send + Sync + fmt::Debug + fmt::Display + Default + 'static + PartialEq
{
    fn name() -> &'static str;
    fn datum_type() -> DatumType;
}

macro_rules! datum {
    ($t:ty, $v:ident) => {
        impl From<$t> for Tensor {
            fn from(it: $t) -> Tensor {
                tensor0(it)
            }
        }

        impl Datum for $t {
            fn name() -> &'static str {
                stringify!($t)
            }

            fn datum_type() -> DatumType {
                DatumType::$v
            }
        }
    };
}

datum!(bool, Bool);
datum!(u8, U8);
datum!(i8, I8);
datum!(i32, I32);
datum!(f32, F32);

/// Storage types of the 8-bit quantized datum types.
pub trait QuantizedDatum: Datum + Into<i32> {
    const QMIN: i32;
    const QMAX: i32;

    fn saturate(v: i32) -> Self;

    fn quantized_type(qp: QParams) -> DatumType;
}

impl QuantizedDatum for u8 {
    const QMIN: i32 = u8::MIN as i32;
    const QMAX: i32 = u8::MAX as i32;

    #[inline]
    fn saturate(v: i32) -> u8 {
        v.clamp(Self::QMIN, Self::QMAX) as u8
    }

    fn quantized_type(qp: QParams) -> DatumType {
        DatumType::QU8(qp)
    }
}

impl QuantizedDatum for i8 {
    const QMIN: i32 = i8::MIN as i32;
    const QMAX: i32 = i8::MAX as i32;

    #[inline]
    fn saturate(v: i32) -> i8 {
        v.clamp(Self::QMIN, Self::QMAX) as i8
    }

    fn quantized_type(qp: QParams) -> DatumType {
        DatumType::QI8(qp)
    }
}
