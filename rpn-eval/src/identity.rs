//! Transport of record identity fields.
//!
//! Identity (`rec_id`, `im_id`) travels alongside the tensors of a batch. The
//! transport may be a float type when the identity is routed through the
//! network, in which case every value is checked against the exact-integer
//! range of that type.

use crate::common::*;

/// Values must stay strictly below this bound in f32 transport. `2^24` itself
/// is excluded because `2^24 + 1` rounds onto it.
pub const F32_EXACT_LIMIT: u64 = 1 << 24;

/// Values must stay strictly below this bound in f64 transport.
pub const F64_EXACT_LIMIT: u64 = 1 << 53;

/// The numeric representation of identity arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityTransport {
    Int64,
    Float32,
    Float64,
}

impl Default for IdentityTransport {
    fn default() -> Self {
        Self::Int64
    }
}

impl Display for IdentityTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        };
        write!(f, "{}", name)
    }
}

impl IdentityTransport {
    /// The exclusive upper bound of exactly representable identity values.
    pub fn exact_limit(&self) -> u64 {
        match self {
            Self::Int64 => i64::MAX as u64 + 1,
            Self::Float32 => F32_EXACT_LIMIT,
            Self::Float64 => F64_EXACT_LIMIT,
        }
    }

    pub fn encode(&self, field: &'static str, values: &[u64]) -> Result<IdentityArray> {
        let limit = self.exact_limit();
        if let Some(&value) = values.iter().find(|&&value| value >= limit) {
            return Err(Error::IdentityOverflow {
                field,
                value: value.to_string(),
                transport: *self,
            });
        }

        let array = match self {
            Self::Int64 => IdentityArray::Int64(values.iter().map(|&v| v as i64).collect()),
            Self::Float32 => IdentityArray::Float32(values.iter().map(|&v| v as f32).collect()),
            Self::Float64 => IdentityArray::Float64(values.iter().map(|&v| v as f64).collect()),
        };
        Ok(array)
    }
}

/// An array of identity values in one of the supported transports.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityArray {
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl IdentityArray {
    pub fn transport(&self) -> IdentityTransport {
        match self {
            Self::Int64(_) => IdentityTransport::Int64,
            Self::Float32(_) => IdentityTransport::Float32,
            Self::Float64(_) => IdentityTransport::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int64(values) => values.len(),
            Self::Float32(values) => values.len(),
            Self::Float64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reduce every element to an exact unsigned integer.
    ///
    /// Negative, fractional, non-finite or out-of-range values fail with
    /// [Error::IdentityOverflow] rather than being truncated.
    pub fn decode(&self, field: &'static str) -> Result<Vec<u64>> {
        let transport = self.transport();
        let limit = transport.exact_limit();
        let overflow = |value: String| Error::IdentityOverflow {
            field,
            value,
            transport,
        };

        match self {
            Self::Int64(values) => values
                .iter()
                .map(|&value| u64::try_from(value).map_err(|_| overflow(value.to_string())))
                .collect(),
            Self::Float32(values) => values
                .iter()
                .map(|&value| {
                    let value = value as f64;
                    float_to_exact(value, limit).ok_or_else(|| overflow(value.to_string()))
                })
                .collect(),
            Self::Float64(values) => values
                .iter()
                .map(|&value| float_to_exact(value, limit).ok_or_else(|| overflow(value.to_string())))
                .collect(),
        }
    }
}

fn float_to_exact(value: f64, limit: u64) -> Option<u64> {
    let exact = value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value < limit as f64;
    exact.then(|| value as u64)
}
