//! Bit-granular serialization: the buffer, quantization, half-floats, and the
//! tagged value codec every wire payload is built from.

pub mod half;
pub mod quantize;
pub mod stream;
pub mod value;

pub use half::{f32_to_half, half_to_f32};
pub use quantize::{
    DEFAULT_INTEGER_STEP, DEFAULT_REAL_STEP, QuantizationRange, bits_for_value_count,
};
pub use stream::{BitStream, BitStreamError};
pub use value::{BasicNetType, NetValue, NetValueError};
