//! Range quantization for integers and reals.
//!
//! A quantized value is transmitted as an unsigned index into the inclusive
//! range `[min, max]` stepped by `step`, using exactly
//! `ceil(log2((max - min) / step + 1))` bits. Values outside the range are
//! clamped with a warning rather than corrupting the stream.

use crate::stream::{BitStream, BitStreamError};

/// Default quantization step for integer values.
pub const DEFAULT_INTEGER_STEP: u64 = 1;

/// Default quantization step for real values.
pub const DEFAULT_REAL_STEP: f64 = 1.0e-4;

/// Bits required to represent `count` distinct values.
pub fn bits_for_value_count(count: u64) -> u32 {
    if count <= 1 {
        0
    } else {
        64 - (count - 1).leading_zeros()
    }
}

/// Inclusive quantization range over reals, applied per component for
/// aggregate types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationRange {
    /// Lowest representable value.
    pub min: f64,
    /// Highest representable value.
    pub max: f64,
    /// Distance between adjacent representable values.
    pub step: f64,
}

impl QuantizationRange {
    /// Builds a range, defaulting `step` to [`DEFAULT_REAL_STEP`] when given
    /// a non-positive step.
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        debug_assert!(min <= max);
        let step = if step > 0.0 { step } else { DEFAULT_REAL_STEP };
        Self { min, max, step }
    }

    /// Number of representable values in the range.
    pub fn value_count(&self) -> u64 {
        ((self.max - self.min) / self.step).round() as u64 + 1
    }

    /// Bits one quantized value occupies on the wire.
    pub fn bits(&self) -> u32 {
        bits_for_value_count(self.value_count())
    }

    /// Snaps `value` onto the nearest representable value, clamping into
    /// `[min, max]`.
    pub fn snap(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        let index = ((clamped - self.min) / self.step).round();
        (self.min + index * self.step).clamp(self.min, self.max)
    }
}

impl BitStream {
    /// Appends a real quantized into `range`. Out-of-range values clamp with
    /// a warning. Returns the bits written (`range.bits()`).
    pub fn write_quantized_f64(&mut self, value: f64, range: &QuantizationRange) -> u32 {
        if value < range.min || value > range.max {
            tracing::warn!(
                value,
                min = range.min,
                max = range.max,
                "quantized write out of range, clamping"
            );
        }
        let clamped = value.clamp(range.min, range.max);
        let index = ((clamped - range.min) / range.step).round() as u64;
        let index = index.min(range.value_count() - 1);
        self.write_bits(index, range.bits())
    }

    /// Reads a real quantized into `range`.
    pub fn read_quantized_f64(&mut self, range: &QuantizationRange) -> Result<f64, BitStreamError> {
        let index = self.read_bits(range.bits())?;
        Ok((range.min + index as f64 * range.step).clamp(range.min, range.max))
    }

    /// Appends an `f32` quantized into `range`.
    pub fn write_quantized_f32(&mut self, value: f32, range: &QuantizationRange) -> u32 {
        self.write_quantized_f64(value as f64, range)
    }

    /// Reads an `f32` quantized into `range`.
    pub fn read_quantized_f32(&mut self, range: &QuantizationRange) -> Result<f32, BitStreamError> {
        Ok(self.read_quantized_f64(range)? as f32)
    }

    /// Appends an integer quantized into `[min, max]` with the given step.
    /// Out-of-range values clamp with a warning.
    pub fn write_quantized_i64(&mut self, value: i64, min: i64, max: i64, step: u64) -> u32 {
        debug_assert!(min <= max);
        let step = step.max(DEFAULT_INTEGER_STEP);
        if value < min || value > max {
            tracing::warn!(value, min, max, "quantized write out of range, clamping");
        }
        let clamped = value.clamp(min, max);
        let count = (max - min) as u64 / step + 1;
        let index = ((clamped - min) as u64 / step).min(count - 1);
        self.write_bits(index, bits_for_value_count(count))
    }

    /// Reads an integer quantized into `[min, max]` with the given step.
    pub fn read_quantized_i64(
        &mut self,
        min: i64,
        max: i64,
        step: u64,
    ) -> Result<i64, BitStreamError> {
        let step = step.max(DEFAULT_INTEGER_STEP);
        let count = (max - min) as u64 / step + 1;
        let index = self.read_bits(bits_for_value_count(count))?;
        Ok((min + (index * step) as i64).min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_for_value_count() {
        assert_eq!(bits_for_value_count(1), 0);
        assert_eq!(bits_for_value_count(2), 1);
        assert_eq!(bits_for_value_count(16), 4);
        assert_eq!(bits_for_value_count(17), 5);
        // The documented Real3 scenario: 20001 representable values per axis.
        assert_eq!(bits_for_value_count(20001), 15);
    }

    #[test]
    fn test_real_roundtrip_within_step() {
        let range = QuantizationRange::new(-10.0, 10.0, 0.001);
        assert_eq!(range.bits(), 15);
        for v in [1.25f64, -0.5, 3.141, -10.0, 10.0, 0.0] {
            let mut s = BitStream::new();
            assert_eq!(s.write_quantized_f64(v, &range), 15);
            let back = s.read_quantized_f64(&range).unwrap();
            assert!((back - v).abs() <= 0.001, "{v} came back as {back}");
        }
    }

    #[test]
    fn test_out_of_range_clamps() {
        let range = QuantizationRange::new(0.0, 1.0, 0.25);
        let mut s = BitStream::new();
        s.write_quantized_f64(7.5, &range);
        assert_eq!(s.read_quantized_f64(&range).unwrap(), 1.0);

        let mut s = BitStream::new();
        s.write_quantized_f64(-7.5, &range);
        assert_eq!(s.read_quantized_f64(&range).unwrap(), 0.0);
    }

    #[test]
    fn test_integer_roundtrip() {
        let mut s = BitStream::new();
        assert_eq!(s.write_quantized_i64(37, 0, 100, 1), 7);
        assert_eq!(s.read_quantized_i64(0, 100, 1).unwrap(), 37);

        let mut s = BitStream::new();
        s.write_quantized_i64(-3, -8, 7, 1);
        assert_eq!(s.read_quantized_i64(-8, 7, 1).unwrap(), -3);
    }

    #[test]
    fn test_integer_step_snaps_down() {
        let mut s = BitStream::new();
        // Step 5 over [0, 100]: 21 values, 5 bits.
        assert_eq!(s.write_quantized_i64(52, 0, 100, 5), 5);
        assert_eq!(s.read_quantized_i64(0, 100, 5).unwrap(), 50);
    }

    #[test]
    fn test_snap_matches_wire_value() {
        let range = QuantizationRange::new(-1.0, 1.0, 0.125);
        for v in [-0.99f64, -0.3, 0.0, 0.49, 0.9999] {
            let mut s = BitStream::new();
            s.write_quantized_f64(v, &range);
            assert_eq!(s.read_quantized_f64(&range).unwrap(), range.snap(v));
        }
    }

    #[test]
    fn test_degenerate_single_value_range_uses_zero_bits() {
        let range = QuantizationRange::new(5.0, 5.0, 1.0);
        assert_eq!(range.bits(), 0);
        let mut s = BitStream::new();
        assert_eq!(s.write_quantized_f64(5.0, &range), 0);
        assert_eq!(s.read_quantized_f64(&range).unwrap(), 5.0);
    }
}
