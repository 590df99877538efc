//! The tagged value codec.
//!
//! Replicated property values and event payload fields travel as a
//! [`NetValue`]: one of a closed set of basic types. The tagged form writes
//! the [`BasicNetType`] discriminant quantized to the enum's bit width,
//! followed by the payload; the untagged form writes the payload alone when
//! both sides already agree on the type.
//!
//! Numeric payloads optionally quantize into a [`QuantizationRange`], applied
//! per component for vector and quaternion values.

use glam::{Quat, Vec2, Vec3, Vec4};

use crate::quantize::{QuantizationRange, bits_for_value_count};
use crate::stream::{BitStream, BitStreamError};

/// Wire discriminant for a [`NetValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BasicNetType {
    /// One bit.
    Boolean = 0,
    /// Signed 32-bit integer.
    Integer = 1,
    /// Signed 64-bit integer.
    DoubleInteger = 2,
    /// Two signed 32-bit integers.
    Integer2 = 3,
    /// Three signed 32-bit integers.
    Integer3 = 4,
    /// Four signed 32-bit integers.
    Integer4 = 5,
    /// 32-bit float.
    Real = 6,
    /// 64-bit float.
    DoubleReal = 7,
    /// Two 32-bit floats.
    Real2 = 8,
    /// Three 32-bit floats.
    Real3 = 9,
    /// Four 32-bit floats.
    Real4 = 10,
    /// Unit rotation, four 32-bit floats.
    Quaternion = 11,
    /// Length-prefixed UTF-8.
    String = 12,
}

/// Number of [`BasicNetType`] discriminants.
const BASIC_NET_TYPE_COUNT: u64 = 13;

impl BasicNetType {
    /// Bits the tag occupies on the wire.
    pub fn tag_bits() -> u32 {
        bits_for_value_count(BASIC_NET_TYPE_COUNT)
    }

    /// Decodes a wire discriminant.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Boolean,
            1 => Self::Integer,
            2 => Self::DoubleInteger,
            3 => Self::Integer2,
            4 => Self::Integer3,
            5 => Self::Integer4,
            6 => Self::Real,
            7 => Self::DoubleReal,
            8 => Self::Real2,
            9 => Self::Real3,
            10 => Self::Real4,
            11 => Self::Quaternion,
            12 => Self::String,
            _ => return None,
        })
    }
}

/// Errors from the tagged value codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetValueError {
    /// The tag did not name a known basic type.
    #[error("unknown basic net type tag {0}")]
    UnknownTag(u8),

    /// The underlying stream ran out of bits or held invalid data.
    #[error(transparent)]
    Stream(#[from] BitStreamError),
}

/// A value of one of the replicable basic types.
#[derive(Debug, Clone, PartialEq)]
pub enum NetValue {
    Boolean(bool),
    Integer(i32),
    DoubleInteger(i64),
    Integer2([i32; 2]),
    Integer3([i32; 3]),
    Integer4([i32; 4]),
    Real(f32),
    DoubleReal(f64),
    Real2(Vec2),
    Real3(Vec3),
    Real4(Vec4),
    Quaternion(Quat),
    String(String),
}

impl NetValue {
    /// The wire discriminant for this value.
    pub fn basic_type(&self) -> BasicNetType {
        match self {
            Self::Boolean(_) => BasicNetType::Boolean,
            Self::Integer(_) => BasicNetType::Integer,
            Self::DoubleInteger(_) => BasicNetType::DoubleInteger,
            Self::Integer2(_) => BasicNetType::Integer2,
            Self::Integer3(_) => BasicNetType::Integer3,
            Self::Integer4(_) => BasicNetType::Integer4,
            Self::Real(_) => BasicNetType::Real,
            Self::DoubleReal(_) => BasicNetType::DoubleReal,
            Self::Real2(_) => BasicNetType::Real2,
            Self::Real3(_) => BasicNetType::Real3,
            Self::Real4(_) => BasicNetType::Real4,
            Self::Quaternion(_) => BasicNetType::Quaternion,
            Self::String(_) => BasicNetType::String,
        }
    }

    /// Writes the payload (no tag). With a range, numeric components are
    /// quantized; booleans and strings ignore the range. Returns bits
    /// written.
    pub fn write_payload(
        &self,
        stream: &mut BitStream,
        quantize: Option<&QuantizationRange>,
    ) -> u32 {
        match self {
            Self::Boolean(v) => stream.write_bool(*v),
            Self::Integer(v) => write_scalar_i64(stream, *v as i64, quantize),
            Self::DoubleInteger(v) => write_scalar_i64(stream, *v, quantize),
            Self::Integer2(v) => v
                .iter()
                .map(|&c| write_scalar_i64(stream, c as i64, quantize))
                .sum(),
            Self::Integer3(v) => v
                .iter()
                .map(|&c| write_scalar_i64(stream, c as i64, quantize))
                .sum(),
            Self::Integer4(v) => v
                .iter()
                .map(|&c| write_scalar_i64(stream, c as i64, quantize))
                .sum(),
            Self::Real(v) => write_scalar_f32(stream, *v, quantize),
            Self::DoubleReal(v) => match quantize {
                Some(range) => stream.write_quantized_f64(*v, range),
                None => stream.write_f64(*v),
            },
            Self::Real2(v) => v
                .to_array()
                .iter()
                .map(|&c| write_scalar_f32(stream, c, quantize))
                .sum(),
            Self::Real3(v) => v
                .to_array()
                .iter()
                .map(|&c| write_scalar_f32(stream, c, quantize))
                .sum(),
            Self::Real4(v) => v
                .to_array()
                .iter()
                .map(|&c| write_scalar_f32(stream, c, quantize))
                .sum(),
            Self::Quaternion(v) => v
                .to_array()
                .iter()
                .map(|&c| write_scalar_f32(stream, c, quantize))
                .sum(),
            Self::String(v) => stream.write_string(v),
        }
    }

    /// Reads a payload of the given type (no tag).
    pub fn read_payload(
        ty: BasicNetType,
        stream: &mut BitStream,
        quantize: Option<&QuantizationRange>,
    ) -> Result<Self, NetValueError> {
        Ok(match ty {
            BasicNetType::Boolean => Self::Boolean(stream.read_bool()?),
            BasicNetType::Integer => Self::Integer(read_scalar_i64(stream, quantize)? as i32),
            BasicNetType::DoubleInteger => Self::DoubleInteger(read_scalar_i64(stream, quantize)?),
            BasicNetType::Integer2 => Self::Integer2([
                read_scalar_i64(stream, quantize)? as i32,
                read_scalar_i64(stream, quantize)? as i32,
            ]),
            BasicNetType::Integer3 => Self::Integer3([
                read_scalar_i64(stream, quantize)? as i32,
                read_scalar_i64(stream, quantize)? as i32,
                read_scalar_i64(stream, quantize)? as i32,
            ]),
            BasicNetType::Integer4 => Self::Integer4([
                read_scalar_i64(stream, quantize)? as i32,
                read_scalar_i64(stream, quantize)? as i32,
                read_scalar_i64(stream, quantize)? as i32,
                read_scalar_i64(stream, quantize)? as i32,
            ]),
            BasicNetType::Real => Self::Real(read_scalar_f32(stream, quantize)?),
            BasicNetType::DoubleReal => Self::DoubleReal(match quantize {
                Some(range) => stream.read_quantized_f64(range)?,
                None => stream.read_f64()?,
            }),
            BasicNetType::Real2 => Self::Real2(Vec2::new(
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
            )),
            BasicNetType::Real3 => Self::Real3(Vec3::new(
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
            )),
            BasicNetType::Real4 => Self::Real4(Vec4::new(
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
            )),
            BasicNetType::Quaternion => Self::Quaternion(Quat::from_xyzw(
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
                read_scalar_f32(stream, quantize)?,
            )),
            BasicNetType::String => Self::String(stream.read_string()?),
        })
    }

    /// Writes the tag followed by the payload. Returns bits written.
    pub fn write_tagged(
        &self,
        stream: &mut BitStream,
        quantize: Option<&QuantizationRange>,
    ) -> u32 {
        let written = stream.write_bits(self.basic_type() as u8 as u64, BasicNetType::tag_bits());
        written + self.write_payload(stream, quantize)
    }

    /// Reads a tag and its payload.
    pub fn read_tagged(
        stream: &mut BitStream,
        quantize: Option<&QuantizationRange>,
    ) -> Result<Self, NetValueError> {
        let tag = stream.read_bits(BasicNetType::tag_bits())? as u8;
        let ty = BasicNetType::from_tag(tag).ok_or(NetValueError::UnknownTag(tag))?;
        Self::read_payload(ty, stream, quantize)
    }

    /// Bits the payload occupies (excluding the tag), matching
    /// [`write_payload`].
    ///
    /// [`write_payload`]: NetValue::write_payload
    pub fn payload_bits(&self, quantize: Option<&QuantizationRange>) -> u32 {
        let scalar_f = quantize.map_or(32, QuantizationRange::bits);
        let scalar_i = quantize.map_or(64, QuantizationRange::bits);
        match self {
            Self::Boolean(_) => 1,
            Self::Integer(_) | Self::DoubleInteger(_) => scalar_i,
            Self::Integer2(_) => scalar_i * 2,
            Self::Integer3(_) => scalar_i * 3,
            Self::Integer4(_) => scalar_i * 4,
            Self::Real(_) => scalar_f,
            Self::DoubleReal(_) => quantize.map_or(64, QuantizationRange::bits),
            Self::Real2(_) => scalar_f * 2,
            Self::Real3(_) => scalar_f * 3,
            Self::Real4(_) | Self::Quaternion(_) => scalar_f * 4,
            Self::String(v) => BitStream::measure_string(v),
        }
    }

    /// Snaps every numeric component onto the range's representable values.
    /// Identity for booleans and strings, and when no range is given.
    pub fn snapped(&self, quantize: Option<&QuantizationRange>) -> Self {
        let Some(range) = quantize else {
            return self.clone();
        };
        let snap_f = |c: f32| range.snap(c as f64) as f32;
        let snap_i = |c: i64| range.snap(c as f64).round() as i64;
        match self {
            Self::Boolean(_) | Self::String(_) => self.clone(),
            Self::Integer(v) => Self::Integer(snap_i(*v as i64) as i32),
            Self::DoubleInteger(v) => Self::DoubleInteger(snap_i(*v)),
            Self::Integer2(v) => Self::Integer2(v.map(|c| snap_i(c as i64) as i32)),
            Self::Integer3(v) => Self::Integer3(v.map(|c| snap_i(c as i64) as i32)),
            Self::Integer4(v) => Self::Integer4(v.map(|c| snap_i(c as i64) as i32)),
            Self::Real(v) => Self::Real(snap_f(*v)),
            Self::DoubleReal(v) => Self::DoubleReal(range.snap(*v)),
            Self::Real2(v) => Self::Real2(Vec2::from_array(v.to_array().map(snap_f))),
            Self::Real3(v) => Self::Real3(Vec3::from_array(v.to_array().map(snap_f))),
            Self::Real4(v) => Self::Real4(Vec4::from_array(v.to_array().map(snap_f))),
            Self::Quaternion(v) => Self::Quaternion(Quat::from_array(v.to_array().map(snap_f))),
        }
    }
}

/// Writes an integer scalar, quantized when a range is present.
fn write_scalar_i64(stream: &mut BitStream, value: i64, quantize: Option<&QuantizationRange>) -> u32 {
    match quantize {
        Some(range) => stream.write_quantized_f64(value as f64, range),
        None => stream.write_i64(value),
    }
}

fn read_scalar_i64(
    stream: &mut BitStream,
    quantize: Option<&QuantizationRange>,
) -> Result<i64, BitStreamError> {
    match quantize {
        Some(range) => Ok(stream.read_quantized_f64(range)?.round() as i64),
        None => stream.read_i64(),
    }
}

fn write_scalar_f32(stream: &mut BitStream, value: f32, quantize: Option<&QuantizationRange>) -> u32 {
    match quantize {
        Some(range) => stream.write_quantized_f32(value, range),
        None => stream.write_f32(value),
    }
}

fn read_scalar_f32(
    stream: &mut BitStream,
    quantize: Option<&QuantizationRange>,
) -> Result<f32, BitStreamError> {
    match quantize {
        Some(range) => stream.read_quantized_f32(range),
        None => stream.read_f32(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_sample_values() -> Vec<NetValue> {
        vec![
            NetValue::Boolean(true),
            NetValue::Integer(-42),
            NetValue::DoubleInteger(1 << 40),
            NetValue::Integer2([3, -7]),
            NetValue::Integer3([1, 2, 3]),
            NetValue::Integer4([-1, 0, 1, 2]),
            NetValue::Real(2.5),
            NetValue::DoubleReal(-123.456),
            NetValue::Real2(Vec2::new(0.5, -0.5)),
            NetValue::Real3(Vec3::new(1.0, 2.0, 3.0)),
            NetValue::Real4(Vec4::new(1.0, 0.0, -1.0, 0.25)),
            NetValue::Quaternion(Quat::from_xyzw(0.0, 0.7071, 0.0, 0.7071)),
            NetValue::String("archetype:Player".to_string()),
        ]
    }

    #[test]
    fn test_tagged_roundtrip_all_types() {
        for value in all_sample_values() {
            let mut s = BitStream::new();
            let written = value.write_tagged(&mut s, None);
            assert_eq!(
                written,
                BasicNetType::tag_bits() + value.payload_bits(None),
                "measured size mismatch for {value:?}"
            );
            let back = NetValue::read_tagged(&mut s, None).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_untagged_roundtrip_needs_matching_type() {
        let value = NetValue::Real3(Vec3::new(9.0, -9.0, 0.125));
        let mut s = BitStream::new();
        value.write_payload(&mut s, None);
        let back = NetValue::read_payload(BasicNetType::Real3, &mut s, None).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_quantized_real3_scenario() {
        // write (1.25, -0.5, 3.141) with min -10, max 10, step 0.001:
        // 3 * ceil(log2(20001)) = 3 * 15 = 45 bits.
        let range = QuantizationRange::new(-10.0, 10.0, 0.001);
        let value = NetValue::Real3(Vec3::new(1.25, -0.5, 3.141));
        let mut s = BitStream::new();
        let written = value.write_payload(&mut s, Some(&range));
        assert_eq!(written, 45);
        assert_eq!(value.payload_bits(Some(&range)), 45);

        let NetValue::Real3(back) =
            NetValue::read_payload(BasicNetType::Real3, &mut s, Some(&range)).unwrap()
        else {
            panic!("wrong type back");
        };
        for (a, b) in back.to_array().iter().zip([1.25f32, -0.5, 3.141]) {
            assert!((a - b).abs() <= 0.001, "axis {b} came back {a}");
        }
    }

    #[test]
    fn test_quantized_integer_roundtrip() {
        let range = QuantizationRange::new(0.0, 255.0, 1.0);
        let value = NetValue::Integer(200);
        let mut s = BitStream::new();
        assert_eq!(value.write_payload(&mut s, Some(&range)), 8);
        assert_eq!(
            NetValue::read_payload(BasicNetType::Integer, &mut s, Some(&range)).unwrap(),
            NetValue::Integer(200)
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut s = BitStream::new();
        s.write_bits(15, BasicNetType::tag_bits());
        assert!(matches!(
            NetValue::read_tagged(&mut s, None),
            Err(NetValueError::UnknownTag(15))
        ));
    }

    #[test]
    fn test_snapped_matches_wire_roundtrip() {
        let range = QuantizationRange::new(-1.0, 1.0, 0.01);
        let value = NetValue::Real2(Vec2::new(0.123, -0.987));
        let mut s = BitStream::new();
        value.write_payload(&mut s, Some(&range));
        let back = NetValue::read_payload(BasicNetType::Real2, &mut s, Some(&range)).unwrap();
        assert_eq!(back, value.snapped(Some(&range)));
    }

    #[test]
    fn test_tag_width_is_four_bits() {
        assert_eq!(BasicNetType::tag_bits(), 4);
    }
}
