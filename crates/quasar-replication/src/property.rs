//! Replicated properties.
//!
//! A property is one leaf value bound to a named component field. The
//! authority samples the live value each detection interval; remotes apply
//! received values either instantly or by converging toward them over
//! subsequent ticks so replicated motion stays smooth.

use glam::{Quat, Vec2, Vec3, Vec4};

use quasar_bitstream::{BitStream, NetValue, NetValueError, QuantizationRange};

/// How a remote peer applies received values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceConfig {
    /// When false, received values apply instantly.
    pub enabled: bool,
    /// Lerp weight per tick while converging toward the newest value.
    pub active_weight: f32,
    /// Absolute error beyond which convergence snaps instead of lerping.
    pub snap_threshold: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            active_weight: 0.1,
            snap_threshold: 10.0,
        }
    }
}

/// Per-property replication settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyConfig {
    /// Quantization range applied per component on the wire.
    pub quantize: Option<QuantizationRange>,
    /// Differences at or below this do not count as a change.
    pub delta_threshold: f64,
    /// Remote-application smoothing.
    pub convergence: ConvergenceConfig,
}

/// One replicated leaf value.
#[derive(Debug, Clone)]
pub struct ReplicaProperty {
    /// Property name as registered with the reflection service.
    pub name: String,
    pub config: PropertyConfig,
    /// Current value: last sampled on the authority, newest received target
    /// on a remote.
    value: NetValue,
    /// Value as of the last emitted change frame.
    last_replicated: NetValue,
    /// Value the remote currently shows, trailing `value` while converging.
    applied: NetValue,
    /// Time of the last observed change.
    last_change_ms: u64,
}

impl ReplicaProperty {
    pub fn new(name: impl Into<String>, value: NetValue, config: PropertyConfig) -> Self {
        Self {
            name: name.into(),
            config,
            last_replicated: value.clone(),
            applied: value.clone(),
            value,
            last_change_ms: 0,
        }
    }

    /// Current value.
    pub fn value(&self) -> &NetValue {
        &self.value
    }

    /// Value the remote should currently display.
    pub fn applied(&self) -> &NetValue {
        &self.applied
    }

    /// Time of the last observed change.
    pub fn last_change_ms(&self) -> u64 {
        self.last_change_ms
    }

    /// Authority-side sample. Keeps the change timestamp current.
    pub fn set_value(&mut self, value: NetValue, now_ms: u64) {
        if !values_equal(&value, &self.value, 0.0) {
            self.last_change_ms = now_ms;
        }
        self.applied = value.clone();
        self.value = value;
    }

    /// True when the current value differs from the last replicated one by
    /// more than the delta threshold. Quantization snaps both sides first so
    /// sub-step jitter never counts as a change.
    pub fn has_changed(&self) -> bool {
        let quantize = self.config.quantize.as_ref();
        let current = self.value.snapped(quantize);
        let replicated = self.last_replicated.snapped(quantize);
        !values_equal(&current, &replicated, self.config.delta_threshold)
    }

    /// Records the current value as replicated.
    pub fn mark_replicated(&mut self) {
        self.last_replicated = self.value.clone();
    }

    /// Serializes the current value.
    pub fn write_value(&self, stream: &mut BitStream) -> u32 {
        self.value
            .write_payload(stream, self.config.quantize.as_ref())
    }

    /// Deserializes a received value and applies it as the new target.
    pub fn read_and_apply(
        &mut self,
        stream: &mut BitStream,
        now_ms: u64,
    ) -> Result<(), NetValueError> {
        let value = NetValue::read_payload(
            self.value.basic_type(),
            stream,
            self.config.quantize.as_ref(),
        )?;
        self.apply_remote(value, now_ms);
        Ok(())
    }

    /// Applies a received value: instantly, or as a convergence target.
    pub fn apply_remote(&mut self, value: NetValue, now_ms: u64) {
        self.last_change_ms = now_ms;
        self.last_replicated = value.clone();
        if !self.config.convergence.enabled || !is_convergeable(&value) {
            self.applied = value.clone();
        } else if component_distance(&self.applied, &value)
            > self.config.convergence.snap_threshold
        {
            self.applied = value.clone();
        }
        self.value = value;
    }

    /// One convergence tick: moves `applied` toward `value`. Returns true
    /// while still moving.
    pub fn converge_step(&mut self) -> bool {
        if !self.config.convergence.enabled || self.applied == self.value {
            return false;
        }
        let weight = self.config.convergence.active_weight;
        self.applied = match (&self.applied, &self.value) {
            (NetValue::Real(a), NetValue::Real(b)) => NetValue::Real(lerp_f32(*a, *b, weight)),
            (NetValue::DoubleReal(a), NetValue::DoubleReal(b)) => {
                NetValue::DoubleReal(lerp_f64(*a, *b, weight as f64))
            }
            (NetValue::Real2(a), NetValue::Real2(b)) => NetValue::Real2(a.lerp(*b, weight)),
            (NetValue::Real3(a), NetValue::Real3(b)) => NetValue::Real3(a.lerp(*b, weight)),
            (NetValue::Real4(a), NetValue::Real4(b)) => NetValue::Real4(a.lerp(*b, weight)),
            (NetValue::Quaternion(a), NetValue::Quaternion(b)) => {
                NetValue::Quaternion(a.slerp(*b, weight))
            }
            // Non-real types never converge; apply directly.
            _ => self.value.clone(),
        };
        // Close enough: finish.
        if component_distance(&self.applied, &self.value) <= convergence_epsilon(&self.value) {
            self.applied = self.value.clone();
            return false;
        }
        true
    }
}

fn lerp_f32(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

fn lerp_f64(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn is_convergeable(value: &NetValue) -> bool {
    matches!(
        value,
        NetValue::Real(_)
            | NetValue::DoubleReal(_)
            | NetValue::Real2(_)
            | NetValue::Real3(_)
            | NetValue::Real4(_)
            | NetValue::Quaternion(_)
    )
}

fn convergence_epsilon(value: &NetValue) -> f64 {
    match value {
        NetValue::DoubleReal(_) => 1.0e-6,
        _ => 1.0e-4,
    }
}

/// Largest per-component absolute difference, or infinity for mismatched or
/// non-numeric pairs.
fn component_distance(a: &NetValue, b: &NetValue) -> f64 {
    fn spread(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs() as f64)
            .fold(0.0, f64::max)
    }
    match (a, b) {
        (NetValue::Real(x), NetValue::Real(y)) => (x - y).abs() as f64,
        (NetValue::DoubleReal(x), NetValue::DoubleReal(y)) => (x - y).abs(),
        (NetValue::Real2(x), NetValue::Real2(y)) => spread(&x.to_array(), &y.to_array()),
        (NetValue::Real3(x), NetValue::Real3(y)) => spread(&x.to_array(), &y.to_array()),
        (NetValue::Real4(x), NetValue::Real4(y)) => spread(&x.to_array(), &y.to_array()),
        (NetValue::Quaternion(x), NetValue::Quaternion(y)) => {
            spread(&x.to_array(), &y.to_array())
        }
        (NetValue::Integer(x), NetValue::Integer(y)) => (*x as f64 - *y as f64).abs(),
        (NetValue::DoubleInteger(x), NetValue::DoubleInteger(y)) => (*x as f64 - *y as f64).abs(),
        _ => f64::INFINITY,
    }
}

/// Equality under a numeric delta threshold. Non-numeric types compare
/// exactly.
pub fn values_equal(a: &NetValue, b: &NetValue, delta_threshold: f64) -> bool {
    match (a, b) {
        (NetValue::Boolean(x), NetValue::Boolean(y)) => x == y,
        (NetValue::String(x), NetValue::String(y)) => x == y,
        (NetValue::Integer2(x), NetValue::Integer2(y)) => {
            ints_equal(&x[..], &y[..], delta_threshold)
        }
        (NetValue::Integer3(x), NetValue::Integer3(y)) => {
            ints_equal(&x[..], &y[..], delta_threshold)
        }
        (NetValue::Integer4(x), NetValue::Integer4(y)) => {
            ints_equal(&x[..], &y[..], delta_threshold)
        }
        _ => component_distance(a, b) <= delta_threshold,
    }
}

fn ints_equal(a: &[i32], b: &[i32], delta: f64) -> bool {
    a.iter()
        .zip(b)
        .all(|(x, y)| (*x as f64 - *y as f64).abs() <= delta)
}

/// Convenience constructors for default-valued [`NetValue`]s per type, used
/// when building properties before the first sample arrives.
pub fn default_value(ty: quasar_bitstream::BasicNetType) -> NetValue {
    use quasar_bitstream::BasicNetType as T;
    match ty {
        T::Boolean => NetValue::Boolean(false),
        T::Integer => NetValue::Integer(0),
        T::DoubleInteger => NetValue::DoubleInteger(0),
        T::Integer2 => NetValue::Integer2([0; 2]),
        T::Integer3 => NetValue::Integer3([0; 3]),
        T::Integer4 => NetValue::Integer4([0; 4]),
        T::Real => NetValue::Real(0.0),
        T::DoubleReal => NetValue::DoubleReal(0.0),
        T::Real2 => NetValue::Real2(Vec2::ZERO),
        T::Real3 => NetValue::Real3(Vec3::ZERO),
        T::Real4 => NetValue::Real4(Vec4::ZERO),
        T::Quaternion => NetValue::Quaternion(Quat::IDENTITY),
        T::String => NetValue::String(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_detection_exact() {
        let mut prop = ReplicaProperty::new(
            "Health",
            NetValue::Integer(100),
            PropertyConfig::default(),
        );
        assert!(!prop.has_changed());
        prop.set_value(NetValue::Integer(99), 10);
        assert!(prop.has_changed());
        prop.mark_replicated();
        assert!(!prop.has_changed());
    }

    #[test]
    fn test_delta_threshold_suppresses_jitter() {
        let config = PropertyConfig {
            delta_threshold: 0.05,
            ..Default::default()
        };
        let mut prop = ReplicaProperty::new("Heading", NetValue::Real(1.0), config);
        prop.set_value(NetValue::Real(1.01), 10);
        assert!(!prop.has_changed(), "within threshold");
        prop.set_value(NetValue::Real(1.2), 20);
        assert!(prop.has_changed(), "past threshold");
    }

    #[test]
    fn test_quantization_snap_before_compare() {
        let config = PropertyConfig {
            quantize: Some(QuantizationRange::new(0.0, 10.0, 0.5)),
            ..Default::default()
        };
        let mut prop = ReplicaProperty::new("Fuel", NetValue::Real(2.0), config);
        // 2.1 snaps to 2.0: not a wire-visible change.
        prop.set_value(NetValue::Real(2.1), 10);
        assert!(!prop.has_changed());
        prop.set_value(NetValue::Real(2.4), 20);
        assert!(prop.has_changed());
    }

    #[test]
    fn test_wire_roundtrip() {
        let config = PropertyConfig {
            quantize: Some(QuantizationRange::new(-10.0, 10.0, 0.001)),
            ..Default::default()
        };
        let mut sender = ReplicaProperty::new(
            "Position",
            NetValue::Real3(Vec3::new(1.25, -0.5, 3.141)),
            config.clone(),
        );
        sender.mark_replicated();
        let mut receiver =
            ReplicaProperty::new("Position", NetValue::Real3(Vec3::ZERO), config);

        let mut stream = BitStream::new();
        assert_eq!(sender.write_value(&mut stream), 45);
        receiver.read_and_apply(&mut stream, 5).unwrap();

        let NetValue::Real3(v) = receiver.value() else {
            panic!("type changed in flight");
        };
        assert!((v.x - 1.25).abs() <= 0.001);
        assert!((v.y + 0.5).abs() <= 0.001);
        assert!((v.z - 3.141).abs() <= 0.001);
    }

    #[test]
    fn test_convergence_approaches_target() {
        let config = PropertyConfig {
            convergence: ConvergenceConfig {
                enabled: true,
                active_weight: 0.5,
                snap_threshold: 100.0,
            },
            ..Default::default()
        };
        let mut prop = ReplicaProperty::new("Position", NetValue::Real(0.0), config);
        prop.apply_remote(NetValue::Real(1.0), 0);
        // Applied trails the target, halving the error each step.
        let NetValue::Real(first) = *prop.applied() else {
            panic!()
        };
        assert!(first < 1.0);
        let mut steps = 0;
        while prop.converge_step() {
            steps += 1;
            assert!(steps < 200, "convergence never finished");
        }
        assert_eq!(*prop.applied(), NetValue::Real(1.0));
    }

    #[test]
    fn test_convergence_snaps_past_threshold() {
        let config = PropertyConfig {
            convergence: ConvergenceConfig {
                enabled: true,
                active_weight: 0.1,
                snap_threshold: 5.0,
            },
            ..Default::default()
        };
        let mut prop = ReplicaProperty::new("Position", NetValue::Real(0.0), config);
        prop.apply_remote(NetValue::Real(50.0), 0);
        assert_eq!(*prop.applied(), NetValue::Real(50.0), "teleport should snap");
    }

    #[test]
    fn test_non_real_applies_instantly() {
        let config = PropertyConfig {
            convergence: ConvergenceConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut prop =
            ReplicaProperty::new("Name", NetValue::String("a".into()), config);
        prop.apply_remote(NetValue::String("b".into()), 0);
        assert_eq!(*prop.applied(), NetValue::String("b".to_string()));
    }
}
