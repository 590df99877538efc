//! Replica channels: named property groups sharing one replication policy.
//!
//! A channel is the unit of change detection and of wire transfer: when any
//! property in the channel changes, the whole channel's values serialize into
//! one change frame. Channels poll for changes on a configured cadence and
//! "nap" (poll less often) after a stretch of quiet ticks, waking on the next
//! observed change.

use quasar_bitstream::{BitStream, NetValueError};

use crate::NetPeerId;
use crate::property::ReplicaProperty;

/// How changes are observed on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// Only replicates when `replicate_now` is called.
    Manual,
    /// Polled on the configured intervals.
    Automatic,
    /// Polled, and `replicate_now` also forces a frame.
    #[default]
    Manumatic,
}

/// Transfer reliability for a channel's change frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityMode {
    /// Every frame arrives, in order.
    #[default]
    Reliable,
    /// Latest-wins; stale frames are dropped in transit.
    Sequenced,
}

/// Who may emit change frames for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorityMode {
    /// The server alone.
    #[default]
    Fixed,
    /// Follows the object's owning user's peer.
    Dynamic,
}

/// Channel replication policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub detection_mode: DetectionMode,
    pub reliability: ReliabilityMode,
    pub authority: AuthorityMode,
    /// Ticks between change polls while awake.
    pub awake_detection_interval: u32,
    /// Ticks between change polls while napping.
    pub nap_detection_interval: u32,
    /// Quiet ticks before the channel starts napping.
    pub awake_duration: u32,
    /// Serialize values when the replica comes online.
    pub replicate_on_online: bool,
    /// Emit frames on detected changes.
    pub replicate_on_change: bool,
    /// Serialize values when the replica goes offline.
    pub replicate_on_offline: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            detection_mode: DetectionMode::default(),
            reliability: ReliabilityMode::default(),
            authority: AuthorityMode::default(),
            awake_detection_interval: 1,
            nap_detection_interval: 2,
            awake_duration: 10,
            replicate_on_online: true,
            replicate_on_change: true,
            replicate_on_offline: false,
        }
    }
}

/// A named, ordered group of properties.
#[derive(Debug, Clone)]
pub struct ReplicaChannel {
    pub name: String,
    pub config: ChannelConfig,
    properties: Vec<ReplicaProperty>,
    napping: bool,
    quiet_ticks: u32,
    ticks_since_poll: u32,
    replicate_requested: bool,
    /// Peer holding authority while `AuthorityMode::Dynamic`.
    authority_client: NetPeerId,
}

impl ReplicaChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            properties: Vec::new(),
            napping: false,
            quiet_ticks: 0,
            ticks_since_poll: 0,
            replicate_requested: false,
            authority_client: NetPeerId(0),
        }
    }

    pub fn add_property(&mut self, property: ReplicaProperty) {
        self.properties.push(property);
    }

    pub fn properties(&self) -> &[ReplicaProperty] {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut [ReplicaProperty] {
        &mut self.properties
    }

    pub fn property(&self, name: &str) -> Option<&ReplicaProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut ReplicaProperty> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    /// True while the channel polls on the slower napping cadence.
    pub fn is_napping(&self) -> bool {
        self.napping
    }

    /// Peer currently holding dynamic authority.
    pub fn authority_client(&self) -> NetPeerId {
        self.authority_client
    }

    /// Points dynamic authority at a peer.
    pub fn set_authority_client(&mut self, peer: NetPeerId) {
        self.authority_client = peer;
    }

    /// Forces a frame on the next detection pass (Manual and Manumatic).
    pub fn replicate_now(&mut self) {
        self.replicate_requested = true;
    }

    /// One detection tick. Returns true when a change frame should be
    /// emitted this tick.
    pub fn detect(&mut self) -> bool {
        let forced = match self.config.detection_mode {
            DetectionMode::Manual => return std::mem::take(&mut self.replicate_requested),
            DetectionMode::Automatic => false,
            DetectionMode::Manumatic => std::mem::take(&mut self.replicate_requested),
        };

        self.ticks_since_poll += 1;
        let interval = if self.napping {
            self.config.nap_detection_interval
        } else {
            self.config.awake_detection_interval
        };
        if !forced && self.ticks_since_poll < interval.max(1) {
            return false;
        }
        self.ticks_since_poll = 0;

        let changed = forced
            || (self.config.replicate_on_change
                && self.properties.iter().any(ReplicaProperty::has_changed));
        if changed {
            self.quiet_ticks = 0;
            self.napping = false;
        } else {
            self.quiet_ticks = self.quiet_ticks.saturating_add(1);
            if self.quiet_ticks >= self.config.awake_duration {
                self.napping = true;
            }
        }
        changed
    }

    /// Serializes every property value, marking them replicated. This is
    /// the change-frame path.
    pub fn write_values(&mut self, stream: &mut BitStream) {
        for property in &mut self.properties {
            property.write_value(stream);
            property.mark_replicated();
        }
    }

    /// Serializes every property value without touching change-detection
    /// state. Spawn and clone streams use this so a clone to one link never
    /// swallows change frames owed to the others.
    pub fn write_snapshot(&self, stream: &mut BitStream) {
        for property in &self.properties {
            property.write_value(stream);
        }
    }

    /// Deserializes every property value, applying each as a remote update.
    pub fn read_values(
        &mut self,
        stream: &mut BitStream,
        now_ms: u64,
    ) -> Result<(), NetValueError> {
        for property in &mut self.properties {
            property.read_and_apply(stream, now_ms)?;
        }
        Ok(())
    }

    /// Runs one convergence tick over the channel. Returns true while any
    /// property is still converging.
    pub fn converge_step(&mut self) -> bool {
        let mut moving = false;
        for property in &mut self.properties {
            moving |= property.converge_step();
        }
        moving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{PropertyConfig, ReplicaProperty};
    use quasar_bitstream::NetValue;

    fn channel_with_prop(config: ChannelConfig) -> ReplicaChannel {
        let mut channel = ReplicaChannel::new("Test", config);
        channel.add_property(ReplicaProperty::new(
            "Value",
            NetValue::Integer(0),
            PropertyConfig::default(),
        ));
        channel
    }

    #[test]
    fn test_automatic_detects_on_interval() {
        let mut channel = channel_with_prop(ChannelConfig {
            detection_mode: DetectionMode::Automatic,
            ..Default::default()
        });
        assert!(!channel.detect(), "no change yet");
        channel
            .property_mut("Value")
            .unwrap()
            .set_value(NetValue::Integer(5), 10);
        assert!(channel.detect());
    }

    #[test]
    fn test_manual_only_replicates_on_request() {
        let mut channel = channel_with_prop(ChannelConfig {
            detection_mode: DetectionMode::Manual,
            ..Default::default()
        });
        channel
            .property_mut("Value")
            .unwrap()
            .set_value(NetValue::Integer(5), 10);
        assert!(!channel.detect(), "manual channels ignore value changes");
        channel.replicate_now();
        assert!(channel.detect());
        assert!(!channel.detect(), "request is one-shot");
    }

    #[test]
    fn test_napping_after_quiet_ticks() {
        let mut channel = channel_with_prop(ChannelConfig {
            detection_mode: DetectionMode::Automatic,
            awake_duration: 3,
            nap_detection_interval: 4,
            ..Default::default()
        });
        for _ in 0..3 {
            channel.detect();
        }
        assert!(channel.is_napping());

        // While napping, polls thin out to the nap interval.
        channel
            .property_mut("Value")
            .unwrap()
            .set_value(NetValue::Integer(1), 10);
        let polls_until_detect = (0..4).filter(|_| channel.detect()).count();
        assert_eq!(polls_until_detect, 1, "one poll in the nap window sees it");
        assert!(!channel.is_napping(), "change wakes the channel");
    }

    #[test]
    fn test_write_marks_replicated() {
        let mut channel = channel_with_prop(ChannelConfig {
            detection_mode: DetectionMode::Automatic,
            ..Default::default()
        });
        channel
            .property_mut("Value")
            .unwrap()
            .set_value(NetValue::Integer(7), 10);
        assert!(channel.detect());

        let mut stream = BitStream::new();
        channel.write_values(&mut stream);
        assert!(!channel.detect(), "nothing new after serialization");
    }

    #[test]
    fn test_channel_value_roundtrip() {
        let mut sender = channel_with_prop(ChannelConfig::default());
        sender
            .property_mut("Value")
            .unwrap()
            .set_value(NetValue::Integer(123), 10);
        let mut receiver = channel_with_prop(ChannelConfig::default());

        let mut stream = BitStream::new();
        sender.write_values(&mut stream);
        receiver.read_values(&mut stream, 20).unwrap();
        assert_eq!(
            receiver.property("Value").unwrap().value(),
            &NetValue::Integer(123)
        );
    }
}
