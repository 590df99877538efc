//! Peer configuration.
//!
//! These structs are plain data serialized with the game archetype by the
//! engine's own configuration layer; the subsystem never reads or writes
//! them to disk itself.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Everything tunable on a [`NetPeer`](crate::peer::NetPeer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetPeerConfig {
    /// Project GUID; peers only discover and join matching projects.
    pub project_guid: u64,

    /// Address the UDP socket binds to.
    pub bind_ip: IpAddr,

    /// Extra ports to try past the requested one when binding.
    pub port_retries: u16,

    /// First port of the inclusive LAN host scan range.
    pub host_port_range_start: u16,
    /// Last port of the inclusive LAN host scan range.
    pub host_port_range_end: u16,

    /// Answer LAN discovery pings.
    pub lan_discoverable: bool,
    /// Publish to subscribed master servers and answer routed refreshes.
    pub internet_discoverable: bool,

    /// Seconds between master-server publishes.
    pub internet_host_publish_interval_secs: f64,
    /// Seconds a master-server host record lives without a refresh.
    pub internet_host_record_lifetime_secs: f64,
    /// Most records any single host IP may occupy on a master server.
    pub internet_same_ip_host_record_limit: u32,

    /// Milliseconds a host discovery request waits before concluding.
    pub host_ping_timeout_ms: u64,

    /// Milliseconds between link idle-timeout disconnects.
    pub link_idle_timeout_ms: u64,
}

impl Default for NetPeerConfig {
    fn default() -> Self {
        Self {
            project_guid: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_retries: 8,
            host_port_range_start: 8000,
            host_port_range_end: 8010,
            lan_discoverable: false,
            internet_discoverable: false,
            internet_host_publish_interval_secs: 10.0,
            internet_host_record_lifetime_secs: 30.0,
            internet_same_ip_host_record_limit: 8,
            host_ping_timeout_ms: 2_000,
            link_idle_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = NetPeerConfig::default();
        assert!(config.host_port_range_start <= config.host_port_range_end);
        assert!(config.internet_same_ip_host_record_limit > 0);
        assert!(!config.lan_discoverable, "discoverability is opt-in");
        assert!(!config.internet_discoverable);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut config = NetPeerConfig::default();
        config.project_guid = 0xABCD;
        config.lan_discoverable = true;
        let json = serde_json::to_string(&config).unwrap();
        let back: NetPeerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project_guid, 0xABCD);
        assert!(back.lan_discoverable);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let back: NetPeerConfig = serde_json::from_str(r#"{"project_guid": 5}"#).unwrap();
        assert_eq!(back.project_guid, 5);
        assert_eq!(back.port_retries, NetPeerConfig::default().port_retries);
    }
}
