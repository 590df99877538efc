//! The master-server host registry.
//!
//! A master server is, at the transport level, an ordinary server; here it
//! keeps the published host records: per project GUID, a map from host
//! address to record, plus a per-IP count enforcing the same-IP record cap.
//! Records age every tick and expire past the configured lifetime.

use std::net::SocketAddr;

use rustc_hash::FxHashMap;

use quasar_bitstream::BitStream;
use quasar_net::{HostRecordEntry, HostRecordListData};

/// One published host record.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub project_guid: u64,
    pub address: SocketAddr,
    pub basic_info: BitStream,
    /// Seconds since the last publish refreshed this record.
    pub age_secs: f64,
}

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new record was created.
    Discovered,
    /// An existing record was refreshed.
    Updated,
    /// The per-IP cap rejected the publish.
    Rejected,
}

/// The registry.
#[derive(Debug)]
pub struct MasterServerRegistry {
    /// (project guid, host address) -> record.
    records: FxHashMap<(u64, SocketAddr), HostRecord>,
    /// Distinct records per host IP (port-less), for the same-IP cap.
    ip_counts: FxHashMap<String, u32>,
    /// Seconds a record lives without a refresh.
    record_lifetime_secs: f64,
    /// Most records one host IP may occupy.
    same_ip_limit: u32,
}

impl MasterServerRegistry {
    pub fn new(record_lifetime_secs: f64, same_ip_limit: u32) -> Self {
        Self {
            records: FxHashMap::default(),
            ip_counts: FxHashMap::default(),
            record_lifetime_secs,
            same_ip_limit,
        }
    }

    fn ip_key(address: SocketAddr) -> String {
        address.ip().to_string()
    }

    /// Handles a `NetHostPublish`: refreshes the existing record or inserts
    /// a new one, subject to the per-IP cap.
    pub fn receive_publish(
        &mut self,
        from: SocketAddr,
        project_guid: u64,
        basic_info: BitStream,
    ) -> PublishOutcome {
        if let Some(record) = self.records.get_mut(&(project_guid, from)) {
            record.age_secs = 0.0;
            record.basic_info = basic_info;
            return PublishOutcome::Updated;
        }

        let key = Self::ip_key(from);
        let count = self.ip_counts.get(&key).copied().unwrap_or(0);
        if count >= self.same_ip_limit {
            return PublishOutcome::Rejected;
        }
        self.ip_counts.insert(key, count + 1);
        self.records.insert(
            (project_guid, from),
            HostRecord {
                project_guid,
                address: from,
                basic_info,
                age_secs: 0.0,
            },
        );
        PublishOutcome::Discovered
    }

    /// Looks up the record for a routed refresh. Presence is checked before
    /// any access; a missing key is just `None`.
    pub fn find(&self, project_guid: u64, host: SocketAddr) -> Option<&HostRecord> {
        self.records.get(&(project_guid, host))
    }

    /// Removes one record, keeping the IP counts straight.
    pub fn remove(&mut self, project_guid: u64, host: SocketAddr) -> Option<HostRecord> {
        let record = self.records.remove(&(project_guid, host))?;
        let key = Self::ip_key(host);
        if let Some(count) = self.ip_counts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_counts.remove(&key);
            }
        }
        Some(record)
    }

    /// Ages every record by `dt_secs`; returns the expired ones, removed.
    pub fn tick(&mut self, dt_secs: f64) -> Vec<HostRecord> {
        let expired: Vec<(u64, SocketAddr)> = self
            .records
            .values_mut()
            .map(|record| {
                record.age_secs += dt_secs;
                record
            })
            .filter(|record| record.age_secs > self.record_lifetime_secs)
            .map(|record| (record.project_guid, record.address))
            .collect();

        expired
            .into_iter()
            .filter_map(|(guid, addr)| self.remove(guid, addr))
            .collect()
    }

    /// Serializes every record into a record-list message body.
    pub fn record_list(&self) -> HostRecordListData {
        HostRecordListData {
            records: self
                .records
                .values()
                .map(|record| HostRecordEntry {
                    address: record.address,
                    basic_host_info: record.basic_info.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.ip_counts.clear();
    }
}
