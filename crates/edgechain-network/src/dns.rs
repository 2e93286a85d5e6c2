//! Private hosted zone for the fabric.
//!
//! Interface endpoints with private DNS enabled publish the service's
//! regional hostname here, so that callers inside the fabric resolve the
//! standard name to endpoint addresses in their own subnets. Names with no
//! record fall through to public resolution, which isolated callers cannot
//! route to.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default TTL for endpoint records, in seconds.
pub const DEFAULT_TTL: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub hostname: String,
    pub addresses: Vec<Ipv4Addr>,
    /// TTL in seconds.
    pub ttl: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivateDns {
    records: BTreeMap<String, DnsRecord>,
}

impl PrivateDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the record for `hostname`.
    pub fn upsert(&mut self, hostname: &str, addresses: Vec<Ipv4Addr>, ttl: u32) {
        let hostname = normalize(hostname);
        debug!(%hostname, count = addresses.len(), "private DNS record upserted");
        self.records.insert(
            hostname.clone(),
            DnsRecord {
                hostname,
                addresses,
                ttl,
            },
        );
    }

    pub fn resolve(&self, hostname: &str) -> Option<&DnsRecord> {
        self.records.get(&normalize(hostname))
    }

    pub fn remove(&mut self, hostname: &str) -> Option<DnsRecord> {
        self.records.remove(&normalize(hostname))
    }

    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.records.values()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Hostnames are case-insensitive and may carry a trailing root dot.
fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
