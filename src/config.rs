//! Immutable configuration for a single scan invocation.
//!
//! A [`ScanConfig`] is built once, usually from [`crate::input::Opts`], and
//! handed by reference to every scanner call. Nothing in the crate mutates it
//! while a scan is running.
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use itertools::Itertools;

use crate::input::PortRange;
use crate::protocol::DEFAULT_PROTOCOL_VERSION;

pub const DEFAULT_CONCURRENCY: usize = 50;
pub const MAX_CONCURRENCY: usize = 65_535;

/// Resolver settings used for hostname targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    /// Name servers queried over UDP port 53. Empty means the system
    /// configuration.
    pub servers: Vec<IpAddr>,
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            ],
            timeout: Duration::from_secs(5),
        }
    }
}

/// Ports probed by [`crate::scanner::Scanner::discover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPorts {
    pub well_known: Vec<u16>,
    pub range: PortRange,
}

impl DiscoveryPorts {
    /// The union of the well-known ports and the range, ascending and without
    /// duplicates.
    #[must_use]
    pub fn universe(&self) -> Vec<u16> {
        self.well_known
            .iter()
            .copied()
            .chain(self.range.start..=self.range.end)
            .sorted_unstable()
            .dedup()
            .collect()
    }
}

impl Default for DiscoveryPorts {
    fn default() -> Self {
        Self {
            well_known: vec![25565, 25566, 25567, 25568, 25569],
            range: PortRange {
                start: 25565,
                end: 25575,
            },
        }
    }
}

/// Settings for one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Upper bound on simultaneously in-flight probes.
    pub concurrency: usize,
    /// Applies to connecting and, separately, to the whole status exchange.
    pub timeout: Duration,
    /// Pause after each probe before its concurrency slot is released.
    pub delay: Duration,
    /// Connection attempts per probe. Zero is treated as one.
    pub tries: u8,
    pub protocol_version: u32,
    pub dns: DnsConfig,
    pub discovery: DiscoveryPorts,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(10),
            delay: Duration::from_millis(100),
            tries: 1,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            dns: DnsConfig::default(),
            discovery: DiscoveryPorts::default(),
        }
    }
}

impl ScanConfig {
    /// Checks the values a scan cannot start with.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(format!(
                "Concurrency {} must be between 1 and {MAX_CONCURRENCY}",
                self.concurrency
            ));
        }

        if self.timeout.is_zero() {
            return Err(String::from("Timeout must be greater than zero"));
        }

        self.discovery.range.validate()?;

        if self.discovery.well_known.contains(&0) {
            return Err(String::from(
                "Well-known ports must be between 1 and 65535",
            ));
        }

        Ok(())
    }

    pub(crate) fn connect_tries(&self) -> u8 {
        self.tries.max(1)
    }
}
