//! Provides functions to turn a target (IP, hostname or CIDR) into the
//! addresses to probe.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use cidr_utils::cidr::IpCidr;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use itertools::Itertools;
use log::debug;
use thiserror::Error;
use tokio::{fs, io};

use crate::config::DnsConfig;

/// Blocks with more host bits than this are refused.
pub const MAX_CIDR_HOST_BITS: u8 = 24;

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("invalid CIDR block {target:?}: {reason}")]
    InvalidCidr { target: String, reason: String },

    #[error("CIDR block {target:?} has more than 2^{MAX_CIDR_HOST_BITS} addresses")]
    CidrTooLarge { target: String },

    #[error("host {host:?} could not be resolved: {reason}")]
    Unresolvable { host: String, reason: String },
}

/// Expands targets into addresses, owning the DNS resolver used for
/// hostnames.
pub struct AddressResolver {
    resolver: TokioAsyncResolver,
}

impl AddressResolver {
    #[must_use]
    pub fn new(dns: &DnsConfig) -> Self {
        Self {
            resolver: get_resolver(dns),
        }
    }

    /// Given a string, parse it as a CIDR, an IP address or a host.
    ///
    /// Hostnames are looked up as A records first, then AAAA, then through
    /// the platform resolver. The returned list never contains duplicates.
    pub async fn resolve(&self, target: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        let target = target.trim();

        if target.contains('/') {
            return expand_cidr(target);
        }

        if let Ok(ip) = IpAddr::from_str(target) {
            return Ok(vec![ip]);
        }

        self.resolve_ips_from_host(target).await
    }

    /// Uses DNS to get the IPs associated with host.
    async fn resolve_ips_from_host(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        if host.is_empty() {
            return Err(ResolutionError::Unresolvable {
                host: host.to_owned(),
                reason: String::from("empty host name"),
            });
        }

        match self.resolver.ipv4_lookup(host).await {
            Ok(lookup) => {
                let ips = lookup.iter().map(|a| IpAddr::V4(a.0)).unique().collect_vec();
                if !ips.is_empty() {
                    return Ok(ips);
                }
            }
            Err(e) => debug!("A lookup for {host} failed: {e}"),
        }

        match self.resolver.ipv6_lookup(host).await {
            Ok(lookup) => {
                let ips = lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).unique().collect_vec();
                if !ips.is_empty() {
                    return Ok(ips);
                }
            }
            Err(e) => debug!("AAAA lookup for {host} failed: {e}"),
        }

        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                let ips = addrs.map(|addr| addr.ip()).unique().collect_vec();
                if ips.is_empty() {
                    Err(ResolutionError::Unresolvable {
                        host: host.to_owned(),
                        reason: String::from("no addresses returned"),
                    })
                } else {
                    Ok(ips)
                }
            }
            Err(e) => Err(ResolutionError::Unresolvable {
                host: host.to_owned(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Expands a CIDR block into its usable host addresses.
///
/// Host bits set in the address are ignored, so `192.168.1.7/30` is the same
/// block as `192.168.1.0/30`. IPv4 blocks drop their network and broadcast
/// addresses except for /31 and /32; IPv6 blocks drop the subnet-router
/// anycast address except for /127 and /128.
///
/// ```rust
/// # use craftscan::address::expand_cidr;
/// let ips = expand_cidr("192.168.1.0/30").unwrap();
/// assert_eq!(ips.len(), 2);
/// ```
pub fn expand_cidr(target: &str) -> Result<Vec<IpAddr>, ResolutionError> {
    let invalid = |reason: &str| ResolutionError::InvalidCidr {
        target: target.to_owned(),
        reason: reason.to_owned(),
    };

    let (address, prefix) = target.split_once('/').ok_or_else(|| invalid("missing prefix"))?;
    let address = IpAddr::from_str(address.trim()).map_err(|_| invalid("invalid address"))?;
    let prefix = u8::from_str(prefix.trim()).map_err(|_| invalid("invalid prefix length"))?;

    let (network, width) = match address {
        IpAddr::V4(ip) => {
            if prefix > 32 {
                return Err(invalid("prefix length above 32"));
            }
            let mask = u32::MAX.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
            (IpAddr::V4(Ipv4Addr::from(u32::from(ip) & mask)), 32)
        }
        IpAddr::V6(ip) => {
            if prefix > 128 {
                return Err(invalid("prefix length above 128"));
            }
            let mask = u128::MAX.checked_shl(u32::from(128 - prefix)).unwrap_or(0);
            (IpAddr::V6(Ipv6Addr::from(u128::from(ip) & mask)), 128)
        }
    };

    let host_bits = width - prefix;
    if host_bits > MAX_CIDR_HOST_BITS {
        return Err(ResolutionError::CidrTooLarge {
            target: target.to_owned(),
        });
    }

    let cidr = IpCidr::from_str(&format!("{network}/{prefix}"))
        .map_err(|e| invalid(&e.to_string()))?;
    let total = 1usize << host_bits;

    let (skip, take) = match network {
        IpAddr::V4(_) if host_bits >= 2 => (1, total - 2),
        IpAddr::V6(_) if host_bits >= 2 => (1, total - 1),
        _ => (0, total),
    };

    Ok(cidr
        .iter()
        .map(|inet| inet.address())
        .skip(skip)
        .take(take)
        .collect())
}

/// Derive a DNS resolver.
///
/// 1. if DNS servers are configured, query them over UDP with the configured
///    timeout.
/// 2. otherwise:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver.
fn get_resolver(dns: &DnsConfig) -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.timeout = dns.timeout;

    if dns.servers.is_empty() {
        return TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), opts)
        });
    }

    let mut config = ResolverConfig::new();
    for ip in &dns.servers {
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(*ip, 53),
            Protocol::Udp,
        ));
    }
    TokioAsyncResolver::tokio(config, opts)
}

/// Reads DNS servers from `resolver`.
///
/// The value is first tried as a path to a file with one IP per line, then
/// parsed as a comma-separated list of IPs. Entries that are not IPs are
/// skipped.
pub async fn read_resolver_servers(resolver: &str) -> Vec<IpAddr> {
    match read_resolver_from_file(resolver).await {
        Ok(ips) => ips,
        Err(_) => parse_resolver_list(resolver),
    }
}

/// Parses a comma-separated list of resolver IPs.
#[must_use]
pub fn parse_resolver_list(list: &str) -> Vec<IpAddr> {
    list.split(',')
        .filter_map(|r| IpAddr::from_str(r.trim()).ok())
        .unique()
        .collect()
}

/// Parses an input file of IPs for use in DNS resolution.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .unique()
        .collect();

    Ok(ips)
}
