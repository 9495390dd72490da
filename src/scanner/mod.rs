//! Core functionality for actual scanning behaviour.
use crate::address::{AddressResolver, ResolutionError};
use crate::config::ScanConfig;
use crate::server::{ProbeOutcome, ServerRecord};
use log::{debug, info, warn};

pub mod prober;
pub use prober::{Probe, ProbeError, Prober};

mod socket_iterator;
use socket_iterator::SocketIterator;

use futures::{stream, StreamExt};
use std::{
    collections::{hash_map::Entry, HashMap},
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
    time,
};

/// Targets resolved at the same time by [`Scanner::discover_all`].
const PARALLEL_RESOLUTIONS: usize = 4;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid scan configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Runs probes against every (address, port) pair of a target.
///
/// The scanner owns its resolver and prober. Everything that shapes a single
/// scan comes from the [`ScanConfig`] passed to each call, so scans with
/// different settings can share one scanner.
pub struct Scanner<P = Prober> {
    resolver: AddressResolver,
    prober: Arc<P>,
}

impl Scanner<Prober> {
    /// Builds a scanner whose resolver uses `config.dns`.
    #[must_use]
    pub fn new(config: &ScanConfig) -> Self {
        Self::with_prober(config, Prober)
    }
}

impl<P: Probe> Scanner<P> {
    #[must_use]
    pub fn with_prober(config: &ScanConfig, prober: P) -> Self {
        Self {
            resolver: AddressResolver::new(&config.dns),
            prober: Arc::new(prober),
        }
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    /// Probes `target` on the discovery ports and returns the servers found.
    ///
    /// The ports are the union of `config.discovery.well_known` and
    /// `config.discovery.range`.
    pub async fn discover(
        &self,
        target: &str,
        config: &ScanConfig,
    ) -> Result<Vec<ServerRecord>, ScanError> {
        config.validate().map_err(ScanError::Config)?;

        let ips = self.resolver.resolve(target).await?;
        let mut hosts = Hosts::default();
        hosts.add(target, ips);

        Ok(self
            .run(&hosts, &config.discovery.universe(), config, |outcome| {
                outcome.record
            })
            .await)
    }

    /// Probes `target` on exactly `ports` and returns every outcome.
    pub async fn scan(
        &self,
        target: &str,
        ports: &[u16],
        config: &ScanConfig,
    ) -> Result<Vec<ProbeOutcome>, ScanError> {
        config.validate().map_err(ScanError::Config)?;
        if ports.contains(&0) {
            return Err(ScanError::Config(String::from(
                "Port 0 must be between 1 and 65535",
            )));
        }

        let ips = self.resolver.resolve(target).await?;
        let mut hosts = Hosts::default();
        hosts.add(target, ips);

        Ok(self.run(&hosts, ports, config, Some).await)
    }

    /// Discovery across several targets in one fan-out.
    ///
    /// Targets that cannot be resolved are logged and skipped, so only a
    /// configuration error fails the whole call.
    pub async fn discover_all(
        &self,
        targets: &[String],
        config: &ScanConfig,
    ) -> Result<Vec<ServerRecord>, ScanError> {
        config.validate().map_err(ScanError::Config)?;

        let resolved = stream::iter(targets)
            .map(|target| async move { (target, self.resolver.resolve(target).await) })
            .buffer_unordered(PARALLEL_RESOLUTIONS)
            .collect::<Vec<_>>()
            .await;

        let mut hosts = Hosts::default();
        for (target, result) in resolved {
            match result {
                Ok(ips) => hosts.add(target, ips),
                Err(e) => warn!("Skipping {target}: {e}"),
            }
        }

        Ok(self
            .run(&hosts, &config.discovery.universe(), config, |outcome| {
                outcome.record
            })
            .await)
    }

    /// Status of a single server, or `None` if it does not answer.
    pub async fn server_info(
        &self,
        host: &str,
        port: u16,
        config: &ScanConfig,
    ) -> Option<ServerRecord> {
        let outcomes = match self.scan(host, &[port], config).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("Could not query {host}:{port}: {e}");
                return None;
            }
        };

        outcomes.into_iter().find_map(|outcome| outcome.record)
    }

    /// Whether `host:port` answers the status request.
    pub async fn is_online(&self, host: &str, port: u16, config: &ScanConfig) -> bool {
        self.server_info(host, port, config).await.is_some()
    }

    /// Fans out one probe task per socket.
    ///
    /// At most `config.concurrency` tasks are in flight. A task keeps its
    /// permit through the inter-probe delay. Each outcome is passed through
    /// `keep` as soon as its task is joined, so only what `keep` returns is
    /// held until the fan-out ends. Dropping the returned future drops the
    /// `JoinSet`, which aborts every task still running.
    async fn run<T, F>(
        &self,
        hosts: &Hosts,
        ports: &[u16],
        config: &ScanConfig,
        keep: F,
    ) -> Vec<T>
    where
        F: FnMut(ProbeOutcome) -> Option<T>,
    {
        let config = Arc::new(config.clone());
        let limiter = Arc::new(Semaphore::new(config.concurrency));
        let mut probes = JoinSet::new();
        let mut results = Collected::new(keep);

        debug!(
            "Start scanning sockets. \nConcurrency {}\nNumber of ip-s {}\nNumber of ports {}\nTargets all together {} ",
            config.concurrency,
            hosts.ips.len(),
            ports.len(),
            hosts.ips.len() * ports.len()
        );

        for socket in SocketIterator::new(&hosts.ips, ports) {
            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };

            let prober = Arc::clone(&self.prober);
            let config = Arc::clone(&config);
            let server_name = hosts.server_name(socket);

            probes.spawn(async move {
                let outcome = prober.probe(socket, &server_name, &config).await;
                if !config.delay.is_zero() {
                    time::sleep(config.delay).await;
                }
                drop(permit);
                outcome
            });

            while let Some(joined) = probes.try_join_next() {
                results.add(joined);
            }
        }

        while let Some(joined) = probes.join_next().await {
            results.add(joined);
        }

        debug!("Open sockets found: {}", results.open);
        results.into_sorted()
    }
}

/// Joined outcomes reduced to what the caller keeps, tagged with their
/// socket for ordering.
struct Collected<T, F> {
    keep: F,
    kept: Vec<(IpAddr, u16, T)>,
    open: usize,
}

impl<T, F> Collected<T, F>
where
    F: FnMut(ProbeOutcome) -> Option<T>,
{
    fn new(keep: F) -> Self {
        Self {
            keep,
            kept: Vec::new(),
            open: 0,
        }
    }

    fn add(&mut self, joined: Result<ProbeOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Probe task failed: {e}");
                return;
            }
        };

        if outcome.port_open {
            self.open += 1;
        }
        if let Some(record) = &outcome.record {
            info!("Found server {}:{}", record.host, record.port);
        }

        let (target, port) = (outcome.target, outcome.port);
        if let Some(value) = (self.keep)(outcome) {
            self.kept.push((target, port, value));
        }
    }

    fn into_sorted(mut self) -> Vec<T> {
        self.kept
            .sort_unstable_by_key(|(target, port, _)| (*target, *port));
        self.kept.into_iter().map(|(_, _, value)| value).collect()
    }
}

/// Addresses to probe, each with the name announced in its handshake.
#[derive(Default)]
struct Hosts {
    ips: Vec<IpAddr>,
    names: HashMap<IpAddr, Arc<str>>,
}

impl Hosts {
    /// Adds the addresses `target` resolved to. Hostname targets are
    /// announced by name, everything else by address. An address already
    /// present keeps its first name.
    fn add(&mut self, target: &str, ips: Vec<IpAddr>) {
        let target = target.trim();
        let hostname = (!target.contains('/') && IpAddr::from_str(target).is_err())
            .then(|| Arc::<str>::from(target));

        for ip in ips {
            if let Entry::Vacant(entry) = self.names.entry(ip) {
                entry.insert(
                    hostname
                        .clone()
                        .unwrap_or_else(|| Arc::from(ip.to_string())),
                );
                self.ips.push(ip);
            }
        }
    }

    fn server_name(&self, socket: SocketAddr) -> Arc<str> {
        self.names
            .get(&socket.ip())
            .cloned()
            .unwrap_or_else(|| Arc::from(socket.ip().to_string()))
    }
}
