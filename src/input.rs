//! Provides a means to read, parse and hold configuration options for scans.
use clap::Parser;
use serde_derive::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{DiscoveryPorts, DnsConfig, ScanConfig};

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Inclusive range of ports, written `start-end`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn validate(&self) -> Result<(), String> {
        let Self { start, end } = *self;
        if start > end {
            return Err(format!(
                "Start port {start} is greater than end port {end} in range '{start}-{end}'",
            ));
        }

        if start < LOWEST_PORT_NUMBER {
            return Err(format!(
                "Ports in range '{start}-{end}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
            ));
        }

        Ok(())
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(range_str: &str) -> Result<Self, Self::Err> {
        let range_parts: Vec<&str> = range_str.trim().split('-').collect();
        if range_parts.len() != 2 {
            return Err(format!(
                "Invalid range format '{range_str}'. Expected 'start-end'. Example: 25565-25575.",
            ));
        }

        let start: u16 = range_parts[0].trim().parse().map_err(|_| {
            format!(
                "Invalid start port '{}' in range '{range_str}'",
                range_parts[0]
            )
        })?;
        let end: u16 = range_parts[1].trim().parse().map_err(|_| {
            format!(
                "Invalid end port '{}' in range '{range_str}'",
                range_parts[1]
            )
        })?;

        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }
}

pub type Ports = Vec<u16>;

/// Parses `80,443,1-1000` style port specifications.
///
/// Parts are split on `,`, then on `-`. The result is sorted and free of
/// duplicates. Out-of-range values are errors, never clamped.
pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('-') {
            let range = PortRange::from_str(part)?;
            ports.extend(range.start..=range.end);
        } else {
            let port = parse_single_port(part)?;
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "craftscan",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Minecraft server discovery over the server-list-ping protocol.
/// Without --ports every target is probed on the discovery ports and only
/// servers are reported; with --ports every probe outcome is reported.
pub struct Opts {
    /// A comma-delimited list of CIDRs, IPs, or hosts to be scanned.
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// Ports to probe instead of the discovery ports. Examples: 25565,25566 or 25560-25600
    #[arg(short, long, value_parser = parse_ports_and_ranges)]
    pub ports: Option<Ports>,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only output host:port pairs of servers found.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off colored output.
    #[arg(long)]
    pub accessible: bool,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// The timeout in milliseconds for DNS queries.
    #[arg(long, default_value = "5000")]
    pub dns_timeout: u32,

    /// Maximum number of probes in flight at the same time. Depends on the
    /// open file limit of your OS.
    #[arg(short = 'b', long, default_value = "50")]
    pub concurrency: u16,

    /// The timeout in milliseconds for connecting and for the status exchange.
    #[arg(short, long, default_value = "10000")]
    pub timeout: u32,

    /// Milliseconds each probe waits before freeing its slot.
    #[arg(short, long, default_value = "100")]
    pub delay: u32,

    /// The number of connection attempts before a port is assumed to be closed.
    /// If set to 0, craftscan will correct it to 1.
    #[arg(long, default_value = "1")]
    pub tries: u8,

    /// Protocol version announced in the handshake.
    #[arg(long, default_value = "47")]
    pub protocol_version: u32,

    /// Ports always probed during discovery.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "25565,25566,25567,25568,25569"
    )]
    pub well_known_ports: Vec<u16>,

    /// Port range probed during discovery, in addition to the well-known ports.
    #[arg(long, default_value = "25565-25575")]
    pub discovery_range: PortRange,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Merges values found within the user configuration file into the
    /// command line arguments.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            addresses,
            greppable,
            accessible,
            json,
            dns_timeout,
            concurrency,
            timeout,
            delay,
            tries,
            protocol_version,
            well_known_ports,
            discovery_range
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        merge_optional!(ports, resolver, ulimit);
    }

    /// Freezes the merged options into the configuration of one scan.
    pub fn scan_config(&self, dns_servers: Vec<IpAddr>) -> Result<ScanConfig, String> {
        let config = ScanConfig {
            concurrency: usize::from(self.concurrency),
            timeout: Duration::from_millis(u64::from(self.timeout)),
            delay: Duration::from_millis(u64::from(self.delay)),
            tries: self.tries,
            protocol_version: self.protocol_version,
            dns: DnsConfig {
                servers: dns_servers,
                timeout: Duration::from_millis(u64::from(self.dns_timeout)),
            },
            discovery: DiscoveryPorts {
                well_known: self.well_known_ports.clone(),
                range: self.discovery_range,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: vec![],
            ports: None,
            no_config: true,
            config_path: None,
            greppable: true,
            accessible: false,
            json: false,
            resolver: None,
            dns_timeout: 5_000,
            concurrency: 50,
            timeout: 10_000,
            delay: 100,
            tries: 1,
            protocol_version: 47,
            well_known_ports: vec![25565, 25566, 25567, 25568, 25569],
            discovery_range: PortRange {
                start: 25565,
                end: 25575,
            },
            ulimit: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Deserialize)]
pub struct Config {
    addresses: Option<Vec<String>>,
    ports: Option<Vec<u16>>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
    resolver: Option<String>,
    dns_timeout: Option<u32>,
    concurrency: Option<u16>,
    timeout: Option<u32>,
    delay: Option<u32>,
    tries: Option<u8>,
    protocol_version: Option<u32>,
    well_known_ports: Option<Vec<u16>>,
    discovery_range: Option<PortRange>,
    ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
#[allow(clippy::doc_link_with_quotes)]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing or unreadable file yields an empty config.
    ///
    /// # Format
    ///
    /// addresses = ["192.168.1.0/24"]
    /// concurrency = 200
    /// timeout = 3000
    /// resolver = "8.8.8.8,1.1.1.1"
    /// well_known_ports = [25565, 19132]
    /// discovery_range = { start = 25565, end = 25600 }
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, String> {
        let config_path = match custom_config_path {
            Some(path) => path,
            None => default_config_path()?,
        };

        let content = if config_path.exists() {
            fs::read_to_string(&config_path).unwrap_or_default()
        } else {
            String::new()
        };

        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Found {e} in configuration file."))
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Result<PathBuf, String> {
    let Some(mut config_path) = dirs::home_dir() else {
        return Err(String::from("Could not infer config file path."));
    };
    config_path.push(".craftscan.toml");
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;
    use std::time::Duration;

    use super::{parse_ports_and_ranges, Config, Opts, PortRange};

    impl Config {
        fn default() -> Self {
            Self {
                addresses: Some(vec!["127.0.0.1".to_owned()]),
                ports: None,
                greppable: Some(true),
                accessible: Some(true),
                json: Some(true),
                resolver: None,
                dns_timeout: Some(2_000),
                concurrency: Some(500),
                timeout: Some(1_000),
                delay: Some(0),
                tries: Some(2),
                protocol_version: Some(765),
                well_known_ports: Some(vec![25565]),
                discovery_range: Some(PortRange {
                    start: 25565,
                    end: 25570,
                }),
                ulimit: None,
            }
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[parameterized(input = {
        vec!["craftscan", "--addresses", "127.0.0.1"],
        vec!["craftscan", "-a", "127.0.0.1,play.example.net"],
        vec!["craftscan", "-a", "10.0.0.0/30", "-p", "25565,25566"],
        vec!["craftscan", "-a", "10.0.0.0/30", "-p", "25560-25562"],
    }, addresses = {
        vec!["127.0.0.1".to_owned()],
        vec!["127.0.0.1".to_owned(), "play.example.net".to_owned()],
        vec!["10.0.0.0/30".to_owned()],
        vec!["10.0.0.0/30".to_owned()],
    }, ports = {
        None,
        None,
        Some(vec![25565, 25566]),
        Some(vec![25560, 25561, 25562]),
    })]
    fn parse_addresses_and_ports(input: Vec<&str>, addresses: Vec<String>, ports: Option<Vec<u16>>) {
        let opts = Opts::parse_from(input);

        assert_eq!(addresses, opts.addresses);
        assert_eq!(ports, opts.ports);
    }

    #[test]
    fn cli_defaults_match_opts_default() {
        let parsed = Opts::parse_from(["craftscan"]);
        let default = Opts::default();

        assert_eq!(parsed.concurrency, default.concurrency);
        assert_eq!(parsed.timeout, default.timeout);
        assert_eq!(parsed.delay, default.delay);
        assert_eq!(parsed.well_known_ports, default.well_known_ports);
        assert_eq!(parsed.discovery_range, default.discovery_range);
    }

    #[test]
    fn cli_rejects_bad_discovery_range() {
        let result = Opts::try_parse_from(["craftscan", "--discovery-range", "25575-25565"]);
        assert!(result.is_err());
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();
        let config = Config::default();

        opts.merge(&config);

        assert_eq!(opts.addresses, vec![] as Vec<String>);
        assert!(opts.greppable);
        assert!(!opts.accessible);
        assert_eq!(opts.timeout, 10_000);
        assert_eq!(opts.concurrency, 50);
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = Config::default();

        opts.merge_required(&config);

        assert_eq!(opts.addresses, config.addresses.unwrap());
        assert_eq!(opts.greppable, config.greppable.unwrap());
        assert_eq!(opts.timeout, config.timeout.unwrap());
        assert_eq!(opts.concurrency, config.concurrency.unwrap());
        assert_eq!(opts.accessible, config.accessible.unwrap());
        assert_eq!(opts.protocol_version, config.protocol_version.unwrap());
        assert_eq!(opts.discovery_range, config.discovery_range.unwrap());
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::default();
        let mut config = Config::default();
        config.ports = Some((25565..=25600).collect::<Vec<u16>>());
        config.ulimit = Some(1_000);
        config.resolver = Some("1.1.1.1".to_owned());

        opts.merge_optional(&config);

        assert_eq!(opts.ports, Some((25565..=25600).collect::<Vec<u16>>()));
        assert_eq!(opts.ulimit, config.ulimit);
        assert_eq!(opts.resolver, config.resolver);
    }

    #[test]
    fn config_parses_toml() {
        let config = Config::parse(
            r#"
            addresses = ["192.168.1.0/24"]
            concurrency = 200
            well_known_ports = [25565, 19132]
            discovery_range = { start = 25565, end = 25600 }
            "#,
        )
        .unwrap();

        assert_eq!(config.addresses, Some(vec!["192.168.1.0/24".to_owned()]));
        assert_eq!(config.concurrency, Some(200));
        assert_eq!(
            config.discovery_range,
            Some(PortRange {
                start: 25565,
                end: 25600
            })
        );
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn config_reports_invalid_toml() {
        let error = Config::parse("concurrency = \"lots\"").unwrap_err();
        assert!(error.contains("in configuration file"));
    }

    #[test]
    fn empty_config_file_is_valid() {
        let config = Config::parse("").unwrap();
        assert!(config.addresses.is_none());
    }

    #[test]
    fn scan_config_converts_units() {
        let opts = Opts {
            timeout: 1_500,
            delay: 0,
            dns_timeout: 750,
            concurrency: 8,
            ..Opts::default()
        };

        let config = opts.scan_config(vec![]).unwrap();

        assert_eq!(config.timeout, Duration::from_millis(1_500));
        assert_eq!(config.delay, Duration::ZERO);
        assert_eq!(config.dns.timeout, Duration::from_millis(750));
        assert_eq!(config.concurrency, 8);
        assert!(config.dns.servers.is_empty());
    }

    #[test]
    fn scan_config_rejects_zero_concurrency() {
        let opts = Opts {
            concurrency: 0,
            ..Opts::default()
        };
        assert!(opts.scan_config(vec![]).is_err());
    }

    #[test]
    fn test_parse_ports_and_ranges_single_port() {
        let result = parse_ports_and_ranges("25565");
        assert_eq!(result, Ok(vec![25565]));
    }

    #[test]
    fn test_parse_ports_and_ranges_multiple_ports() {
        let result = parse_ports_and_ranges("25565,25566,19132");
        assert_eq!(result, Ok(vec![19132, 25565, 25566]));
    }

    #[test]
    fn test_parse_ports_and_ranges_single_range() {
        let result = parse_ports_and_ranges("1-5");
        assert_eq!(result, Ok(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_parse_ports_and_ranges_mixed_ports_and_ranges() {
        let result = parse_ports_and_ranges("80,443,1-3,8080");
        assert_eq!(result, Ok(vec![1, 2, 3, 80, 443, 8080]));
    }

    #[test]
    fn test_parse_ports_and_ranges_with_spaces() {
        let result = parse_ports_and_ranges("80, 443, 1-3, 8080");
        assert_eq!(result, Ok(vec![1, 2, 3, 80, 443, 8080]));
    }

    #[test]
    fn test_parse_ports_and_ranges_duplicates() {
        let result = parse_ports_and_ranges("25565,25565,25564-25566");
        assert_eq!(result, Ok(vec![25564, 25565, 25566]));
    }

    #[test]
    fn test_parse_ports_and_ranges_empty_input() {
        let result = parse_ports_and_ranges("");
        assert!(result
            .unwrap_err()
            .contains("No valid ports or ranges provided"));
    }

    #[test]
    fn test_parse_ports_and_ranges_invalid_port() {
        let result = parse_ports_and_ranges("80,abc,443");
        assert!(result.unwrap_err().contains("Invalid port number 'abc'"));
    }

    #[test]
    fn test_parse_ports_and_ranges_invalid_range() {
        let result = parse_ports_and_ranges("80,1-abc,443");
        assert!(result
            .unwrap_err()
            .contains("Invalid end port 'abc' in range '1-abc'"));
    }

    #[test]
    fn test_parse_ports_and_ranges_invalid_range_format() {
        let result = parse_ports_and_ranges("80,1-2-3,443");
        assert!(result
            .unwrap_err()
            .contains("Invalid range format '1-2-3'. Expected 'start-end'"));
    }

    #[test]
    fn test_parse_ports_and_ranges_reverse_range() {
        let result = parse_ports_and_ranges("80,5-1,443");
        assert!(result
            .unwrap_err()
            .contains("Start port 5 is greater than end port 1 in range '5-1'"));
    }

    #[test]
    fn test_parse_ports_and_ranges_out_of_bounds_port() {
        let result = parse_ports_and_ranges("80,70000,443");
        assert!(result.unwrap_err().contains("Invalid port number '70000'"));
    }

    #[test]
    fn test_parse_ports_and_ranges_out_of_bounds_range() {
        let result = parse_ports_and_ranges("80,1-70000,443");
        assert!(result
            .unwrap_err()
            .contains("Invalid end port '70000' in range '1-70000'"));
    }

    #[test]
    fn test_parse_ports_and_ranges_zero_port() {
        let result = parse_ports_and_ranges("80,0,443");
        assert!(result
            .unwrap_err()
            .contains("Port 0 must be between 1 and 65535"));
    }

    #[test]
    fn test_parse_ports_and_ranges_zero_in_range() {
        let result = parse_ports_and_ranges("0-10");
        assert!(result.unwrap_err().contains("must be between 1 and 65535"));
    }
}
