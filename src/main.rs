//! craftscan command line interface.
use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use log::{debug, info, warn};

use craftscan::address::read_resolver_servers;
#[cfg(unix)]
use craftscan::config::ScanConfig;
use craftscan::config::DnsConfig;
use craftscan::input::{Config, Opts};
use craftscan::scanner::Scanner;
use craftscan::server::{ProbeOutcome, ServerRecord};

/// File descriptors kept free for stdio, the resolver and the runtime.
#[cfg(unix)]
const RESERVED_FILE_DESCRIPTORS: u64 = 100;

#[cfg(not(tarpaulin_include))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut opts: Opts = Opts::read();
    let config = Config::read(opts.config_path.clone()).map_err(|e| anyhow!(e))?;
    opts.merge(&config);

    debug!("Main() `opts` arguments are {opts:?}");

    if opts.addresses.is_empty() {
        bail!("No targets given. Pass them with --addresses.");
    }

    if opts.accessible {
        colored::control::set_override(false);
    }

    let dns_servers = match &opts.resolver {
        Some(resolver) => {
            let servers = read_resolver_servers(resolver).await;
            if servers.is_empty() {
                bail!("No usable DNS resolver found in {resolver:?}");
            }
            servers
        }
        None => DnsConfig::default().servers,
    };

    let scan_config = opts
        .scan_config(dns_servers)
        .map_err(|e| anyhow!(e))
        .context("Invalid options")?;

    #[cfg(unix)]
    let scan_config = {
        let ulimit = adjust_ulimit_size(&opts);
        ScanConfig {
            concurrency: infer_concurrency(scan_config.concurrency, ulimit),
            ..scan_config
        }
    };

    let scanner = Scanner::new(&scan_config);

    match &opts.ports {
        None => {
            let servers = scanner
                .discover_all(&opts.addresses, &scan_config)
                .await?;
            print_servers(&opts, &servers)?;
        }
        Some(ports) => {
            let mut outcomes = Vec::new();
            for target in &opts.addresses {
                match scanner.scan(target, ports, &scan_config).await {
                    Ok(found) => outcomes.extend(found),
                    Err(e) => warn!("Skipping {target}: {e}"),
                }
            }
            print_outcomes(&opts, &outcomes)?;
        }
    }

    Ok(())
}

fn print_servers(opts: &Opts, servers: &[ServerRecord]) -> anyhow::Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(servers)?);
        return Ok(());
    }

    if servers.is_empty() {
        info!("No servers found.");
    }

    for server in servers {
        if opts.greppable {
            println!("{}:{}", server.host, server.port);
        } else {
            println!("{}", describe(server));
        }
    }

    Ok(())
}

fn print_outcomes(opts: &Opts, outcomes: &[ProbeOutcome]) -> anyhow::Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }

    for outcome in outcomes {
        match &outcome.record {
            Some(server) if opts.greppable => println!("{}:{}", server.host, server.port),
            Some(server) => println!("{}", describe(server)),
            None if opts.greppable => {}
            None if outcome.port_open => println!(
                "{} {}:{} {}",
                "Open".yellow(),
                outcome.target,
                outcome.port,
                outcome.error.as_deref().unwrap_or("no status response")
            ),
            None => debug!("Closed {}:{}", outcome.target, outcome.port),
        }
    }

    Ok(())
}

fn describe(server: &ServerRecord) -> String {
    let players = match (server.online_players, server.max_players) {
        (Some(online), Some(max)) => format!("{online}/{max}"),
        (Some(online), None) => online.to_string(),
        _ => String::from("?"),
    };
    let ping = server
        .ping_millis
        .map_or_else(|| String::from("-"), |ping| format!("{ping:.1}ms"));

    format!(
        "{} {}:{} [{}] {} players, ping {} | {}",
        "Server".green(),
        server.host,
        server.port,
        server.version_name.as_deref().unwrap_or("unknown").cyan(),
        players,
        ping,
        server.description.as_deref().unwrap_or_default().trim()
    )
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            info!("Automatically increasing ulimit value to {limit}.");
        } else {
            warn!("Failed to set ulimit value.");
        }
    }

    match Resource::NOFILE.get() {
        Ok((soft, _)) => soft,
        Err(e) => {
            warn!("Could not read the open file limit: {e}");
            u64::MAX
        }
    }
}

/// Lowers `requested` so that every in-flight probe can hold a socket.
#[cfg(unix)]
fn infer_concurrency(requested: usize, ulimit: u64) -> usize {
    let available = ulimit.saturating_sub(RESERVED_FILE_DESCRIPTORS);
    let available = usize::try_from(available).unwrap_or(usize::MAX);

    if requested <= available {
        return requested;
    }

    warn!(
        "File limit {ulimit} is lower than the concurrency {requested}. Consider upping it with --ulimit."
    );

    if available == 0 {
        info!("Halving concurrency to fit the file limit...");
        usize::try_from(ulimit / 2).unwrap_or(1).max(1)
    } else {
        available
    }
}
