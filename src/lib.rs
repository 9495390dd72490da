//! This crate exposes the internal functionality of the craftscan Minecraft
//! server scanner.
//!
//! craftscan finds Minecraft servers by speaking the server-list-ping
//! protocol to every address and port of a target. A target is a single IP,
//! a CIDR block or a hostname.
//!
//! ## Architecture Overview
//!
//! The core scanning behaviour is managed by
//! [`Scanner`](crate::scanner::Scanner), which runs one
//! [`Probe`](crate::scanner::Probe) per socket under a concurrency limit.
//! A scan goes through these steps:
//!
//! 1. **Configuration**: CLI flags and the config file become a
//!    [`ScanConfig`](crate::config::ScanConfig)
//! 2. **Resolution**: targets are expanded into addresses by
//!    [`AddressResolver`](crate::address::AddressResolver)
//! 3. **Probing**: each socket gets a handshake, a status request and a ping,
//!    encoded by [`protocol`]
//! 4. **Results**: answering servers become
//!    [`ServerRecord`](crate::server::ServerRecord)s, sorted by address and
//!    port
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use craftscan::config::ScanConfig;
//! use craftscan::scanner::Scanner;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ScanConfig::default();
//!     let scanner = Scanner::new(&config);
//!
//!     for server in scanner.discover("192.168.1.0/24", &config).await? {
//!         println!(
//!             "{}:{} {} ({:?} players)",
//!             server.host,
//!             server.port,
//!             server.version_name.unwrap_or_default(),
//!             server.online_players
//!         );
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! A probe never fails a scan. Closed ports, timeouts and garbage answers are
//! reported in the [`ProbeOutcome`](crate::server::ProbeOutcome) of that
//! socket. Only an invalid configuration or a target that cannot be resolved
//! is returned as a [`ScanError`](crate::scanner::ScanError).
#![allow(clippy::needless_doctest_main)]

pub mod address;

pub mod config;

pub mod input;

pub mod protocol;

pub mod scanner;

pub mod server;
