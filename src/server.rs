//! Records describing what a scan found.
//!
//! The status document a server returns is loosely specified and differs
//! between vanilla, Forge and proxy implementations, so every field of
//! [`StatusResponse`] is optional and the mapping into [`ServerRecord`]
//! tolerates absence everywhere.
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize as _, Deserializer};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// One player entry from the status `players.sample` list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlayerSample {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

/// One mod advertised by a modded server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModInfo {
    #[serde(default, alias = "modid", alias = "modId")]
    pub name: String,
    #[serde(default, alias = "modmarker")]
    pub version: String,
}

/// A server that answered the status exchange.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub host: String,
    pub port: u16,
    pub protocol_version: Option<i64>,
    pub version_name: Option<String>,
    pub max_players: Option<i64>,
    pub online_players: Option<i64>,
    pub player_sample: Vec<PlayerSample>,
    pub description: Option<String>,
    pub favicon: Option<String>,
    pub mod_loader: Option<String>,
    pub mod_list: Option<Vec<ModInfo>>,
    pub ping_millis: Option<f64>,
    pub response_millis: f64,
    pub responded_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Maps a decoded status document into a record.
    ///
    /// `ping` is the best-effort round trip of the ping packet and `response_time`
    /// the duration of the whole exchange.
    #[must_use]
    pub fn from_status(
        host: String,
        port: u16,
        status: StatusResponse,
        ping: Option<Duration>,
        response_time: Duration,
    ) -> Self {
        let StatusResponse {
            version,
            players,
            description,
            favicon,
            modinfo,
            forge_data,
        } = status;
        let version = version.unwrap_or_default();
        let players = players.unwrap_or_default();

        let (mod_loader, mod_list) = match (modinfo, forge_data) {
            (Some(modinfo), _) => (modinfo.kind, Some(modinfo.mod_list.unwrap_or_default())),
            (None, Some(forge)) => (
                Some("FORGE".to_owned()),
                Some(forge.mods.unwrap_or_default()),
            ),
            (None, None) => (None, None),
        };

        Self {
            host,
            port,
            protocol_version: version.protocol,
            version_name: version.name,
            max_players: players.max,
            online_players: players.online,
            player_sample: players.sample.unwrap_or_default(),
            description: description.as_ref().map(description_text),
            favicon,
            mod_loader,
            mod_list,
            ping_millis: ping.map(as_millis_f64),
            response_millis: as_millis_f64(response_time),
            responded_at: Utc::now(),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

/// Plain strings are kept verbatim; text components contribute only their
/// top-level `text` field.
fn description_text(description: &Value) -> String {
    match description {
        Value::String(text) => text.clone(),
        Value::Object(component) => component
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        other => other.to_string(),
    }
}

/// The result of probing one (address, port) pair.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub target: IpAddr,
    pub port: u16,
    pub port_open: bool,
    pub is_service_match: bool,
    pub record: Option<ServerRecord>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl ProbeOutcome {
    /// The connection could not be established.
    #[must_use]
    pub const fn closed(target: IpAddr, port: u16, elapsed: Duration) -> Self {
        Self {
            target,
            port,
            port_open: false,
            is_service_match: false,
            record: None,
            error: None,
            elapsed,
        }
    }

    /// The port accepted a connection but did not speak the protocol.
    #[must_use]
    pub fn mismatch(target: IpAddr, port: u16, error: String, elapsed: Duration) -> Self {
        Self {
            target,
            port,
            port_open: true,
            is_service_match: false,
            record: None,
            error: Some(error),
            elapsed,
        }
    }

    /// The port answered with a valid status response.
    #[must_use]
    pub const fn matched(target: IpAddr, port: u16, record: ServerRecord, elapsed: Duration) -> Self {
        Self {
            target,
            port,
            port_open: true,
            is_service_match: true,
            record: Some(record),
            error: None,
            elapsed,
        }
    }
}

/// Status document as sent by the server, every field optional.
///
/// A field that is `null` or of an unexpected type is treated as absent
/// instead of failing the whole document.
#[derive(Deserialize, Debug, Default)]
pub struct StatusResponse {
    #[serde(default, deserialize_with = "lenient")]
    version: Option<VersionInfo>,
    #[serde(default, deserialize_with = "lenient")]
    players: Option<PlayersInfo>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    favicon: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    modinfo: Option<LegacyForgeInfo>,
    #[serde(default, rename = "forgeData", deserialize_with = "lenient")]
    forge_data: Option<ForgeData>,
}

impl StatusResponse {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Deserializes through [`Value`], mapping anything that does not fit `T` to
/// `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

#[derive(Deserialize, Debug, Default)]
struct VersionInfo {
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    protocol: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
struct PlayersInfo {
    #[serde(default, deserialize_with = "lenient")]
    max: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    online: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    sample: Option<Vec<PlayerSample>>,
}

/// `modinfo` block sent by Forge up to 1.12.
#[derive(Deserialize, Debug)]
struct LegacyForgeInfo {
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    kind: Option<String>,
    #[serde(default, rename = "modList", deserialize_with = "lenient")]
    mod_list: Option<Vec<ModInfo>>,
}

/// `forgeData` block sent by Forge since 1.13.
#[derive(Deserialize, Debug)]
struct ForgeData {
    #[serde(default, deserialize_with = "lenient")]
    mods: Option<Vec<ModInfo>>,
}
