//! Configuration management for lightauth
//!
//! Configuration is loaded from a TOML file. The node section carries the
//! Lightning node dial parameters; the `[routes.*]` tables seed the server's
//! route table at startup.
//!
//! # Example Configuration File
//!
//! ```toml
//! server_addr = "localhost:10009"
//! ca_file = "/home/alice/.lnd/tls.cert"
//! server_host_override = ""
//!
//! [routes.paid-api]
//! name = "GET/x"
//! fee = 10
//! max_invoices = 2
//! mode = "discrete"
//!
//! [routes.metered-api]
//! name = "GET/stream"
//! fee = 1
//! max_invoices = 3
//! mode = "time"
//! period = "second"
//! ```

use crate::{AuthResult, LightAuthError};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Authorization mode of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Each settled invoice buys one fixed period of authorized time
    Time,
    /// Each settled invoice authorizes exactly one request
    Discrete,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Time => write!(f, "time"),
            Mode::Discrete => write!(f, "discrete"),
        }
    }
}

impl FromStr for Mode {
    type Err = LightAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(Mode::Time),
            "discrete" => Ok(Mode::Discrete),
            other => Err(LightAuthError::Protocol(format!(
                "unknown authorization mode: {other}"
            ))),
        }
    }
}

/// Duration one settled invoice buys in time mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// One millisecond per settled invoice
    #[default]
    Millisecond,
    /// One second per settled invoice
    Second,
    /// One minute per settled invoice
    Minute,
}

impl Period {
    /// The concrete duration this period unit represents
    pub fn duration(&self) -> Duration {
        match self {
            Period::Millisecond => Duration::milliseconds(1),
            Period::Second => Duration::seconds(1),
            Period::Minute => Duration::minutes(1),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Millisecond => write!(f, "millisecond"),
            Period::Second => write!(f, "second"),
            Period::Minute => write!(f, "minute"),
        }
    }
}

impl FromStr for Period {
    type Err = LightAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "millisecond" => Ok(Period::Millisecond),
            "second" => Ok(Period::Second),
            "minute" => Ok(Period::Minute),
            other => Err(LightAuthError::Protocol(format!(
                "unknown time period: {other}"
            ))),
        }
    }
}

/// Configuration of one protected route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route identifier: HTTP method concatenated with the path, e.g. `GET/x`
    #[serde(alias = "Name")]
    pub name: String,

    /// Satoshi fee per invoice
    #[serde(alias = "Fee")]
    pub fee: u64,

    /// How many unsettled invoices the server keeps outstanding per client
    #[serde(alias = "MaxInvoices")]
    pub max_invoices: usize,

    /// Authorization mode
    #[serde(alias = "Mode")]
    pub mode: Mode,

    /// Time period per invoice; only meaningful in time mode
    #[serde(default, alias = "Period")]
    pub period: Period,
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Lightning node gRPC address
    #[serde(default = "default_server_addr", alias = "ServerAddr")]
    pub server_addr: String,

    /// Path to the node's TLS certificate
    #[serde(default, alias = "CAFile")]
    pub ca_file: Option<PathBuf>,

    /// Server name used to verify the hostname returned by the TLS handshake
    #[serde(default, alias = "ServerHostOverride")]
    pub server_host_override: Option<String>,

    /// Protected routes, seeded into the route table at server startup
    #[serde(default, alias = "Routes")]
    pub routes: HashMap<String, RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            ca_file: None,
            server_host_override: None,
            routes: HashMap::new(),
        }
    }
}

fn default_server_addr() -> String {
    "localhost:10009".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            LightAuthError::Config(format!("could not read {}: {e}", path.display()))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            LightAuthError::Config(format!("could not parse {}: {e}", path.display()))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> AuthResult<()> {
        if self.server_addr.is_empty() {
            return Err(LightAuthError::Config(
                "server_addr cannot be empty".to_string(),
            ));
        }

        for (key, route) in &self.routes {
            if route.name.is_empty() {
                return Err(LightAuthError::Config(format!(
                    "route {key}: name cannot be empty"
                )));
            }
            if route.fee == 0 {
                return Err(LightAuthError::Config(format!(
                    "route {key}: fee must be at least 1 satoshi"
                )));
            }
            if route.max_invoices == 0 {
                return Err(LightAuthError::Config(format!(
                    "route {key}: max_invoices must be at least 1"
                )));
            }
        }

        Ok(())
    }
}
