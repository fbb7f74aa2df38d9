//! Configuration for the gate server.
//!
//! Configuration comes from a JSON file named on the command line (or the
//! `CONFIG` environment variable), with serde defaults for everything but
//! the payment terms and the resource table. `.env` values are loaded by
//! the binary before parsing.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use url::Url;

use crate::gate::PaymentTerms;
use crate::proto::Address;
use crate::registry::{RegistryError, ResourceRegistry};
use crate::util::MoneyAmount;

/// CLI arguments for the gate server.
#[derive(Parser, Debug)]
#[command(name = "pressgate")]
#[command(about = "Pay-per-resource HTTP 402 gate server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One resource entry as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub id: String,
    /// Decimal price string, e.g. `"0.05"`. `"0"` marks a free resource.
    pub price: MoneyAmount,
    pub description: String,
    /// Seeded clap count shown before any live increments.
    #[serde(default)]
    pub base_claps: u64,
}

/// The payment asset.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    /// Token contract address.
    pub address: Address,
    /// Token symbol, e.g. `USDC`.
    #[serde(default = "config_defaults::asset_name")]
    pub name: String,
    /// Token decimal places.
    #[serde(default = "config_defaults::asset_decimals")]
    pub decimals: u32,
}

/// Server configuration.
///
/// Fields use serde defaults so a minimal config only names the asset, the
/// recipient wallet, and the resource table.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::port")]
    port: u16,
    #[serde(default = "config_defaults::host")]
    host: IpAddr,
    #[serde(default = "config_defaults::network")]
    network: String,
    asset: AssetConfig,
    /// Recipient of all payments.
    pay_to: Address,
    #[serde(default = "config_defaults::facilitator_url")]
    facilitator_url: Url,
    /// Advisory challenge validity window.
    #[serde(default = "config_defaults::max_timeout_seconds")]
    max_timeout_seconds: u64,
    /// Accept settled-transaction proofs on shape alone. Demo tier; off by
    /// default.
    #[serde(default)]
    demo_mode: bool,
    /// Path for the JSON state file. Without it, state is in-memory only.
    #[serde(default)]
    state_file: Option<PathBuf>,
    #[serde(default)]
    resources: Vec<ResourceConfig>,
}

mod config_defaults {
    use super::*;

    pub fn port() -> u16 {
        8080
    }

    pub fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn network() -> String {
        "base-sepolia".to_string()
    }

    pub fn facilitator_url() -> Url {
        Url::parse("https://x402.org/facilitator").expect("valid default URL")
    }

    pub fn max_timeout_seconds() -> u64 {
        60
    }

    pub fn asset_name() -> String {
        "USDC".to_string()
    }

    pub fn asset_decimals() -> u32 {
        6
    }
}

impl Config {
    /// Loads configuration from the file named by CLI arguments or the
    /// `CONFIG` environment variable.
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();
        Self::from_file(args.config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn facilitator_url(&self) -> &Url {
        &self.facilitator_url
    }

    pub fn demo_mode(&self) -> bool {
        self.demo_mode
    }

    pub fn state_file(&self) -> Option<&PathBuf> {
        self.state_file.as_ref()
    }

    /// Payment terms shared by every challenge.
    pub fn payment_terms(&self) -> PaymentTerms {
        PaymentTerms {
            network: self.network.clone(),
            asset: self.asset.address,
            asset_name: self.asset.name.clone(),
            asset_decimals: self.asset.decimals,
            pay_to: self.pay_to,
            max_timeout_seconds: self.max_timeout_seconds,
        }
    }

    /// Builds the resource registry, validating and scaling every price.
    pub fn registry(&self) -> Result<ResourceRegistry, ConfigError> {
        let entries = self.resources.iter().map(|r| {
            (
                r.id.clone(),
                r.price.clone(),
                r.description.clone(),
                r.base_claps,
            )
        });
        Ok(ResourceRegistry::build(entries, self.asset.decimals)?)
    }

    /// Seeded clap counts per resource.
    pub fn claps_base(&self) -> HashMap<String, u64> {
        self.resources
            .iter()
            .map(|r| (r.id.clone(), r.base_claps))
            .collect()
    }
}
