//! Session configuration, parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use bitcoin::{Address, Amount, Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use timegate_policy::{Scheme, Variant};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSection,

    /// Bitcoin / explorer settings
    #[serde(default)]
    pub bitcoin: BitcoinSection,

    /// Key material
    #[serde(default)]
    pub seed: SeedSection,

    /// Which policy to build and how to spend from it
    #[serde(default)]
    pub policy: PolicySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Bitcoin network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// Bitcoin network: "bitcoin", "testnet", "testnet4", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Esplora base URL; defaults per network
    #[serde(default)]
    pub explorer_url: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            explorer_url: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SeedSection {
    /// BIP-39 English mnemonic
    #[serde(default)]
    pub mnemonic: String,

    /// Optional BIP-39 passphrase
    #[serde(default)]
    pub passphrase: String,
}

impl std::fmt::Debug for SeedSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedSection")
            .field("mnemonic", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_variant")]
    pub variant: String,

    /// Fixed fee per spend
    #[serde(default = "default_fee")]
    pub fee_sats: u64,

    /// Spend destination; faucet return address on test networks if unset
    #[serde(default)]
    pub destination: Option<String>,

    /// Branch name → wait in blocks
    #[serde(default)]
    pub waits: BTreeMap<String, u32>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            variant: default_variant(),
            fee_sats: default_fee(),
            destination: None,
            waits: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network() -> String {
    "testnet4".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_variant() -> String {
    Variant::SelfCustody.name().to_string()
}

fn default_fee() -> u64 {
    200
}

/// Public faucet return addresses
fn faucet_return_address(network: &str) -> Option<&'static str> {
    match network {
        "testnet" | "testnet3" => Some("tb1qerzrlxcfu24davlur5sqmgzzgsal6wusda40er"),
        "testnet4" => Some("tb1qn9rvr53m7qvrpysx48svuxsgahs88xfsskx367"),
        _ => None,
    }
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `TIMEGATE_LOG_LEVEL`
    /// - `TIMEGATE_NETWORK`
    /// - `TIMEGATE_EXPLORER_URL`
    /// - `TIMEGATE_MNEMONIC`
    /// - `TIMEGATE_PASSPHRASE`
    /// - `TIMEGATE_VARIANT`
    /// - `TIMEGATE_FEE_SATS`
    /// - `TIMEGATE_DESTINATION`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TIMEGATE_LOG_LEVEL") {
            self.session.log_level = v;
        }
        if let Ok(v) = std::env::var("TIMEGATE_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("TIMEGATE_EXPLORER_URL") {
            self.bitcoin.explorer_url = Some(v);
        }
        if let Ok(v) = std::env::var("TIMEGATE_MNEMONIC") {
            self.seed.mnemonic = v;
        }
        if let Ok(v) = std::env::var("TIMEGATE_PASSPHRASE") {
            self.seed.passphrase = v;
        }
        if let Ok(v) = std::env::var("TIMEGATE_VARIANT") {
            self.policy.variant = v;
        }
        if let Ok(v) = std::env::var("TIMEGATE_FEE_SATS") {
            self.override_fee(&v);
        }
        if let Ok(v) = std::env::var("TIMEGATE_DESTINATION") {
            self.policy.destination = Some(v);
        }
    }

    /// Set the fee from a satoshi string, keeping the current fee if it does not parse
    fn override_fee(&mut self, value: &str) {
        match value.trim().parse::<u64>() {
            Ok(sats) => self.policy.fee_sats = sats,
            Err(e) => log::warn!(
                "ignoring TIMEGATE_FEE_SATS={:?} ({}), keeping fee of {} sats",
                value,
                e,
                self.policy.fee_sats
            ),
        }
    }

    /// Parse the bitcoin network string to a `bitcoin::Network`.
    pub fn network(&self) -> Network {
        match self.bitcoin.network.as_str() {
            "testnet" | "testnet3" => Network::Testnet,
            "testnet4" => Network::Testnet4,
            "signet" => Network::Signet,
            "regtest" => Network::Regtest,
            _ => Network::Bitcoin,
        }
    }

    /// Configured explorer, or the default for the network.
    pub fn explorer_url(&self) -> Result<String> {
        match &self.bitcoin.explorer_url {
            Some(url) => Ok(url.clone()),
            None => timegate_esplora::default_explorer(&self.bitcoin.network)
                .map(str::to_string)
                .with_context(|| {
                    format!(
                        "bitcoin.explorer_url is required for network {}",
                        self.bitcoin.network
                    )
                }),
        }
    }

    pub fn fee(&self) -> Amount {
        Amount::from_sat(self.policy.fee_sats)
    }

    /// The configured variant's scheme with wait overrides applied.
    pub fn scheme(&self) -> Result<Scheme> {
        let variant = Variant::from_str(&self.policy.variant)?;
        let scheme = variant
            .scheme()
            .with_waits(&self.policy.waits)
            .with_context(|| format!("Invalid [policy.waits] for variant {}", variant))?;
        Ok(scheme)
    }

    /// Spend destination checked against the network.
    pub fn destination(&self) -> Result<Address> {
        let raw = match &self.policy.destination {
            Some(d) => d.as_str(),
            None => faucet_return_address(&self.bitcoin.network).with_context(|| {
                format!(
                    "policy.destination is required for network {}",
                    self.bitcoin.network
                )
            })?,
        };
        let address = Address::from_str(raw)
            .with_context(|| format!("Invalid destination address: {}", raw))?
            .require_network(self.network())
            .with_context(|| format!("Destination {} is not a {} address", raw, self.bitcoin.network))?;
        Ok(address)
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            matches!(
                self.bitcoin.network.as_str(),
                "bitcoin" | "mainnet" | "testnet" | "testnet3" | "testnet4" | "signet" | "regtest"
            ),
            "bitcoin.network must be one of bitcoin, testnet, testnet4, signet, regtest"
        );

        anyhow::ensure!(
            self.bitcoin.timeout_secs > 0,
            "bitcoin.timeout_secs must be > 0"
        );

        anyhow::ensure!(
            !self.seed.mnemonic.trim().is_empty(),
            "seed.mnemonic must not be empty"
        );

        anyhow::ensure!(self.policy.fee_sats > 0, "policy.fee_sats must be > 0");

        // Variant and waits
        self.scheme()?;

        self.explorer_url()?;
        self.destination()?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
