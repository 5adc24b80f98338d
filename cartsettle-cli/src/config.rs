//! Operator configuration.
//!
//! Loaded from a TOML file. String values may reference environment
//! variables with `$VAR` or `${VAR}`; a `.env` file in the working directory
//! is read first.
//!
//! # Example Configuration
//!
//! ```toml
//! [commerce]
//! url = "https://shop.example/api"
//! timeout_secs = 15
//!
//! [aggregator]
//! url = "https://pay.example/v1"
//! api_key = "$AGGREGATOR_API_KEY"
//!
//! [chain]
//! rpc_url = "https://mainnet.base.org"
//! chain_id = 8453
//! token = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
//! decimals = 6
//! merchant = "0x1111111111111111111111111111111111111111"
//! payer_private_key = "${PAYER_KEY}"
//!
//! [claim]
//! name = "CheckoutClaims"
//! version = "1"
//! verifying_contract = "0x2222222222222222222222222222222222222222"
//! signer_private_key = "$CLAIM_KEY"
//!
//! [checkout]
//! manual_shipping = false
//! currency = "USD"
//! session_dir = ".cartsettle/sessions"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to the configuration file (default: `cartsettle.toml`)
//! - `COMMERCE_API_URL` - Overrides `commerce.url`
//! - Keys referenced by `$VAR` in the file

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use cartsettle::aggregator::PollPolicy;
use cartsettle::money::DEFAULT_CURRENCY;
use cartsettle_evm::chain::ChainId;
use cartsettle_evm::{ClaimDomain, TokenDeployment};
use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid configuration.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A section needed by the requested command is absent.
    #[error("missing [{0}] section")]
    MissingSection(&'static str),
    /// A private key is empty, unexpanded or malformed.
    #[error("invalid private key in {field}: {reason}")]
    InvalidKey {
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Commerce backend.
    #[serde(default)]
    pub commerce: CommerceConfig,
    /// Cross-chain aggregator, required by the aggregator rail.
    #[serde(default)]
    pub aggregator: Option<AggregatorConfig>,
    /// Settlement chain, required by the direct rail and reward claims.
    #[serde(default)]
    pub chain: Option<ChainConfig>,
    /// Signature claim domain, required by the claim rail.
    #[serde(default)]
    pub claim: Option<ClaimConfig>,
    /// Checkout behaviour.
    #[serde(default)]
    pub checkout: CheckoutConfig,
}

/// Commerce backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommerceConfig {
    /// Base URL of the commerce API.
    #[serde(default = "default_commerce_url")]
    pub url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            url: default_commerce_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CommerceConfig {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Aggregator API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Base URL of the aggregator API.
    pub url: String,
    /// API key sent with every request.
    pub api_key: String,
    /// Delay between status checks in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Status checks before giving up.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl AggregatorConfig {
    /// Status polling policy.
    #[must_use]
    pub const fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_polls,
        }
    }
}

/// Settlement chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// HTTP RPC endpoint.
    pub rpc_url: String,
    /// EIP-155 chain id.
    pub chain_id: ChainId,
    /// Payment token contract.
    pub token: Address,
    /// Payment token decimals.
    pub decimals: u8,
    /// Merchant address receiving transfers.
    pub merchant: Address,
    /// Payer key (hex, with or without `0x`).
    pub payer_private_key: String,
    /// Confirmations to wait for.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Reward distributor contract; reward tokens are only claimed when set.
    #[serde(default)]
    pub distributor: Option<Address>,
}

impl ChainConfig {
    /// The payment token deployment.
    #[must_use]
    pub const fn token(&self) -> TokenDeployment {
        TokenDeployment {
            address: self.token,
            decimals: self.decimals,
        }
    }

    /// The payer signer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] if the key is missing or malformed.
    pub fn payer(&self) -> Result<PrivateKeySigner, ConfigError> {
        parse_signer("chain.payer_private_key", &self.payer_private_key)
    }
}

/// EIP-712 domain and signer for signature claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Domain name.
    pub name: String,
    /// Domain version.
    #[serde(default = "default_claim_version")]
    pub version: String,
    /// Chain id; defaults to `chain.chain_id`.
    #[serde(default)]
    pub chain_id: Option<ChainId>,
    /// Contract that verifies claims.
    pub verifying_contract: Address,
    /// Key producing claim signatures.
    pub signer_private_key: String,
}

impl ClaimConfig {
    /// The claim domain, taking the chain id from `chain` when not set here.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] if neither section names a
    /// chain id.
    pub fn domain(&self, chain: Option<&ChainConfig>) -> Result<ClaimDomain, ConfigError> {
        let chain_id = self
            .chain_id
            .or_else(|| chain.map(|c| c.chain_id))
            .ok_or(ConfigError::MissingSection("chain"))?;
        Ok(ClaimDomain {
            name: self.name.clone(),
            version: self.version.clone(),
            chain_id,
            verifying_contract: self.verifying_contract,
        })
    }

    /// The claim signer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] if the key is missing or malformed.
    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        parse_signer("claim.signer_private_key", &self.signer_private_key)
    }
}

/// Checkout behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// Let the user pick among shipping rates instead of taking the cheapest.
    #[serde(default)]
    pub manual_shipping: bool,
    /// Currency for carts that do not name one.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Directory holding persisted sessions.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            manual_shipping: false,
            currency: default_currency(),
            session_dir: default_session_dir(),
        }
    }
}

fn default_commerce_url() -> String {
    "http://localhost:3000/api".to_owned()
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    3_000
}

const fn default_max_polls() -> u32 {
    100
}

const fn default_confirmations() -> u64 {
    1
}

fn default_claim_version() -> String {
    "1".to_owned()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_owned()
}

fn default_session_dir() -> PathBuf {
    PathBuf::from(".cartsettle/sessions")
}

fn parse_signer(field: &'static str, raw: &str) -> Result<PrivateKeySigner, ConfigError> {
    let key = raw.trim();
    if key.is_empty() || key.starts_with('$') {
        return Err(ConfigError::InvalidKey {
            field,
            reason: "key is empty or its variable is unset".to_owned(),
        });
    }
    key.parse().map_err(|e: alloy_signer_local::LocalSignerError| {
        ConfigError::InvalidKey {
            field,
            reason: e.to_string(),
        }
    })
}

impl Config {
    /// Loads configuration from the path in `CONFIG`, falling back to
    /// `cartsettle.toml`. `COMMERCE_API_URL` overrides the commerce URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let _env = dotenvy::dotenv();
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "cartsettle.toml".to_owned());
        let mut config = Self::load_from(Path::new(&path))?;
        if let Ok(url) = std::env::var("COMMERCE_API_URL") {
            config.commerce.url = url;
        }
        Ok(config)
    }

    /// Loads configuration from a specific file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            String::new()
        };
        Self::parse(&content, |name| std::env::var(name).ok())
    }

    /// Parses configuration text, expanding variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the expanded text is invalid.
    pub fn parse(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let expanded = expand_vars(content, lookup);
        Ok(toml::from_str(&expanded)?)
    }

    /// The aggregator section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] if it is absent.
    pub fn aggregator(&self) -> Result<&AggregatorConfig, ConfigError> {
        self.aggregator
            .as_ref()
            .ok_or(ConfigError::MissingSection("aggregator"))
    }

    /// The chain section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] if it is absent.
    pub fn chain(&self) -> Result<&ChainConfig, ConfigError> {
        self.chain.as_ref().ok_or(ConfigError::MissingSection("chain"))
    }

    /// The claim section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] if it is absent.
    pub fn claim(&self) -> Result<&ClaimConfig, ConfigError> {
        self.claim.as_ref().ok_or(ConfigError::MissingSection("claim"))
    }
}

/// Expands `$VAR` and `${VAR}` through `lookup`. Unresolved references are
/// left as written.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();
        let mut name = String::new();
        let mut closed = false;
        while let Some(&c) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                closed = true;
                break;
            }
            if !braced && !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match lookup(&name).filter(|_| !name.is_empty()) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if closed {
                    out.push('}');
                }
            }
        }
    }

    out
}
