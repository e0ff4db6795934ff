// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address as EthAddress;
use proof_finalizer_pg_db::sessions::validate_table_name;
use proof_finalizer_pg_db::{database_url_from_parts, DbArgs};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ingestion::DEFAULT_PAGE_SIZE;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::submitter::SubmitterConfig;
use crate::types::RequestKind;

pub const DEFAULT_GAS_LIMIT: u64 = 270_000;
pub const DEFAULT_START_POSITION: u64 = 1;

/// A string that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    // Full connection URL. Takes precedence over the discrete credentials below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Secret>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Secret,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub database: String,
    // Table or view (optionally schema-qualified) holding the session rows
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FinalizerConfig {
    // JSON-RPC endpoint of the observer chain
    pub rpc_endpoint: String,
    // Expected sender address. Checked against the private key when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer_address: Option<String>,
    // Hex-encoded secp256k1 key of the finalizer account
    pub finalizer_private_key: Secret,
    // ProofChain contract address
    pub proofchain_address: String,
    #[serde(default)]
    pub request_kind: RequestKind,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    // Explicit start position for ingestion; overrides the cursor file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id_start: Option<u64>,
    // Where the cursor is persisted between runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_file: Option<PathBuf>,
    pub database: DatabaseConfig,
    #[serde(default = "default_ingestion_poll_interval_secs")]
    pub ingestion_poll_interval_secs: u64,
    // Rows read from the session view per query
    #[serde(default = "default_ingestion_page_size")]
    pub ingestion_page_size: usize,
    #[serde(default = "default_height_poll_interval_secs")]
    pub height_poll_interval_secs: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_nonce_refresh_delay_secs")]
    pub nonce_refresh_delay_secs: u64,
    #[serde(default = "default_refinalize_batch_size")]
    pub refinalize_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_ingestion_poll_interval_secs() -> u64 {
    40
}

fn default_ingestion_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_height_poll_interval_secs() -> u64 {
    12
}

fn default_confirmation_timeout_secs() -> u64 {
    600
}

fn default_receipt_timeout_secs() -> u64 {
    60
}

fn default_nonce_refresh_delay_secs() -> u64 {
    5
}

fn default_refinalize_batch_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    2
}

/// Configuration with every address, key and URL parsed.
#[derive(Clone)]
pub struct LoadedFinalizerConfig {
    pub rpc_endpoint: Url,
    pub wallet: LocalWallet,
    pub proofchain_address: EthAddress,
    pub request_kind: RequestKind,
    pub gas_limit: u64,
    pub start_override: Option<u64>,
    pub cursor_file: Option<PathBuf>,
    pub database_url: Url,
    pub table_name: String,
    pub ingestion_poll_interval: Duration,
    pub ingestion_page_size: usize,
    pub scheduler: SchedulerConfig,
    pub submitter: SubmitterConfig,
}

// The database URL may carry a password and the wallet holds the key, so only the sender address
// and a password-free URL are printed.
impl fmt::Debug for LoadedFinalizerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut database_url = self.database_url.clone();
        if database_url.password().is_some() {
            let _ = database_url.set_password(Some("<redacted>"));
        }
        f.debug_struct("LoadedFinalizerConfig")
            .field("rpc_endpoint", &self.rpc_endpoint.as_str())
            .field("sender", &self.wallet.address())
            .field("proofchain_address", &self.proofchain_address)
            .field("request_kind", &self.request_kind)
            .field("gas_limit", &self.gas_limit)
            .field("start_override", &self.start_override)
            .field("cursor_file", &self.cursor_file)
            .field("database_url", &database_url.as_str())
            .field("table_name", &self.table_name)
            .field("ingestion_poll_interval", &self.ingestion_poll_interval)
            .field("ingestion_page_size", &self.ingestion_page_size)
            .field("scheduler", &self.scheduler)
            .field("submitter", &self.submitter)
            .finish()
    }
}

impl FinalizerConfig {
    /// Reads a YAML (`.yaml`/`.yml`) or JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?,
            _ => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?,
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<LoadedFinalizerConfig> {
        let rpc_endpoint = Url::parse(&self.rpc_endpoint)
            .with_context(|| format!("Invalid RPC endpoint {:?}", self.rpc_endpoint))?;

        let wallet = parse_private_key(self.finalizer_private_key.expose())?;
        if let Some(expected) = &self.finalizer_address {
            let expected = parse_address(expected).context("Invalid finalizer address")?;
            if expected != wallet.address() {
                return Err(anyhow!(
                    "Finalizer address {:?} does not match private key address {:?}",
                    expected,
                    wallet.address()
                ));
            }
        }
        let proofchain_address =
            parse_address(&self.proofchain_address).context("Invalid ProofChain address")?;

        if self.gas_limit == 0 {
            return Err(anyhow!("Gas limit must be positive"));
        }
        if self.refinalize_batch_size == 0 {
            return Err(anyhow!("Refinalize batch size must be positive"));
        }
        if self.ingestion_page_size == 0 {
            return Err(anyhow!("Ingestion page size must be positive"));
        }

        let database_url = self.database_url()?;
        validate_table_name(&self.database.table_name)?;

        Ok(LoadedFinalizerConfig {
            rpc_endpoint,
            wallet,
            proofchain_address,
            request_kind: self.request_kind,
            gas_limit: self.gas_limit,
            start_override: self.block_id_start,
            cursor_file: self.cursor_file.clone(),
            database_url,
            table_name: self.database.table_name.clone(),
            ingestion_poll_interval: Duration::from_secs(self.ingestion_poll_interval_secs),
            ingestion_page_size: self.ingestion_page_size,
            scheduler: SchedulerConfig {
                height_poll_interval: Duration::from_secs(self.height_poll_interval_secs),
                confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
                refinalize_batch_size: self.refinalize_batch_size,
            },
            submitter: SubmitterConfig {
                kind: self.request_kind,
                receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
                nonce_refresh_delay: Duration::from_secs(self.nonce_refresh_delay_secs),
                retry: RetryPolicy {
                    max_retries: self.max_retries,
                    ..Default::default()
                },
            },
        })
    }

    fn database_url(&self) -> Result<Url> {
        let db = &self.database;
        if let Some(url) = &db.url {
            return Url::parse(url.expose()).context("Invalid database URL");
        }
        if db.host.is_empty() || db.database.is_empty() || db.user.is_empty() {
            return Err(anyhow!(
                "Database URL or user, host and database name must be configured"
            ));
        }
        database_url_from_parts(&db.user, db.password.expose(), &db.host, &db.database)
    }
}

fn parse_private_key(key: &str) -> Result<LocalWallet> {
    let bytes = hex::decode(key.trim().trim_start_matches("0x"))
        .context("Finalizer private key is not valid hex")?;
    LocalWallet::from_bytes(&bytes).context("Finalizer private key is not a valid secp256k1 key")
}

fn parse_address(address: &str) -> Result<EthAddress> {
    EthAddress::from_str(address.trim()).map_err(|e| anyhow!("{:?}: {}", address, e))
}

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version)]
pub struct Args {
    #[command(flatten)]
    pub db_args: DbArgs,
    // YAML or JSON file with a full `FinalizerConfig`. Flags and environment variables below
    // override its values.
    #[clap(long)]
    pub config_path: Option<PathBuf>,
    #[clap(env = "RPC_ENDPOINT", long)]
    pub rpc_endpoint: Option<String>,
    #[clap(env = "FINALIZER_ADDRESS", long)]
    pub finalizer_address: Option<String>,
    #[clap(env = "FINALIZER_PRIVATE_KEY", long, hide_env_values = true)]
    pub finalizer_private_key: Option<Secret>,
    #[clap(env = "PROOFCHAIN_ADDRESS", long)]
    pub proofchain_address: Option<String>,
    // Negative means "not set", as in the legacy deployment
    #[clap(env = "BLOCK_ID_START", long, allow_negative_numbers = true)]
    pub block_id_start: Option<i64>,
    #[clap(env = "REQUEST_KIND", long)]
    pub request_kind: Option<RequestKind>,
    #[clap(env = "GAS_LIMIT", long)]
    pub gas_limit: Option<u64>,
    #[clap(env = "CURSOR_FILE", long)]
    pub cursor_file: Option<PathBuf>,
    #[clap(env = "DATABASE_URL", long, hide_env_values = true)]
    pub database_url: Option<Secret>,
    #[clap(env = "DB_USER", long)]
    pub db_user: Option<String>,
    #[clap(env = "DB_PASSWORD", long, hide_env_values = true)]
    pub db_password: Option<Secret>,
    #[clap(env = "DB_HOST", long)]
    pub db_host: Option<String>,
    #[clap(env = "DB_DATABASE", long)]
    pub db_database: Option<String>,
    #[clap(env = "CHAIN_TABLE_NAME", long)]
    pub chain_table_name: Option<String>,
}

impl Args {
    /// Merge flags and environment over the optional config file.
    pub fn into_config(self) -> Result<FinalizerConfig> {
        let base = match &self.config_path {
            Some(path) => Some(FinalizerConfig::load(path)?),
            None => None,
        };

        fn required<T>(value: Option<T>, from_file: Option<T>, name: &str) -> Result<T> {
            value
                .or(from_file)
                .ok_or_else(|| anyhow!("{} must be set (flag, environment or config file)", name))
        }

        let base_db = base.as_ref().map(|c| c.database.clone()).unwrap_or_default();
        let database = DatabaseConfig {
            url: self.database_url.or(base_db.url),
            user: self.db_user.unwrap_or(base_db.user),
            password: self.db_password.unwrap_or(base_db.password),
            host: self.db_host.unwrap_or(base_db.host),
            database: self.db_database.unwrap_or(base_db.database),
            table_name: required(
                self.chain_table_name,
                base.as_ref().map(|c| c.database.table_name.clone()),
                "CHAIN_TABLE_NAME",
            )?,
        };

        let block_id_start = match self.block_id_start {
            Some(start) if start >= 0 => Some(start as u64),
            Some(_) => None,
            None => base.as_ref().and_then(|c| c.block_id_start),
        };

        Ok(FinalizerConfig {
            rpc_endpoint: required(
                self.rpc_endpoint,
                base.as_ref().map(|c| c.rpc_endpoint.clone()),
                "RPC_ENDPOINT",
            )?,
            finalizer_address: self
                .finalizer_address
                .or_else(|| base.as_ref().and_then(|c| c.finalizer_address.clone())),
            finalizer_private_key: required(
                self.finalizer_private_key,
                base.as_ref().map(|c| c.finalizer_private_key.clone()),
                "FINALIZER_PRIVATE_KEY",
            )?,
            proofchain_address: required(
                self.proofchain_address,
                base.as_ref().map(|c| c.proofchain_address.clone()),
                "PROOFCHAIN_ADDRESS",
            )?,
            request_kind: self
                .request_kind
                .or(base.as_ref().map(|c| c.request_kind))
                .unwrap_or_default(),
            gas_limit: self
                .gas_limit
                .or(base.as_ref().map(|c| c.gas_limit))
                .unwrap_or(DEFAULT_GAS_LIMIT),
            block_id_start,
            cursor_file: self
                .cursor_file
                .or_else(|| base.as_ref().and_then(|c| c.cursor_file.clone())),
            database,
            ingestion_poll_interval_secs: base
                .as_ref()
                .map_or_else(default_ingestion_poll_interval_secs, |c| {
                    c.ingestion_poll_interval_secs
                }),
            ingestion_page_size: base
                .as_ref()
                .map_or_else(default_ingestion_page_size, |c| c.ingestion_page_size),
            height_poll_interval_secs: base
                .as_ref()
                .map_or_else(default_height_poll_interval_secs, |c| c.height_poll_interval_secs),
            confirmation_timeout_secs: base
                .as_ref()
                .map_or_else(default_confirmation_timeout_secs, |c| c.confirmation_timeout_secs),
            receipt_timeout_secs: base
                .as_ref()
                .map_or_else(default_receipt_timeout_secs, |c| c.receipt_timeout_secs),
            nonce_refresh_delay_secs: base
                .as_ref()
                .map_or_else(default_nonce_refresh_delay_secs, |c| c.nonce_refresh_delay_secs),
            refinalize_batch_size: base
                .as_ref()
                .map_or_else(default_refinalize_batch_size, |c| c.refinalize_batch_size),
            max_retries: base
                .as_ref()
                .map_or_else(default_max_retries, |c| c.max_retries),
        })
    }
}
