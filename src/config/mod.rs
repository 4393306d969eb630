use crate::error::PipelineError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Which flow table this deployment tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    #[default]
    Btc,
    Eth,
}

impl Asset {
    pub fn page_url(self) -> &'static str {
        match self {
            Asset::Btc => "https://farside.co.uk/bitcoin-etf-flow-all-data/",
            Asset::Eth => "https://farside.co.uk/ethereum-etf-flow-all-data/",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Asset::Btc => "flows",
            Asset::Eth => "eth_flows",
        }
    }

    /// Tickers with a column in the store, in column order.
    pub fn tickers(self) -> &'static [&'static str] {
        match self {
            Asset::Btc => &[
                "IBIT", "FBTC", "BITB", "ARKB", "BTCO", "EZBC", "BRRR", "HODL", "BTCW", "GBTC", "BTC",
            ],
            Asset::Eth => &["ETHA", "FETH", "ETHW", "CETH", "ETHV", "QETH", "EZET", "ETHE", "ETH"],
        }
    }
}

/// Market selection, with optional overrides of the asset preset
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MarketConfig {
    #[serde(default)]
    pub asset: Asset,
    pub page_url: Option<String>,
    pub table: Option<String>,
    pub tickers: Option<Vec<String>>,
}

/// Scraper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// Fetch through `<proxy_url>?url=<page>` when set.
    pub proxy_url: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// What to do when the store fails on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFailurePolicy {
    #[default]
    Halt,
    Skip,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Most-recent days processed by `update`; 0 = all.
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default)]
    pub on_storage_error: StorageFailurePolicy,
}

/// Telegram alerting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; etf-flows/0.1)".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/flows.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_window() -> usize {
    5
}
fn default_environment() -> String {
    "Dev".to_string()
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path(), run_migrations: true }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { window: default_window(), on_storage_error: StorageFailurePolicy::Halt }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            channel_id: None,
            environment: default_environment(),
        }
    }
}

// ── Resolved market ──────────────────────────────────────────────────────────

/// Page, table and column set after presets and overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub page_url: String,
    pub table: String,
    pub tickers: Vec<String>,
}

/// Table and column names end up in SQL, so keep them to plain identifiers.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("FLOWS").separator("__"))
            .build()?;

        let mut app_cfg: AppConfig = cfg.try_deserialize()?;

        if app_cfg.notify.bot_token.is_none() {
            app_cfg.notify.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        }
        if app_cfg.notify.channel_id.is_none() {
            app_cfg.notify.channel_id = std::env::var("TELEGRAM_CHANNEL_ID").ok();
        }

        Ok(app_cfg)
    }

    /// Apply the asset preset and check everything the pipeline needs.
    pub fn resolve(&self) -> Result<Market, PipelineError> {
        let m = &self.market;
        let page_url = m.page_url.clone().unwrap_or_else(|| m.asset.page_url().to_string());
        let table = m.table.clone().unwrap_or_else(|| m.asset.table().to_string());
        let tickers = m
            .tickers
            .clone()
            .unwrap_or_else(|| m.asset.tickers().iter().map(|t| t.to_string()).collect());

        if page_url.trim().is_empty() {
            return Err(PipelineError::ConfigurationMissing("market.page_url".into()));
        }
        if !is_identifier(&table) {
            return Err(PipelineError::ConfigurationMissing(format!(
                "market.table must be a plain identifier, got {:?}",
                table
            )));
        }
        if tickers.is_empty() {
            return Err(PipelineError::ConfigurationMissing("market.tickers is empty".into()));
        }
        if let Some(bad) = tickers.iter().find(|t| !is_identifier(t)) {
            return Err(PipelineError::ConfigurationMissing(format!(
                "ticker {:?} is not a plain identifier",
                bad
            )));
        }
        if self.notify.enabled {
            if self.notify.bot_token.as_deref().is_none_or(str::is_empty) {
                return Err(PipelineError::ConfigurationMissing("notify.bot_token".into()));
            }
            if self.notify.channel_id.as_deref().is_none_or(str::is_empty) {
                return Err(PipelineError::ConfigurationMissing("notify.channel_id".into()));
            }
        }

        Ok(Market { page_url, table, tickers })
    }
}
