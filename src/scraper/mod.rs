pub mod http_client;
pub mod parsers;

use crate::config::ScraperConfig;
use crate::models::RawDayRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use self::http_client::HttpClient;
use self::parsers::parse_flow_table;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable producer of raw flow rows.
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn fetch_rows(&self) -> Result<Vec<RawDayRecord>>;
}

// ── farside scraper ───────────────────────────────────────────────────────────

pub struct FarsideScraper {
    client: HttpClient,
    page_url: String,
}

impl FarsideScraper {
    pub fn new(config: &ScraperConfig, page_url: impl Into<String>) -> Result<Self> {
        Ok(Self { client: HttpClient::new(config)?, page_url: page_url.into() })
    }
}

#[async_trait]
impl FlowSource for FarsideScraper {
    async fn fetch_rows(&self) -> Result<Vec<RawDayRecord>> {
        info!("Fetching {}", self.page_url);
        let html = self
            .client
            .get_text(&self.page_url)
            .await
            .with_context(|| format!("Failed to fetch {}", self.page_url))?;

        let rows = parse_flow_table(&html)?;
        info!("Scraped {} rows", rows.len());
        Ok(rows)
    }
}
