use crate::config::ScraperConfig;
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::debug;

pub struct HttpClient {
    inner: reqwest::Client,
    proxy_url: Option<String>,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { inner, proxy_url: config.proxy_url.clone() })
    }

    /// URL actually requested for `page`: direct, or `<proxy>?url=<page>`.
    pub fn request_url(&self, page: &str) -> Result<String> {
        match &self.proxy_url {
            None => Ok(page.to_string()),
            Some(proxy) => {
                let url = url::Url::parse_with_params(proxy, &[("url", page)])
                    .with_context(|| format!("Bad proxy url {}", proxy))?;
                Ok(url.to_string())
            }
        }
    }

    /// Fetch a page as text. One attempt; retrying is the caller's business.
    pub async fn get_text(&self, page: &str) -> Result<String> {
        let url = self.request_url(page)?;
        debug!("GET {}", url);

        let resp = self
            .inner
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/html")
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Failed to fetch text/html of {}: HTTP {}", page, status);
        }
        resp.text().await.context("Failed to read response body")
    }
}
