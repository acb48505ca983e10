use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::Fetcher;
use crate::config::FetcherSettings;
use crate::error::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// A browserless-compatible service: `POST /content` renders a URL in
/// headless Chrome and returns the resulting HTML.
pub struct BrowserlessFetcher {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    settle_ms: u64,
}

impl BrowserlessFetcher {
    pub fn from_env(settings: &FetcherSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(BrowserlessFetcher {
            client,
            endpoint: format!("{}/content", settings.browserless_url.trim_end_matches('/')),
            token: std::env::var(&settings.browserless_token_env).ok(),
            settle_ms: settings.settle_ms,
        })
    }
}

#[async_trait]
impl Fetcher for BrowserlessFetcher {
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "url": url,
            "gotoOptions": { "waitUntil": "networkidle2" },
            "waitForTimeout": self.settle_ms,
        }));
        if let Some(token) = &self.token {
            request = request.query(&[("token", token)]);
        }

        let response = request.send().await?.error_for_status()?;
        let html = response.text().await?;
        debug!("browserless returned {} bytes for {}", html.len(), url);
        if html.trim().is_empty() {
            return Err(FetchError::EmptyBody(url.to_string()));
        }
        Ok(html)
    }
}
