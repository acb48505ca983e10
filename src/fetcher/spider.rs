use std::time::Instant;

use async_trait::async_trait;
use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::debug;

use super::Fetcher;
use crate::config::FetcherSettings;
use crate::error::FetchError;

/// spider.cloud in headless-Chrome mode, returning raw HTML.
pub struct SpiderFetcher {
    spider: Spider,
}

impl SpiderFetcher {
    pub fn from_env(settings: &FetcherSettings) -> Result<Self, FetchError> {
        let api_key = std::env::var(&settings.api_key_env)
            .map_err(|_| FetchError::MissingCredentials(settings.api_key_env.clone()))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| FetchError::Transport(format!("failed to create Spider client: {}", e)))?;
        Ok(SpiderFetcher { spider })
    }
}

#[async_trait]
impl Fetcher for SpiderFetcher {
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
        let params = RequestParams {
            request: Some(RequestType::Chrome),
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let start = Instant::now();
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        debug!("spider answered in {}ms", start.elapsed().as_millis());

        page_from_response(url, response)
    }
}

/// spider.cloud answers with `[{content, status, ...}]`, sometimes as a JSON
/// string that needs a second decode.
fn page_from_response(url: &str, value: serde_json::Value) -> Result<String, FetchError> {
    let parsed: serde_json::Value = match value.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(value.clone()),
        None => value,
    };
    let first = parsed.as_array().and_then(|arr| arr.first());

    let status = first
        .and_then(|obj| obj.get("status"))
        .and_then(|s| s.as_u64())
        .unwrap_or(200);
    if status >= 400 {
        return Err(FetchError::Status {
            status: status as u16,
            url: url.to_string(),
        });
    }

    first
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| FetchError::EmptyBody(url.to_string()))
}
