pub mod browserless;
pub mod spider;

use async_trait::async_trait;
use reqwest::Url;

use crate::config::{Backend, EngineProfile, FetcherSettings};
use crate::error::FetchError;

/// One rendering session. Pages are fetched strictly one at a time.
#[async_trait]
pub trait Fetcher: Send {
    /// Rendered markup for a search URL, after client-side scripts ran.
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError>;

    /// Release the session. Called once, on every exit path of a batch.
    ///
    /// Neither built-in backend holds a session: spider.cloud and the
    /// browserless `/content` endpoint each render in a fresh browser per
    /// request, so both keep this no-op.
    async fn shutdown(&mut self) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Open the configured backend.
pub fn connect(settings: &FetcherSettings) -> Result<Box<dyn Fetcher>, FetchError> {
    Ok(match settings.backend {
        Backend::Spider => Box::new(spider::SpiderFetcher::from_env(settings)?),
        Backend::Browserless => Box::new(browserless::BrowserlessFetcher::from_env(settings)?),
    })
}

/// Builds `"{entity} {qualifiers}"` queries against one engine profile.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    base: String,
    param: String,
    qualifiers: String,
    extra: Vec<(String, String)>,
}

impl QueryBuilder {
    pub fn new(profile: &EngineProfile) -> Self {
        QueryBuilder {
            base: profile.url.clone(),
            param: profile.query_param.clone(),
            qualifiers: profile.qualifiers.clone(),
            extra: profile
                .extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn query(&self, entity: &str) -> String {
        if self.qualifiers.is_empty() {
            entity.to_string()
        } else {
            format!("{} {}", entity, self.qualifiers)
        }
    }

    pub fn url(&self, entity: &str) -> Result<String, FetchError> {
        let query = self.query(entity);
        let params = std::iter::once((self.param.as_str(), query.as_str()))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Url::parse_with_params(&self.base, params)
            .map(String::from)
            .map_err(|e| FetchError::Request {
                query,
                reason: e.to_string(),
            })
    }
}
