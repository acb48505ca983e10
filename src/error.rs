use thiserror::Error;

/// Anything that went wrong while obtaining a rendered page. The batch
/// driver does not distinguish between variants; they exist for the log.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),
    #[error("could not build request for '{query}': {reason}")]
    Request { query: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("no rendered content returned for {0}")]
    EmptyBody(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FetchError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => FetchError::Transport(e.to_string()),
        }
    }
}
