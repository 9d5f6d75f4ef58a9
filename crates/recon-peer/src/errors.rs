use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpPeerError {
    #[error("http client setup failed: {0}")]
    Build(#[from] reqwest::Error),

    #[error("invalid peer address '{0}'")]
    InvalidAddress(String),
}
