use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Whole-request timeout.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            user_agent: concat!("recon-agentd/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
