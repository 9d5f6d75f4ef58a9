mod config;
pub use config::PeerConfig;

mod errors;
pub use errors::HttpPeerError;

mod client;
pub use client::HttpPeer;

mod upstream;
pub use upstream::HttpUpstream;
