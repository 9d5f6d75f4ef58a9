mod error;
pub use error::ApiError;

mod handler;
pub use handler::{ApiHandler, Health};

mod adapter;
pub use adapter::NodeApiAdapter;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{DEFAULT_NODE_PORT, HttpApi};

#[cfg(feature = "http")]
pub use axum;
