use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("{what} contains a path separator: {value}")]
    PathSeparator { what: &'static str, value: String },

    #[error("invalid status: '{0}' (valid: created, running, stopped, finished, failed)")]
    InvalidStatus(String),
}
