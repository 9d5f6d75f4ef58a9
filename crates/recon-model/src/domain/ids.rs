use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

use crate::ModelError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw identifier.
            ///
            /// Identifiers travel as URL path segments and snapshot keys,
            /// so they must be non-empty and free of `/`.
            pub fn parse(raw: impl Into<String>) -> Result<Self, ModelError> {
                let raw = raw.into();
                if raw.trim().is_empty() {
                    return Err(ModelError::Empty($what));
                }
                if raw.contains('/') {
                    return Err(ModelError::PathSeparator {
                        what: $what,
                        value: raw,
                    });
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Task identifier, assigned by whoever creates the task (cloud or edge).
    TaskId,
    "task id"
);

string_id!(
    /// Stable node identifier.
    ///
    /// Distinct from the node's address: the registry assigns it on registration
    /// and task records key their per-node entries by it.
    NodeId,
    "node id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty_and_blank() {
        assert_eq!(TaskId::parse(""), Err(ModelError::Empty("task id")));
        assert_eq!(NodeId::parse("   "), Err(ModelError::Empty("node id")));
    }

    #[test]
    fn parse_rejects_path_separator() {
        let err = TaskId::parse("a/b").unwrap_err();
        assert!(matches!(err, ModelError::PathSeparator { what: "task id", .. }));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = TaskId::parse("t-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""t-1""#);
        assert_eq!(id.to_string(), "t-1");
    }
}
