use serde::Serialize;

/// Result of a mutating operation together with its durability outcome.
///
/// The in-memory state is authoritative: when the snapshot write fails the
/// mutation is kept and `warning` carries the cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Persisted<T> {
    #[serde(flatten)]
    pub value: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl<T> Persisted<T> {
    pub fn new(value: T, warning: Option<String>) -> Self {
        Self { value, warning }
    }

    pub fn durable(value: T) -> Self {
        Self {
            value,
            warning: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Ack {
        ok: bool,
    }

    #[test]
    fn flattens_value_and_hides_empty_warning() {
        let json = serde_json::to_string(&Persisted::durable(Ack { ok: true })).unwrap();
        assert_eq!(json, r#"{"ok":true}"#);

        let json = serde_json::to_string(&Persisted::new(Ack { ok: true }, Some("disk full".into())))
            .unwrap();
        assert_eq!(json, r#"{"ok":true,"warning":"disk full"}"#);
    }
}
