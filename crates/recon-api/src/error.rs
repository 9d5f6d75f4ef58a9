use recon_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<recon_model::ModelError> for ApiError {
    fn from(err: recon_model::ModelError) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

#[cfg(feature = "http")]
impl ApiError {
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;

        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) => match e {
                CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
                CoreError::AlreadyRegistered(_)
                | CoreError::TaskAlreadyExists(_)
                | CoreError::AlreadyRunning(_) => StatusCode::CONFLICT,
                CoreError::NotRegistered(_)
                | CoreError::TaskNotFound(_)
                | CoreError::UnknownNode { .. }
                | CoreError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
                CoreError::NoNodesAvailable | CoreError::NoUpstream => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CoreError::Peer(_) | CoreError::Relay(_) => StatusCode::BAD_GATEWAY,
                CoreError::InvalidAddress(_)
                | CoreError::NotCoordinator(_)
                | CoreError::Model(_) => StatusCode::BAD_REQUEST,
                CoreError::Persistence(_) | CoreError::Io { .. } | CoreError::Interrupted(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

#[cfg(feature = "http")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(all(test, feature = "http"))]
mod tests {
    use axum::http::StatusCode;
    use recon_model::TaskId;

    use super::*;

    #[test]
    fn core_errors_map_to_statuses() {
        let status = |e: CoreError| ApiError::from(e).status();
        assert_eq!(status(CoreError::TaskAlreadyExists(TaskId::from("t1"))), StatusCode::CONFLICT);
        assert_eq!(status(CoreError::NoNodesAvailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(CoreError::Interrupted("task panicked".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::InvalidRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
