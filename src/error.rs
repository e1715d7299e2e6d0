//! Error types for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// Failures while provisioning a sandbox container.
///
/// An image pull failure is deliberately not represented here: the image may
/// already be present locally, so pull problems are reported as log events
/// and provisioning continues to the create stage.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to create container: {output}")]
    CreateFailed { output: String },

    #[error("Failed to run {command}: {source}")]
    SpawnFailed {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Failure binding an interactive subprocess to a pseudo-terminal.
#[derive(Debug, thiserror::Error)]
#[error("Failed to spawn PTY: {0}")]
pub struct AttachError(pub String);

/// Errors surfaced by the synchronous HTTP endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    DockerFailed(String),

    #[error("Failed to run docker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::DockerFailed(_) | ServerError::Spawn(_) | ServerError::Provision(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
