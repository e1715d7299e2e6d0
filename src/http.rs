//! Synchronous HTTP endpoints: one-shot wrappers over docker commands with
//! no session state.

use axum::{
    extract::Path,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::docker::{self, DEFAULT_IMAGE};
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateContainerResponse {
    #[serde(rename = "containerId")]
    container_id: String,
    #[serde(rename = "containerName")]
    container_name: String,
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    command: String,
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn create_container(
    Json(request): Json<CreateContainerRequest>,
) -> Result<Json<CreateContainerResponse>, ServerError> {
    let image = request.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string());
    info!("[http] POST /containers - image={}", image);

    // No channel to stream progress to here; drop the receiver so the
    // provisioner's log sends become no-ops.
    let (log_tx, log_rx) = mpsc::channel(1);
    drop(log_rx);

    let provisioned = docker::provision(image, log_tx).await?;
    Ok(Json(CreateContainerResponse {
        container_id: provisioned.container_id,
        container_name: provisioned.container_name,
        message: "Container created successfully".to_string(),
    }))
}

pub async fn get_container(
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    match docker::lookup_container(&identifier).await? {
        Some(info) => Ok(Json(serde_json::json!({ "container": info }))),
        None => Err(ServerError::NotFound(identifier)),
    }
}

pub async fn delete_container(
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    info!("[http] DELETE /containers/{}", identifier);
    docker::remove_container(&identifier).await?;
    Ok(Json(serde_json::json!({
        "message": "Container deleted successfully",
        "containerId": identifier,
    })))
}

pub async fn exec_in_container(
    Path(identifier): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let result = docker::exec_in_container(&identifier, &request.command).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = Router::new().route("/health", get(health));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
