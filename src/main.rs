//! WebSocket terminal server for ephemeral Docker sandboxes.
//!
//! One WebSocket per terminal session carries container provisioning,
//! interactive shell attachment over a PTY, raw keystroke/output streaming,
//! and live resize. A small set of HTTP endpoints wraps the one-shot
//! container operations (create, inspect, exec, delete).

mod docker;
mod error;
mod http;
mod pty;
mod session;

use std::env;

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Parser)]
#[command(name = "sandbox-pty")]
#[command(about = "WebSocket terminal server for ephemeral Docker sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve {
        /// Host to bind to
        #[arg(long, env = "SANDBOX_PTY_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, env = "SANDBOX_PTY_PORT", default_value = "3001")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { host, port }) => run_server(&host, port).await,

        // No subcommand = server mode with env-backed defaults
        None => {
            let host = env::var("SANDBOX_PTY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
            let port: u16 = env::var("SANDBOX_PTY_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("Invalid SANDBOX_PTY_PORT")?;
            run_server(&host, port).await
        }
    }
}

fn build_router() -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/containers", post(http::create_container))
        .route("/containers/:identifier", get(http::get_container))
        .route("/containers/:identifier", delete(http::delete_container))
        .route("/containers/:identifier/exec", post(http::exec_in_container))
        .route("/ws", get(session::websocket_handler))
        .layer(CorsLayer::permissive())
}

async fn run_server(host: &str, port: u16) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let app = build_router();

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Server running on {}", addr);
    info!("Available routes:");
    info!("  POST   /containers");
    info!("  GET    /containers/:identifier");
    info!("  DELETE /containers/:identifier");
    info!("  POST   /containers/:identifier/exec");
    info!("  GET    /ws");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn router_serves_health() {
        let app = build_router();

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

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = build_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
