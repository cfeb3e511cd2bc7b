//! Mock scheduler-configuration endpoint for testing kube-replay.
//!
//! Serves the same GET/POST contract as a kube-scheduler-simulator
//! configuration endpoint: GET returns the current configuration as JSON,
//! POST replaces it, `/reset` restores the defaults.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use kube_replay::schedcfg::SchedulerConfiguration;

#[derive(Parser, Debug)]
#[command(name = "mock-sched-api")]
#[command(about = "Mock kube-scheduler configuration endpoint")]
struct Args {
    /// Port to listen on (0 for a random free port)
    #[arg(short, long, default_value = "1212")]
    port: u16,
}

struct MockState {
    config: RwLock<SchedulerConfiguration>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_sched_api=debug,info")
        .init();

    let args = Args::parse();
    let state = Arc::new(MockState {
        config: RwLock::new(SchedulerConfiguration::with_defaults()),
    });

    let app = Router::new()
        .route("/", get(get_config).post(put_config))
        .route("/reset", post(reset_config))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "mock scheduler-config endpoint listening");

    // Signal readiness to stdout for test harnesses.
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_config(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(state.config.read().await.clone())
}

async fn put_config(
    State(state): State<Arc<MockState>>,
    Json(config): Json<SchedulerConfiguration>,
) -> impl IntoResponse {
    info!("replacing scheduler configuration");
    *state.config.write().await = config;
    StatusCode::ACCEPTED
}

async fn reset_config(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    info!("resetting scheduler configuration to defaults");
    *state.config.write().await = SchedulerConfiguration::with_defaults();
    StatusCode::OK
}
