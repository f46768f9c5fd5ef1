//! live-component-runtime — server-authoritative WebSocket host for
//! stateful UI components.

use live_component_runtime::config::Config;
use live_component_runtime::{build_router, AppState};
use tracing::info;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    tracing_subscriber::fmt().with_env_filter(&config.log_level).with_target(true).init();

    info!("live-component-runtime starting");
    info!(listen = %config.listen_addr, work_dir = ?config.work_dir);

    let state = AppState::new(config.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "live-component-runtime listening");

    axum::serve(listener, app).await.expect("server error");
}
