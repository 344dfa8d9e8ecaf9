pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub async fn serve(state: ApiState, host: &str, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/links", get(handlers::handle_links))
        .route("/links/best", get(handlers::handle_best_link))
        .route("/links/scan", post(handlers::handle_scan_links))
        .route(
            "/files/upload",
            post(handlers::handle_upload).layer(DefaultBodyLimit::max(256 * 1024 * 1024)),
        )
        .route("/files", get(handlers::handle_files))
        .route("/files/{id}", get(handlers::handle_file_status))
        .route("/files/{id}/transfer", post(handlers::handle_start_transfer))
        .route("/files/{id}/pause", post(handlers::handle_pause))
        .route("/files/{id}/resume", post(handlers::handle_resume))
        .route("/files/{id}/cancel", post(handlers::handle_cancel))
        .route("/files/{id}/priority", put(handlers::handle_priority))
        .route("/shaper/config", post(handlers::handle_shaper_config))
        .route("/shaper/kill-link", post(handlers::handle_kill_link))
        .route("/shaper/restore-link", post(handlers::handle_restore_link))
        .route("/shaper/reset", post(handlers::handle_shaper_reset));

    let app = Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(handlers::handle_telemetry_ws))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
