//! HTTP server and routes.

pub mod handlers;
mod state;

pub use state::AppState;

use crate::error::Result;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let file_routes = Router::new()
        .route("/epub/{id}", get(handlers::book_download))
        .route("/cover/{id}", get(handlers::book_cover))
        .route("/thumb/{id}", get(handlers::book_thumbnail));

    Router::new()
        .route("/opds", get(handlers::catalog))
        .nest("/get", file_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `token` is cancelled.
pub async fn serve(state: AppState, bind: SocketAddr, token: CancellationToken) -> Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
