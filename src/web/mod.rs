//! HTTP surface: the signaling WebSocket and a static preview page

pub mod ws;

use std::sync::Arc;

use axum::response::Html;
use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::Hub;
use crate::stream::OutputMode;

/// Shared state handed to every handler
pub struct AppState {
    pub hub: Arc<Hub>,
    pub output_mode: OutputMode,
}

/// Build the application router: `/ws` for signaling, `/` for the
/// embedded preview page.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", any(ws::ws_handler))
        .route("/", get(index_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}
