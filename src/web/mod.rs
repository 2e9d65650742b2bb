//! The signaling HTTP surface: one route, `/ws/signaling`, per §4.7. Static
//! asset serving, admin auth, and mDNS discovery are external collaborators
//! and are intentionally absent here.

mod signaling;

use axum::routing::any;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use signaling::signaling_handler;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/signaling", any(signaling_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
