//! HTTP route definitions.
//!
//! Device endpoints live under `/sync`; `/health` and `/` sit at the root.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .nest("/sync", sync::routes())
}
