//! Route handlers.

mod broadcasts;
mod subjects;

use axum::Router;

use crate::AppState;

/// Every route of the control surface.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/broadcasts", broadcasts::router())
        .nest("/subjects", subjects::router())
}
