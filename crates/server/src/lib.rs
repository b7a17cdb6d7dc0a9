//! HTTP control surface of herald.
//!
//! Operators start, stop and resume broadcasts and follow their progress
//! over SSE. The bot front end reports scenario steps, offer displays and
//! payments.

pub mod endpoints;
pub mod response;

use std::sync::Arc;

use axum::Router;
use herald_core::{BroadcastDispatcher, OfferService, ReminderService};
use tower_http::trace::TraceLayer;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Reminder chains.
    pub reminders: Arc<ReminderService>,
    /// Offer lifecycle.
    pub offers: Arc<OfferService>,
    /// Broadcast sessions.
    pub broadcasts: Arc<BroadcastDispatcher>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(endpoints::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
