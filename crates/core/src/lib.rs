//! Core services of herald.
//!
//! - [`ReminderService`]: per-subject reminder chains
//! - [`OfferService`]: time-limited offers and their expiration timers
//! - [`BroadcastDispatcher`]: paced, resumable mass delivery
//! - [`ReachabilitySweep`]: daily membership check
//!
//! Everything that talks to the chat platform goes through
//! [`DeliveryGateway`]; [`JobRouter`] dispatches queued tasks to the services.

pub mod services;

pub use services::*;
