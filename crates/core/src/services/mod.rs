//! Scheduling and delivery services.

#![allow(missing_docs)]

pub mod broadcast;
pub mod delivery;
pub mod jobs;
pub mod offer;
pub mod reminder;
pub mod steps;
pub mod sweep;
pub mod telegram;

#[cfg(test)]
pub mod testing;

pub use broadcast::{
    BroadcastDispatcher, BroadcastEvent, BroadcastFeed, BroadcastStatus, SessionState, StartBroadcast,
};
pub use delivery::{DeliveryError, DeliveryGateway, MediaItem, MediaKind, MemberStatus, MessageRef};
pub use jobs::JobRouter;
pub use offer::{OfferCatalog, OfferService};
pub use reminder::{CancelSummary, ReminderService};
pub use steps::{PlannedReminder, StepCatalog, compute_chain};
pub use sweep::{ReachabilitySweep, SweepReport, register_sweep};
pub use telegram::TelegramGateway;
