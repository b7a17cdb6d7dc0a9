//! Job definitions.
//!
//! Every task kind is a variant of [`TaskPayload`]; the variant decides the
//! queue it runs on.

use serde::{Deserialize, Serialize};

/// Queue names.
pub mod queues {
    /// Reminder deliveries.
    pub const REMINDERS: &str = "reminders";
    /// Offer expirations.
    pub const OFFERS: &str = "offers";
    /// Broadcast batches.
    pub const BROADCAST: &str = "broadcast";
    /// Fleet-wide periodic jobs.
    pub const MAINTENANCE: &str = "maintenance";

    /// All queues, in the order workers are registered.
    pub const ALL: [&str; 4] = [REMINDERS, OFFERS, BROADCAST, MAINTENANCE];
}

/// Payload of a deferred task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Deliver one reminder subscription.
    Reminder {
        /// Subscription to deliver.
        subscription_id: String,
    },
    /// Expire an offer instance.
    OfferExpiration {
        /// Instance to expire.
        instance_id: String,
    },
    /// Send items `[start, end)` of a broadcast session.
    BroadcastBatch {
        /// Session the batch belongs to.
        session_id: String,
        /// First contact index, inclusive.
        start: u64,
        /// Last contact index, exclusive.
        end: u64,
    },
    /// Check reachability of every known subject.
    ReachabilitySweep,
}

impl TaskPayload {
    /// Queue this payload is delivered on.
    #[must_use]
    pub const fn queue(&self) -> &'static str {
        match self {
            Self::Reminder { .. } => queues::REMINDERS,
            Self::OfferExpiration { .. } => queues::OFFERS,
            Self::BroadcastBatch { .. } => queues::BROADCAST,
            Self::ReachabilitySweep => queues::MAINTENANCE,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Reminder { .. } => "reminder",
            Self::OfferExpiration { .. } => "offer_expiration",
            Self::BroadcastBatch { .. } => "broadcast_batch",
            Self::ReachabilitySweep => "reachability_sweep",
        }
    }
}

/// Dedupe keys, one scheme per task kind.
pub mod dedupe {
    /// Key of the delivery task of a reminder subscription.
    #[must_use]
    pub fn reminder(subscription_id: &str) -> String {
        format!("reminder:{subscription_id}")
    }

    /// Key of the expiration task of an offer instance.
    #[must_use]
    pub fn offer_expiration(instance_id: &str) -> String {
        format!("offer-expire:{instance_id}")
    }

    /// Key of a broadcast batch.
    #[must_use]
    pub fn broadcast_batch(session_id: &str, start: u64) -> String {
        format!("broadcast:{session_id}:{start}")
    }

    /// Key of the recurring reachability sweep.
    pub const REACHABILITY_SWEEP: &str = "sweep:reachability";
}
