//! Chat transport capability.
//!
//! Services reach the external channel only through [`DeliveryGateway`]. The
//! production implementation is [`crate::services::telegram::TelegramGateway`].

use std::time::Duration;

use async_trait::async_trait;
use herald_common::AppError;
use herald_db::MessageLocation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wait applied when a provider rate-limits without saying for how long.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Reference to a message sent through the gateway.
pub type MessageRef = MessageLocation;

/// Failure of a call to the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The endpoint cannot be reached anymore (blocked, deactivated, deleted).
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// Network or provider hiccup.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The provider refused the request itself (malformed payload, missing
    /// bot rights). Says nothing about the contact and is not retried.
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// The provider asked us to slow down.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Wait requested by the provider.
        retry_after: Duration,
    },
}

impl DeliveryError {
    /// Whether the contact should be flagged unreachable.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Short machine-readable reason for issue records.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Permanent(_) => "unreachable",
            Self::Transient(_) => "transient",
            Self::Rejected(_) => "rejected",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        Self::Delivery(err.to_string())
    }
}

/// Classify a provider error response.
///
/// Descriptions that mean the user is gone are permanent whatever the code,
/// as is `403`. `429` is a rate limit. Any other `4xx` is a rejected request
/// that leaves the contact untouched. The rest is transient.
#[must_use]
pub fn classify_provider_error(code: u16, description: &str) -> DeliveryError {
    const PERMANENT_MARKERS: [&str; 6] = [
        "bot was blocked by the user",
        "user is deactivated",
        "chat not found",
        "user not found",
        "bot was kicked",
        "bot can't initiate conversation",
    ];

    let lowered = description.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return DeliveryError::Permanent(description.to_string());
    }

    match code {
        429 => DeliveryError::RateLimited {
            retry_after: DEFAULT_RETRY_AFTER,
        },
        403 => DeliveryError::Permanent(description.to_string()),
        400..=499 => DeliveryError::Rejected(format!("{code}: {description}")),
        _ => DeliveryError::Transient(format!("{code}: {description}")),
    }
}

/// Kind of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

/// A media attachment, referenced by provider file id or URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub file: String,
}

/// Membership of a contact in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl MemberStatus {
    /// Whether the contact currently belongs to the group.
    #[must_use]
    pub const fn is_member(self) -> bool {
        matches!(
            self,
            Self::Creator | Self::Administrator | Self::Member | Self::Restricted
        )
    }
}

/// Chat transport operations used by the engine.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Send an HTML message.
    async fn send_message(&self, contact_id: i64, html: &str) -> Result<MessageRef, DeliveryError>;

    /// Send one or more media items with an optional caption.
    async fn send_media(
        &self,
        contact_id: i64,
        items: &[MediaItem],
        caption: Option<&str>,
    ) -> Result<Vec<MessageRef>, DeliveryError>;

    /// Delete a previously sent message.
    async fn delete_message(&self, location: MessageLocation) -> Result<(), DeliveryError>;

    /// Membership of `contact_id` in `group_id`.
    async fn get_member_status(
        &self,
        group_id: i64,
        contact_id: i64,
    ) -> Result<MemberStatus, DeliveryError>;
}
