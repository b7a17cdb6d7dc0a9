//! Repository layer for database operations.

mod offer_instance;
mod reminder_subscription;
mod subject;

pub use offer_instance::OfferInstanceRepository;
pub use reminder_subscription::ReminderSubscriptionRepository;
pub use subject::SubjectRepository;
