//! Database entities.

#![allow(missing_docs)]

pub mod offer_instance;
pub mod reminder_subscription;
pub mod subject;

pub use offer_instance::Entity as OfferInstance;
pub use reminder_subscription::Entity as ReminderSubscription;
pub use subject::Entity as Subject;
