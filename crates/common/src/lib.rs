//! Common utilities and shared types for herald.
//!
//! This crate provides foundational components used across all herald crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Clock**: Pluggable time source with optional delay scaling via [`Clock`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Local time**: Time-of-day alignment in a reference zone via [`time`]
//!
//! # Example
//!
//! ```no_run
//! use herald_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!     let id = IdGenerator::new().generate();
//!     println!("Generated ID: {id}");
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod time;

pub use clock::{Clock, ManualClock, ScaledClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use time::{TimeOfDay, next_time_of_day};
