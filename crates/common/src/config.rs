//! Application configuration.

use std::path::Path;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::time::TimeOfDay;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP control surface configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Chat transport configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Task queue and worker configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Reference time zone and time scaling.
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    /// Broadcast dispatcher tuning.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Daily reachability sweep.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Log output.
    #[serde(default)]
    pub log: LogConfig,
    /// Scenario steps and their reminder bindings.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Time-boxed offers.
    #[serde(default)]
    pub offers: Vec<OfferDefinition>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Chat transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Bot API token. Required.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Bot API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_url: default_api_url(),
            timeout_secs: default_request_timeout(),
        }
    }
}

/// Retry backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Delay doubles each attempt.
    #[default]
    Exponential,
    /// Delay stays constant.
    Fixed,
}

/// Task queue and worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often idle workers poll for due tasks, in milliseconds.
    pub poll_interval_ms: u64,
    /// How long a claimed task stays invisible before it is considered stalled.
    pub lease_secs: u64,
    /// Concurrent reminder deliveries.
    pub reminder_concurrency: usize,
    /// Concurrent broadcast batches.
    pub broadcast_concurrency: usize,
    /// Concurrent offer expirations.
    pub offer_concurrency: usize,
    /// Concurrent maintenance jobs.
    pub maintenance_concurrency: usize,
    /// Default delivery attempts per task.
    pub max_attempts: u32,
    /// Backoff shape between attempts.
    pub backoff: BackoffKind,
    /// First retry delay in seconds.
    pub initial_backoff_secs: u64,
    /// Retry delay ceiling in seconds.
    pub max_backoff_secs: u64,
    /// Dead tasks kept per queue.
    pub dead_letter_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            lease_secs: 300,
            reminder_concurrency: 5,
            broadcast_concurrency: 1,
            offer_concurrency: 50,
            maintenance_concurrency: 1,
            max_attempts: 5,
            backoff: BackoffKind::Exponential,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            dead_letter_limit: 1000,
        }
    }
}

/// Reference time zone and dev-mode time scaling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Zone used for time-of-day alignment.
    pub timezone: Tz,
    /// Divide every queue delay by this factor (1 = real time).
    pub time_scale: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            time_scale: 1,
        }
    }
}

/// Broadcast dispatcher tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Contacts per batch task.
    pub batch_size: usize,
    /// Hard floor between two external calls, in milliseconds.
    pub min_interval_ms: u64,
    /// Log lines kept per session.
    pub log_capacity: usize,
    /// Error records kept per session.
    pub issue_capacity: usize,
    /// Call durations kept for rate estimation.
    pub duration_window: usize,
    /// Smoothing factor of the rate moving average.
    pub rate_alpha: f64,
    /// Publish status after this many processed contacts.
    pub status_every_items: u64,
    /// Publish status at least this often while running, in milliseconds.
    pub status_every_ms: u64,
    /// Extra attempts for a contact after a transient failure.
    pub item_retry_attempts: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            min_interval_ms: 40,
            log_capacity: 200,
            issue_capacity: 100,
            duration_window: 50,
            rate_alpha: 0.2,
            status_every_items: 25,
            status_every_ms: 2000,
            item_retry_attempts: 2,
        }
    }
}

/// Daily reachability sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Whether the sweep is registered at startup.
    pub enabled: bool,
    /// Local run time in the reference zone.
    pub at: TimeOfDay,
    /// Group whose membership is recorded, if any.
    pub group_id: Option<i64>,
    /// Subjects loaded per page.
    pub page_size: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            at: TimeOfDay { hour: 4, minute: 0 },
            group_id: None,
            page_size: 200,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Log configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
}

/// A scenario step that can carry reminders.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StepDefinition {
    /// Step identifier.
    pub id: String,
    /// Delay used by bindings that target this step without their own delay.
    #[serde(default)]
    pub default_delay_minutes: Option<i64>,
    /// Deliveries of this step are aligned to this local time.
    #[serde(default)]
    pub time_of_day: Option<TimeOfDay>,
    /// Rendered HTML body sent when this step is delivered as a reminder.
    #[serde(default)]
    pub text: String,
    /// Reminders scheduled when a subject enters this step, in order.
    #[serde(default)]
    pub reminders: Vec<ReminderBinding>,
}

/// A reminder scheduled relative to the previous one in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReminderBinding {
    /// Step delivered by this reminder.
    pub step: String,
    /// Overrides the target step's default delay.
    #[serde(default)]
    pub delay_minutes: Option<i64>,
}

/// A time-boxed offer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OfferDefinition {
    /// Offer key.
    pub key: String,
    /// Lifetime in minutes; absent means the offer never expires.
    #[serde(default)]
    pub lifetime_minutes: Option<i64>,
    /// Price in minor currency units.
    pub price: i64,
    /// ISO currency code.
    pub currency: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_redis_prefix() -> String {
    "herald".to_string()
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

const fn default_request_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `HERALD_ENV`)
    /// 4. Environment variables with `HERALD__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("HERALD_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check settings that must be present before any worker starts.
    pub fn validate(&self) -> AppResult<()> {
        if self
            .delivery
            .bot_token
            .as_deref()
            .is_none_or(|token| token.trim().is_empty())
        {
            return Err(AppError::Config("delivery.bot_token is required".to_string()));
        }
        if self.broadcast.batch_size == 0 {
            return Err(AppError::Config("broadcast.batch_size must be positive".to_string()));
        }
        let alpha = self.broadcast.rate_alpha;
        if alpha <= 0.0 || alpha > 1.0 || alpha.is_nan() {
            return Err(AppError::Config("broadcast.rate_alpha must be in (0, 1]".to_string()));
        }
        for step in &self.steps {
            for binding in &step.reminders {
                if !self.steps.iter().any(|s| s.id == binding.step) {
                    return Err(AppError::Config(format!(
                        "step {} has a reminder to unknown step {}",
                        step.id, binding.step
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
        [database]
        url = "postgres://localhost/herald"

        [redis]
        url = "redis://localhost:6379"

        [delivery]
        bot_token = "123:abc"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = parse(MINIMAL);
        assert_eq!(config.redis.prefix, "herald");
        assert_eq!(config.broadcast.batch_size, 500);
        assert_eq!(config.queue.broadcast_concurrency, 1);
        assert_eq!(config.scheduling.timezone, Tz::UTC);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let toml = MINIMAL.replace("bot_token = \"123:abc\"", "");
        let config = parse(&toml);
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_steps_and_offers_parse() {
        let toml = format!(
            r#"{MINIMAL}
            [scheduling]
            timezone = "Europe/Berlin"

            [[steps]]
            id = "welcome"
            reminders = [{{ step = "nudge", delay_minutes = 120 }}]

            [[steps]]
            id = "nudge"
            default_delay_minutes = 1320
            time_of_day = {{ hour = 9, minute = 0 }}
            text = "<b>Still there?</b>"

            [[offers]]
            key = "intro"
            lifetime_minutes = 1440
            price = 99000
            currency = "RUB"
            "#
        );
        let config = parse(&toml);
        assert_eq!(config.scheduling.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[0].reminders[0].delay_minutes, Some(120));
        assert_eq!(config.steps[1].time_of_day, TimeOfDay::new(9, 0));
        assert_eq!(config.offers[0].lifetime_minutes, Some(1440));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_reminder_target_rejected() {
        let toml = format!(
            r#"{MINIMAL}
            [[steps]]
            id = "welcome"
            reminders = [{{ step = "missing" }}]
            "#
        );
        assert!(matches!(parse(&toml).validate(), Err(AppError::Config(_))));
    }
}
