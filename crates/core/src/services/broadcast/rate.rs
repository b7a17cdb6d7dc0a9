//! Send rate and ETA estimation.
//!
//! The instantaneous rate comes from the median of recent call durations, so a
//! few slow calls do not move it. It is then blended into the running estimate
//! with an exponential moving average.

/// Median call duration in milliseconds.
#[must_use]
pub fn median_ms(durations: &[u64]) -> Option<f64> {
    if durations.is_empty() {
        return None;
    }
    let mut sorted = durations.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    #[allow(clippy::cast_precision_loss)]
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    };
    Some(median)
}

/// Exponential moving average over instantaneous rates.
#[derive(Debug, Clone, Copy)]
pub struct RateEstimator {
    alpha: f64,
}

impl RateEstimator {
    #[must_use]
    pub const fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Items per second implied by a median call duration. Sub-millisecond
    /// medians count as one millisecond.
    #[must_use]
    pub fn instant_rate(median_ms: f64) -> f64 {
        1000.0 / median_ms.max(1.0)
    }

    /// Blend a new sample into the previous estimate. The first sample is
    /// taken as is.
    #[must_use]
    pub fn blend(&self, previous: Option<f64>, instant: f64) -> f64 {
        match previous {
            Some(previous) if previous > 0.0 => previous.mul_add(1.0 - self.alpha, instant * self.alpha),
            _ => instant,
        }
    }

    /// New estimate from the previous one and the recent durations.
    #[must_use]
    pub fn update(&self, previous: Option<f64>, durations: &[u64]) -> Option<f64> {
        median_ms(durations).map(|median| self.blend(previous, Self::instant_rate(median)))
    }
}

/// Seconds left at `rate` items per second, rounded up.
#[must_use]
pub fn eta_seconds(remaining: u64, rate: f64) -> Option<u64> {
    if rate <= 0.0 || !rate.is_finite() {
        return None;
    }
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let seconds = (remaining as f64 / rate).ceil() as u64;
    Some(seconds)
}
