//! Backoff for transient provider failures.
//!
//! Provider hints win over the computed schedule: `retry-after-ms`, then
//! `retry-after` as seconds, then `retry-after` as an HTTP date. Without a
//! hint the delay grows exponentially up to `max_delay_ms`.
//!
//! Every function takes `now` explicitly so the schedule is deterministic
//! under test.

use std::time::Duration;

use chrono::{DateTime, Utc};
use corvid_config::RetryConfig;
use corvid_core::error::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Total budget measured from the first failure.
    pub max_duration: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms,
            backoff_factor: config.backoff_factor,
            max_delay_ms: config.max_delay_ms,
            max_duration: Duration::from_secs(config.max_duration_secs),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based), in milliseconds.
    pub fn delay_ms(&self, error: &ProviderError, attempt: u32, now: DateTime<Utc>) -> u64 {
        if let Some(hint) = error.headers().and_then(|h| hinted_delay_ms(h, now)) {
            return hint;
        }
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let computed = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        if !computed.is_finite() || computed >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            computed as u64
        }
    }

    /// Like [`RetryPolicy::delay_ms`], capped to what is left of the total budget.
    ///
    /// `None` means give up: the budget is spent, or a provider hint asks for
    /// a longer wait than the budget allows.
    pub fn bounded_delay(
        &self,
        error: &ProviderError,
        attempt: u32,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let elapsed = (now - started).num_milliseconds().max(0) as u64;
        let budget = self.max_duration.as_millis() as u64;
        if elapsed >= budget {
            return None;
        }
        let remaining = budget - elapsed;
        let delay = self.delay_ms(error, attempt, now);
        if delay > budget {
            return None;
        }
        Some(Duration::from_millis(delay.min(remaining)))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// The delay a provider asked for, if any valid hint is present.
fn hinted_delay_ms(headers: &std::collections::BTreeMap<String, String>, now: DateTime<Utc>) -> Option<u64> {
    if let Some(ms) = headers.get("retry-after-ms").and_then(|v| v.trim().parse::<f64>().ok())
        && ms.is_finite()
        && ms >= 0.0
    {
        return Some(ms.ceil() as u64);
    }

    let raw = headers.get("retry-after")?.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some((secs * 1000.0).ceil() as u64);
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    let wait = (at.with_timezone(&Utc) - now).num_milliseconds();
    (wait > 0).then_some(wait as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 2000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            max_duration: Duration::from_secs(600),
            max_attempts: 5,
        }
    }

    fn error_with(headers: &[(&str, &str)]) -> ProviderError {
        let headers: BTreeMap<String, String> =
            headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ProviderError::api(429, "rate limited", headers)
    }

    #[test]
    fn exponential_without_hints() {
        let p = policy();
        let err = error_with(&[]);
        let now = Utc::now();
        let delays: Vec<u64> = (1..=6).map(|a| p.delay_ms(&err, a, now)).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(p.delay_ms(&ProviderError::Network("reset".into()), 2, now), 4000);
    }

    #[test]
    fn millisecond_hint_is_exact() {
        let p = policy();
        let err = error_with(&[("retry-after-ms", "1500"), ("retry-after", "9")]);
        for attempt in 1..10 {
            assert_eq!(p.delay_ms(&err, attempt, Utc::now()), 1500);
        }
    }

    #[test]
    fn seconds_and_date_hints() {
        let p = policy();
        let now = Utc::now();
        assert_eq!(p.delay_ms(&error_with(&[("retry-after", "2.5")]), 1, now), 2500);

        let at = (now + chrono::Duration::seconds(7)).to_rfc2822();
        let delay = p.delay_ms(&error_with(&[("retry-after", &at)]), 1, now);
        assert!((6000..=7000).contains(&delay), "{delay}");

        // A date in the past is ignored in favour of backoff
        let past = (now - chrono::Duration::seconds(30)).to_rfc2822();
        assert_eq!(p.delay_ms(&error_with(&[("retry-after", &past)]), 1, now), 2000);
    }

    #[test]
    fn bounded_caps_to_remaining_budget() {
        let p = policy();
        let err = error_with(&[]);
        let started = Utc::now();

        let early = p.bounded_delay(&err, 3, started, started + chrono::Duration::seconds(10));
        assert_eq!(early, Some(Duration::from_millis(8000)));

        let late = p.bounded_delay(&err, 5, started, started + chrono::Duration::seconds(595));
        assert_eq!(late, Some(Duration::from_millis(5000)));

        assert_eq!(p.bounded_delay(&err, 1, started, started + chrono::Duration::seconds(600)), None);
    }

    #[test]
    fn bounded_gives_up_on_oversized_hint() {
        let p = policy();
        let err = error_with(&[("retry-after", "3600")]);
        let now = Utc::now();
        assert_eq!(p.bounded_delay(&err, 1, now, now), None);
    }

    #[test]
    fn attempts_are_limited() {
        let p = policy();
        assert!(p.allows(5));
        assert!(!p.allows(6));
    }
}
