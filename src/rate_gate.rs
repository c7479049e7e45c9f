//! Per-device log-rate control.
//!
//! Sensors advertise every second or so while operators want one row per
//! minute. The gate accepts at most one event per `interval` for each device
//! key, anchored at the last accepted event.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Fixed-window rate limiter keyed by device key.
///
/// The first event for a key is always accepted. Rejected events do not move
/// the window; only acceptance does.
#[derive(Debug)]
pub struct RateGate {
    /// Minimum time between accepted events for one key
    interval: Duration,
    /// Last accepted instant per device key
    last_accepted: HashMap<String, Instant>,
}

impl RateGate {
    /// Create a gate with the given minimum interval.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use ble_field_logger::rate_gate::RateGate;
    ///
    /// let mut gate = RateGate::new(Duration::from_secs(60));
    /// assert!(gate.should_log("porch"));
    /// assert!(!gate.should_log("porch"));
    /// ```
    pub fn new(interval: Duration) -> Self {
        RateGate {
            interval,
            last_accepted: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// [`RateGate::should_log_at`] with the current instant.
    pub fn should_log(&mut self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    /// Decide whether an event for `key` observed at `now` may be logged.
    ///
    /// Returns `true` for the first event of a key, or when at least
    /// `interval` has elapsed since the last accepted one; in both cases
    /// `now` becomes the new anchor.
    pub fn should_log_at(&mut self, key: &str, now: Instant) -> bool {
        match self.last_accepted.get_mut(key) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_accepted.insert(key.to_string(), now);
                true
            }
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use ble_field_logger::rate_gate::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, scale, unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, None, "milliseconds")
    } else if let Some(num) = src.strip_suffix('h') {
        (num, Some(3600), "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, Some(60), "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, Some(1), "seconds")
    } else {
        (src, Some(1), "duration")
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {num}"))?;

    match scale {
        None => Ok(Duration::from_millis(value)),
        Some(secs) => value
            .checked_mul(secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {src}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_event_accepted() {
        let mut gate = RateGate::new(MINUTE);
        assert!(gate.should_log_at("porch", Instant::now()));
    }

    #[test]
    fn test_event_within_window_rejected() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(MINUTE);
        assert!(gate.should_log_at("porch", t0));
        assert!(!gate.should_log_at("porch", t0 + Duration::from_secs(59)));
        assert!(gate.should_log_at("porch", t0 + MINUTE));
    }

    #[test]
    fn test_keys_are_independent() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(MINUTE);
        assert!(gate.should_log_at("porch", t0));
        assert!(gate.should_log_at("attic", t0));
        assert!(!gate.should_log_at("porch", t0 + Duration::from_secs(1)));
        assert!(!gate.should_log_at("attic", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_interval_accepts_everything() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(Duration::ZERO);
        assert!(gate.should_log_at("porch", t0));
        assert!(gate.should_log_at("porch", t0));
    }

    #[test]
    fn test_rejected_event_does_not_move_anchor() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(Duration::from_secs(30));

        assert!(gate.should_log_at("porch", t0));
        assert!(!gate.should_log_at("porch", t0 + Duration::from_secs(10)));
        assert!(!gate.should_log_at("porch", t0 + Duration::from_secs(20)));
        // 30s after the accepted event, not after the last rejected one
        assert!(gate.should_log_at("porch", t0 + Duration::from_secs(30)));
    }

    #[test]
    fn test_anchor_resets_on_acceptance() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(Duration::from_secs(20));

        assert!(gate.should_log_at("porch", t0));
        assert!(gate.should_log_at("porch", t0 + Duration::from_secs(25)));
        assert!(!gate.should_log_at("porch", t0 + Duration::from_secs(40)));
        assert!(gate.should_log_at("porch", t0 + Duration::from_secs(45)));
    }

    #[test]
    fn test_accepted_events_are_spaced_by_interval() {
        let t0 = Instant::now();
        let interval = Duration::from_secs(7);
        let mut gate = RateGate::new(interval);
        let mut accepted = Vec::new();

        // irregular arrivals: every 1..=4 seconds over ten minutes
        let mut offset = 0u64;
        for step in (0..400u64).map(|i| i % 4 + 1) {
            offset += step;
            let now = t0 + Duration::from_secs(offset);
            if gate.should_log_at("porch", now) {
                accepted.push(now);
            }
        }

        assert!(accepted.len() > 1);
        for pair in accepted.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= interval);
        }
    }

    #[test]
    fn test_out_of_order_instant_is_rejected() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut gate = RateGate::new(MINUTE);
        assert!(gate.should_log_at("porch", t0));
        assert!(!gate.should_log_at("porch", t0 - Duration::from_secs(5)));
    }

    #[test]
    fn test_should_log_uses_current_time() {
        let mut gate = RateGate::new(Duration::from_millis(10));
        assert!(gate.should_log("porch"));
        assert!(!gate.should_log("porch"));

        std::thread::sleep(Duration::from_millis(15));
        assert!(gate.should_log("porch"));
    }

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("60").unwrap(), MINUTE);
    }

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("1m").unwrap(), MINUTE);
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert_eq!(parse_duration("xm").unwrap_err(), "invalid minutes: x");
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
    }
}
