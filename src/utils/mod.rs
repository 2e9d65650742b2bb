//! Small cross-cutting utilities: socket binding and log throttling.

pub mod net;
pub mod throttle;

use std::time::{Duration, Instant};

pub use net::{bind_tcp_listener, bind_udp_socket};
pub use throttle::LogThrottler;

/// Shared de-duplication test: allows `now` through and records it as the new
/// high-water mark only if at least `window` has elapsed since `*last`. Used
/// for both the subscriber-local PLI pre-filter and the broadcaster's
/// authoritative `RequestIDR` dedup.
pub fn dedup_allows(last: &mut Option<Instant>, now: Instant, window: Duration) -> bool {
    let allow = last.map(|t| now.duration_since(t) >= window).unwrap_or(true);
    if allow {
        *last = Some(now);
    }
    allow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_allowed() {
        let mut last = None;
        assert!(dedup_allows(&mut last, Instant::now(), Duration::from_secs(1)));
    }

    #[test]
    fn second_call_within_window_is_suppressed() {
        let t0 = Instant::now();
        let mut last = Some(t0);
        let t1 = t0 + Duration::from_millis(500);
        assert!(!dedup_allows(&mut last, t1, Duration::from_secs(1)));
    }

    #[test]
    fn call_after_window_elapses_is_allowed() {
        let t0 = Instant::now();
        let mut last = Some(t0);
        let t1 = t0 + Duration::from_millis(1100);
        assert!(dedup_allows(&mut last, t1, Duration::from_secs(1)));
    }

    #[test]
    fn two_requests_half_a_second_apart_yield_exactly_one_allowed_in_two_seconds() {
        let t0 = Instant::now();
        let mut last = None;
        let first = dedup_allows(&mut last, t0, Duration::from_secs(1));
        let second = dedup_allows(&mut last, t0 + Duration::from_millis(500), Duration::from_secs(1));
        assert!(first);
        assert!(!second);
    }
}
