//! Injectable wall-clock seam (SPEC_FULL.md §3), generalized from the daemon's
//! own jittered-interval pattern in `scheduler.rs`'s `spawn_alert_task`.
//!
//! This seam covers the *wall-clock timestamp* side only: `updated_at`/
//! `starts_at` defaults, silence/nflog timestamps, and expiry comparisons,
//! none of which read `tokio::time`. Scheduling delays (group-wait,
//! group-interval, repeat-interval) are driven by `tokio::time` directly;
//! `dispatcher.rs`'s timer-wheel tests run under `#[tokio::test(start_paused
//! = true)]` and `tokio::time::advance` rather than real sleeps, since they
//! exercise pure timer logic. `cluster.rs`'s tests drive real UDP/TCP
//! sockets and stay on real sleeps — paused time does not make a peer's
//! socket actually receive a packet any faster.

use std::sync::{Arc, Mutex};

use jiff::Timestamp;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync {
	fn now(&self) -> Timestamp;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Timestamp {
		Timestamp::now()
	}
}

/// A manually-advanced clock for deterministic tests (spec.md §8 concrete
/// scenarios are specified in terms of exact elapsed wall-time offsets).
#[derive(Debug, Clone)]
pub struct FakeClock(Arc<Mutex<Timestamp>>);

impl FakeClock {
	pub fn at(start: Timestamp) -> Self {
		Self(Arc::new(Mutex::new(start)))
	}

	pub fn advance(&self, by: jiff::Span) {
		let mut guard = self.0.lock().unwrap();
		*guard = guard.checked_add(by).expect("fake clock overflow");
	}

	pub fn set(&self, to: Timestamp) {
		*self.0.lock().unwrap() = to;
	}
}

impl Clock for FakeClock {
	fn now(&self) -> Timestamp {
		*self.0.lock().unwrap()
	}
}

pub type SharedClock = Arc<dyn Clock>;

/// Converts a `jiff::Span` of group-wait/group-interval/repeat-interval
/// magnitude into a `std::time::Duration` for `tokio::time` scheduling.
/// These spans are always expressed in fixed (non-calendar) units, so the
/// conversion cannot fail in practice; an overflow or calendar-unit span
/// falls back to zero rather than panicking a scheduling loop.
pub fn span_to_duration(span: jiff::Span) -> std::time::Duration {
	jiff::SignedDuration::try_from(span)
		.ok()
		.and_then(|d| d.try_into().ok())
		.unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fake_clock_advances_monotonically() {
		let start: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
		let clock = FakeClock::at(start);
		assert_eq!(clock.now(), start);
		clock.advance(jiff::Span::new().seconds(5));
		assert_eq!(clock.now(), start.checked_add(jiff::Span::new().seconds(5)).unwrap());
	}

	#[test]
	fn span_to_duration_converts_fixed_units() {
		let span = jiff::Span::new().minutes(2).seconds(30);
		assert_eq!(span_to_duration(span), std::time::Duration::from_secs(150));
	}
}
