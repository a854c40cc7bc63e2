//! Retry stage (spec.md §4.3 stage 8).

use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::receiver::{Notification, Receiver, SendError};

/// Why `send_with_retry` gave up (spec.md §4.3 stage 8, §5 cancellation).
#[derive(Debug)]
pub enum RetryFailure {
	/// The receiver returned a non-retryable error, or the retry budget was
	/// exhausted; carries the last error and the number of attempts made.
	Failed(SendError, u32),
	/// `cancel` fired before a send succeeded; the in-flight attempt is
	/// abandoned and no further attempts are made (spec.md §5 "in-flight send
	/// is abandoned, retry loop exits, no notification-log entry is written").
	Cancelled,
}

/// Exponential backoff with jitter, bounded by `max_attempts` and `max_delay`
/// (spec.md §4.3 "backs off exponentially with jitter up to a maximum").
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(60),
		}
	}
}

impl RetryPolicy {
	fn delay_for(&self, attempt: u32) -> Duration {
		let exp = self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
		let capped = exp.min(self.max_delay);
		let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
		Duration::from_millis(jitter_ms)
	}
}

/// Invokes the receiver, retrying retryable failures with backoff; propagates
/// non-retryable failures immediately (spec.md §4.3 stage 8 "Retry"). Races
/// every attempt and every backoff sleep against `cancel`, abandoning the
/// loop the instant it fires (spec.md §5 "Cancellation and timeouts").
pub async fn send_with_retry(
	receiver: &dyn Receiver,
	notification: &Notification,
	policy: &RetryPolicy,
	cancel: &CancellationToken,
) -> Result<(), RetryFailure> {
	let mut attempt = 0;
	loop {
		attempt += 1;
		let outcome = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
			outcome = receiver.send(notification) => outcome,
		};
		match outcome {
			Ok(()) => return Ok(()),
			Err(err) if !err.retryable => return Err(RetryFailure::Failed(err, attempt)),
			Err(err) if attempt >= policy.max_attempts => return Err(RetryFailure::Failed(err, attempt)),
			Err(err) => {
				let delay = policy.delay_for(attempt - 1);
				debug!(receiver = receiver.name(), attempt, ?delay, error = %err, "retrying after transient send failure");
				tokio::select! {
					biased;
					_ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
					_ = tokio::time::sleep(delay) => {}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::receiver::RecordingReceiver;

	fn notification() -> Notification {
		Notification {
			group_key: "g".into(),
			receiver: "r".into(),
			firing: Vec::new(),
			resolved: Vec::new(),
		}
	}

	#[tokio::test]
	async fn succeeds_after_retryable_failures() {
		let receiver = RecordingReceiver::new("webhook-b").fail_retryably_for(2);
		let policy = RetryPolicy {
			max_attempts: 5,
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
		};
		let result = send_with_retry(&receiver, &notification(), &policy, &CancellationToken::new()).await;
		assert!(result.is_ok());
		assert_eq!(receiver.received().len(), 1);
	}

	#[tokio::test]
	async fn gives_up_after_max_attempts() {
		let receiver = RecordingReceiver::new("webhook-b").fail_retryably_for(10);
		let policy = RetryPolicy {
			max_attempts: 3,
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(2),
		};
		let failure = send_with_retry(&receiver, &notification(), &policy, &CancellationToken::new())
			.await
			.unwrap_err();
		let RetryFailure::Failed(err, attempts) = failure else {
			panic!("expected Failed, got {failure:?}");
		};
		assert_eq!(attempts, 3);
		assert!(err.retryable);
	}

	#[tokio::test]
	async fn propagates_permanent_failure_immediately() {
		struct AlwaysPermanent;
		#[async_trait::async_trait]
		impl Receiver for AlwaysPermanent {
			fn name(&self) -> &str {
				"permanent"
			}
			async fn send(&self, _n: &Notification) -> Result<(), SendError> {
				Err(SendError::permanent("rejected"))
			}
		}
		let policy = RetryPolicy::default();
		let failure = send_with_retry(&AlwaysPermanent, &notification(), &policy, &CancellationToken::new())
			.await
			.unwrap_err();
		let RetryFailure::Failed(err, attempts) = failure else {
			panic!("expected Failed, got {failure:?}");
		};
		assert_eq!(attempts, 1);
		assert!(!err.retryable);
	}

	#[tokio::test]
	async fn cancellation_abandons_the_retry_loop() {
		let receiver = RecordingReceiver::new("webhook-b").fail_retryably_for(10);
		let policy = RetryPolicy {
			max_attempts: 10,
			base_delay: Duration::from_secs(60),
			max_delay: Duration::from_secs(60),
		};
		let cancel = CancellationToken::new();
		cancel.cancel();
		let failure = send_with_retry(&receiver, &notification(), &policy, &cancel).await.unwrap_err();
		assert!(matches!(failure, RetryFailure::Cancelled));
	}
}
