//! Receiver trait and reference test doubles (spec.md §1 Non-goals: concrete
//! receiver bodies are out of scope; SPEC_FULL.md §2.6 keeps only the thin
//! interface the pipeline calls).

use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{Annotations, Fingerprint, LabelSet};

/// A fully-rendered notification payload (template rendering is an external
/// collaborator, spec.md §1 Non-goals).
#[derive(Debug, Clone)]
pub struct Notification {
	pub group_key: String,
	pub receiver: String,
	pub firing: Vec<NotificationAlert>,
	pub resolved: Vec<NotificationAlert>,
}

#[derive(Debug, Clone)]
pub struct NotificationAlert {
	pub fingerprint: Fingerprint,
	pub labels: LabelSet,
	pub annotations: Annotations,
}

/// An error returned by a receiver's send attempt, carrying whether the
/// pipeline's Retry stage should back off and retry or abandon
/// (spec.md §4.3 "Retry": "on retryable failure... backs off... on
/// non-retryable failure, propagates error").
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
	pub message: String,
	pub retryable: bool,
}

impl SendError {
	pub fn retryable(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			retryable: true,
		}
	}

	pub fn permanent(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			retryable: false,
		}
	}
}

/// The pipeline's view of an outbound destination.
#[async_trait]
pub trait Receiver: Send + Sync {
	fn name(&self) -> &str;
	async fn send(&self, notification: &Notification) -> Result<(), SendError>;
	/// The receiver-specific send delay applied by WaitByConfiguredDelay
	/// (spec.md §4.3 stage 6).
	fn send_delay(&self) -> std::time::Duration {
		std::time::Duration::ZERO
	}
}

/// Accepts every notification without doing anything, used to exercise the
/// pipeline in tests that don't care about delivery content.
pub struct NullReceiver {
	name: String,
}

impl NullReceiver {
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into() }
	}
}

#[async_trait]
impl Receiver for NullReceiver {
	fn name(&self) -> &str {
		&self.name
	}

	async fn send(&self, _notification: &Notification) -> Result<(), SendError> {
		Ok(())
	}
}

/// Records every notification it receives, and can be configured to fail the
/// first N sends retryably, for exercising the Retry stage
/// (spec.md §8 scenario 4 "Retry").
pub struct RecordingReceiver {
	name: String,
	received: Mutex<Vec<Notification>>,
	fail_until_call: Mutex<usize>,
}

impl RecordingReceiver {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			received: Mutex::new(Vec::new()),
			fail_until_call: Mutex::new(0),
		}
	}

	pub fn fail_retryably_for(self, calls: usize) -> Self {
		*self.fail_until_call.lock().unwrap() = calls;
		self
	}

	pub fn received(&self) -> Vec<Notification> {
		self.received.lock().unwrap().clone()
	}
}

#[async_trait]
impl Receiver for RecordingReceiver {
	fn name(&self) -> &str {
		&self.name
	}

	async fn send(&self, notification: &Notification) -> Result<(), SendError> {
		let mut remaining = self.fail_until_call.lock().unwrap();
		if *remaining > 0 {
			*remaining -= 1;
			return Err(SendError::retryable("receiver temporarily unavailable"));
		}
		drop(remaining);
		self.received.lock().unwrap().push(notification.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn notification() -> Notification {
		Notification {
			group_key: "g".into(),
			receiver: "r".into(),
			firing: Vec::new(),
			resolved: Vec::new(),
		}
	}

	#[tokio::test]
	async fn null_receiver_always_succeeds() {
		let receiver = NullReceiver::new("null");
		assert!(receiver.send(&notification()).await.is_ok());
	}

	#[tokio::test]
	async fn recording_receiver_fails_retryably_then_succeeds() {
		let receiver = RecordingReceiver::new("webhook-b").fail_retryably_for(2);
		assert!(receiver.send(&notification()).await.unwrap_err().retryable);
		assert!(receiver.send(&notification()).await.unwrap_err().retryable);
		assert!(receiver.send(&notification()).await.is_ok());
		assert_eq!(receiver.received().len(), 1);
	}
}
