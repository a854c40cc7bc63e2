//! In-memory alert set with fingerprint-keyed merge and subscription fan-out
//! (spec.md §2 "Alert Provider", §3 "Merge rule", §5 "Shared-resource policy",
//! §9 "Gossip coroutine-ish subscribers").
//!
//! The `Arc<RwLock<HashMap<..>>>` shape follows the daemon's own
//! `Scheduler` state (`alertd/src/scheduler.rs`'s
//! `alerts: Arc<RwLock<HashMap<PathBuf, Arc<RwLock<AlertState>>>>>`), generalized
//! from a path-keyed map to a fingerprint-keyed one.

use std::{collections::HashMap, sync::RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
	clock::SharedClock,
	error::IngestError,
	types::{Alert, Annotations, Fingerprint, LabelSet},
};

/// Bound on each subscriber's queue (spec.md §5 "bounded channel (size O(hundreds))").
const SUBSCRIBER_QUEUE_SIZE: usize = 256;

/// A "next alert" iterator backed by a bounded queue, dropped on overflow
/// rather than blocking ingest (spec.md §9).
pub struct AlertSubscription {
	rx: mpsc::Receiver<Alert>,
}

impl AlertSubscription {
	pub async fn next(&mut self) -> Option<Alert> {
		self.rx.recv().await
	}

	pub fn close(&mut self) {
		self.rx.close();
	}
}

struct Subscriber {
	tx: mpsc::Sender<Alert>,
}

/// The provider's fingerprint-keyed alert map plus its subscriber list, guarded
/// by a single mutex (spec.md §5: "single mutex guarding the fingerprint map
/// and the subscriber set; read-mostly; short critical sections").
struct Inner {
	alerts: HashMap<Fingerprint, Alert>,
	subscribers: Vec<Subscriber>,
}

pub struct AlertProvider {
	inner: RwLock<Inner>,
	clock: SharedClock,
	resolve_timeout: jiff::Span,
}

impl AlertProvider {
	pub fn new(clock: SharedClock, resolve_timeout: jiff::Span) -> Self {
		Self {
			inner: RwLock::new(Inner {
				alerts: HashMap::new(),
				subscribers: Vec::new(),
			}),
			clock,
			resolve_timeout,
		}
	}

	/// Ingests a single alert (spec.md §6 "Alert ingest"), applying the merge
	/// rule (spec.md §3) when a live alert already holds this fingerprint, and
	/// fanning the resulting alert out to every subscriber.
	pub fn put(
		&self,
		labels: LabelSet,
		annotations: Annotations,
		starts_at: Option<jiff::Timestamp>,
		ends_at: Option<jiff::Timestamp>,
		generator_url: Option<String>,
	) -> Result<Fingerprint, IngestError> {
		let now = self.clock.now();
		let incoming = Alert::ingest(
			labels,
			annotations,
			starts_at,
			ends_at,
			generator_url,
			now,
			self.resolve_timeout,
		)?;
		let fp = incoming.fingerprint();

		let merged = {
			let mut inner = self.inner.write().unwrap();
			let merged = match inner.alerts.get(&fp) {
				Some(existing) => existing.merge(&incoming),
				None => incoming,
			};
			inner.alerts.insert(fp, merged.clone());
			merged
		};

		self.broadcast(merged);
		Ok(fp)
	}

	fn broadcast(&self, alert: Alert) {
		let mut inner = self.inner.write().unwrap();
		inner.subscribers.retain(|sub| match sub.tx.try_send(alert.clone()) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!("alert subscriber queue full, dropping notification");
				true
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		});
	}

	pub fn get(&self, fp: Fingerprint) -> Option<Alert> {
		self.inner.read().unwrap().alerts.get(&fp).cloned()
	}

	pub fn all(&self) -> Vec<Alert> {
		self.inner.read().unwrap().alerts.values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.read().unwrap().alerts.len()
	}

	/// Removes alerts resolved for longer than `resolve_timeout`
	/// (spec.md §3 "garbage-collected when end-time + resolve-timeout < now").
	pub fn gc(&self) -> usize {
		let now = self.clock.now();
		let mut inner = self.inner.write().unwrap();
		let before = inner.alerts.len();
		inner.alerts.retain(|_, alert| !alert.expired(now, self.resolve_timeout));
		let removed = before - inner.alerts.len();
		if removed > 0 {
			debug!(removed, "garbage-collected resolved alerts");
		}
		removed
	}

	/// Registers a new subscriber and returns its alert stream (spec.md §9).
	pub fn subscribe(&self) -> AlertSubscription {
		let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
		self.inner.write().unwrap().subscribers.push(Subscriber { tx });
		AlertSubscription { rx }
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::clock::FakeClock;

	fn provider() -> (AlertProvider, FakeClock) {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let provider = AlertProvider::new(Arc::new(clock.clone()), jiff::Span::new().minutes(5));
		(provider, clock)
	}

	#[test]
	fn put_assigns_stable_fingerprint_across_re_ingest() {
		let (provider, _clock) = provider();
		let fp1 = provider
			.put(
				LabelSet::from_pairs([("alertname", "Foo")]),
				Annotations::new(),
				None,
				None,
				None,
			)
			.unwrap();
		let fp2 = provider
			.put(
				LabelSet::from_pairs([("alertname", "Foo")]),
				Annotations::new(),
				None,
				None,
				None,
			)
			.unwrap();
		assert_eq!(fp1, fp2);
		assert_eq!(provider.len(), 1);
	}

	#[test]
	fn put_rejects_ends_before_starts() {
		let (provider, _clock) = provider();
		let now: jiff::Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
		let err = provider
			.put(
				LabelSet::from_pairs([("a", "b")]),
				Annotations::new(),
				Some(now),
				Some(now.checked_sub(jiff::Span::new().seconds(1)).unwrap()),
				None,
			)
			.unwrap_err();
		assert!(matches!(err, IngestError::EndBeforeStart { .. }));
	}

	#[test]
	fn gc_removes_only_after_resolve_timeout_elapses() {
		let (provider, clock) = provider();
		let now = clock.now();
		provider
			.put(
				LabelSet::from_pairs([("a", "b")]),
				Annotations::new(),
				Some(now),
				Some(now),
				None,
			)
			.unwrap();
		assert_eq!(provider.gc(), 0);
		clock.advance(jiff::Span::new().minutes(10));
		assert_eq!(provider.gc(), 1);
		assert_eq!(provider.len(), 0);
	}

	#[tokio::test]
	async fn subscriber_receives_put_alerts() {
		let (provider, _clock) = provider();
		let mut sub = provider.subscribe();
		provider
			.put(
				LabelSet::from_pairs([("alertname", "Foo")]),
				Annotations::new(),
				None,
				None,
				None,
			)
			.unwrap();
		let alert = sub.next().await.unwrap();
		assert_eq!(alert.labels.get("alertname"), Some("Foo"));
	}
}
