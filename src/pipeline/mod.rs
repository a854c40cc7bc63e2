//! The ordered notification pipeline (spec.md §4.3).
//!
//! Stages run strictly in declared order for a single group+receiver
//! invocation (spec.md §5 "Within one pipeline invocation, stages execute
//! strictly in declared order"); each stage lives in its own submodule,
//! mirroring the daemon's one-file-per-handler layout (`http_server/endpoints/*`).

mod dedup;
mod retry;
mod wait;

use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::{debug, info, instrument, warn};

use tokio_util::sync::CancellationToken;

use crate::{
	clock::SharedClock,
	error::PipelineError,
	inhibit::Inhibitor,
	marker::MarkerStore,
	nflog::{NflogKey, NotificationLog},
	receiver::{Notification, NotificationAlert, Receiver},
	silence::Silences,
	types::{Fingerprint, GroupKey},
};

pub use dedup::DedupDecision;
pub use retry::RetryPolicy;

/// One alert as carried through the pipeline: its identity, payload, and
/// whether this flush represents its resolution (spec.md §4.2 "a synthetic
/// resolved copy").
#[derive(Debug, Clone)]
pub struct PipelineAlert {
	pub fingerprint: Fingerprint,
	pub labels: crate::types::LabelSet,
	pub annotations: crate::types::Annotations,
	pub resolved: bool,
}

/// Reports whether a peer has settled into the gossip cluster and its
/// position among live peers (spec.md §4.7). Implemented by `cluster::Cluster`;
/// defined here so the pipeline does not depend on the cluster module's
/// transport internals.
#[async_trait::async_trait]
pub trait ClusterView: Send + Sync {
	/// Blocks until settled or `bound` elapses, whichever is first
	/// (spec.md §4.3 stage 1 "GossipSettleWait").
	async fn wait_settled(&self, bound: Duration);
	/// The local peer's lexicographic rank among live peers
	/// (spec.md §4.7 "Peer position").
	fn peer_position(&self) -> usize;
}

/// A cluster view that is always settled at position 0, for single-node
/// operation and for tests that don't exercise gossip timing.
pub struct SingleNodeCluster;

#[async_trait::async_trait]
impl ClusterView for SingleNodeCluster {
	async fn wait_settled(&self, _bound: Duration) {}
	fn peer_position(&self) -> usize {
		0
	}
}

/// Shared collaborators a pipeline invocation needs (spec.md §2 component table).
pub struct PipelineContext {
	pub silences: Arc<Silences>,
	pub inhibitor: Arc<Inhibitor>,
	pub nflog: Arc<NotificationLog>,
	pub marker: Arc<MarkerStore>,
	pub clock: SharedClock,
	pub cluster: Arc<dyn ClusterView>,
	pub gossip_settle_wait_bound: Duration,
	pub peer_position_base_timeout: Duration,
	pub retry_policy: RetryPolicy,
	/// Cancelled on dispatcher shutdown; every suspension point in `run`
	/// selects against it and abandons the invocation (spec.md §5
	/// "Cancellation and timeouts").
	pub shutdown: CancellationToken,
}

/// Runs the full 9-stage pipeline for one (group, receiver) invocation
/// (spec.md §4.3). Fan-out across receivers (stage 3) is the caller's
/// responsibility: invoke this once per receiver, concurrently, from the
/// dispatcher's flush path.
#[instrument(skip(ctx, receiver, alerts), fields(group = %group_key, receiver = receiver.name()))]
pub async fn run(
	ctx: &PipelineContext,
	group_key: &GroupKey,
	receiver: &dyn Receiver,
	repeat_interval: jiff::Span,
	alerts: Vec<PipelineAlert>,
) -> Result<(), PipelineError> {
	let cancelled = || PipelineError::Cancelled { group_key: group_key.to_string() };

	// 1. GossipSettleWait
	tokio::select! {
		biased;
		_ = ctx.shutdown.cancelled() => return Err(cancelled()),
		_ = ctx.cluster.wait_settled(ctx.gossip_settle_wait_bound) => {}
	}

	// 2. WaitByPeerPosition
	if wait::by_peer_position(ctx.peer_position_base_timeout, ctx.cluster.peer_position(), &ctx.shutdown).await {
		return Err(cancelled());
	}

	// 3. FanOutByReceiver happens at the call site (one `run` per receiver).

	// 4. Inhibit
	let after_inhibit: Vec<PipelineAlert> = alerts
		.into_iter()
		.filter(|a| {
			let source = ctx.inhibitor.mutes(&a.labels);
			let muted = source.is_some();
			ctx.marker.with_mut(a.fingerprint, |m| m.set_inhibited_by(source.into_iter().collect()));
			if muted {
				debug!(fingerprint = %a.fingerprint, "alert inhibited, dropping from notification");
			}
			!muted
		})
		.collect();

	// 5. Silence
	let after_silence: Vec<PipelineAlert> = after_inhibit
		.into_iter()
		.filter(|a| {
			let silenced_by = ctx.silences.mutes(&a.labels);
			let muted = silenced_by.is_some();
			ctx.marker.with_mut(a.fingerprint, |m| m.set_silenced_by(silenced_by.into_iter().collect()));
			if muted {
				debug!(fingerprint = %a.fingerprint, "alert silenced, dropping from notification");
			}
			!muted
		})
		.collect();

	if after_silence.is_empty() {
		debug!("no alerts remain after inhibit/silence, nothing to send");
		return Ok(());
	}

	// 6. WaitByConfiguredDelay
	if wait::by_configured_delay(receiver.send_delay(), &ctx.shutdown).await {
		return Err(cancelled());
	}

	// 7. Dedup
	let nflog_key = NflogKey {
		group_key: group_key.clone(),
		receiver: receiver.name().to_string(),
	};
	let previous = ctx.nflog.query(&nflog_key);
	let now = ctx.clock.now();
	let firing: HashSet<Fingerprint> = after_silence.iter().filter(|a| !a.resolved).map(|a| a.fingerprint).collect();
	let resolved: HashSet<Fingerprint> = after_silence.iter().filter(|a| a.resolved).map(|a| a.fingerprint).collect();

	match dedup::decide(previous.as_ref(), &firing, &resolved, now, repeat_interval) {
		DedupDecision::Skip => {
			debug!(%group_key, "dedup: skipping resend, repeat-interval not yet elapsed");
			return Ok(());
		}
		DedupDecision::Send => {}
	}

	// 8. Retry
	let notification = Notification {
		group_key: group_key.to_string(),
		receiver: receiver.name().to_string(),
		firing: after_silence
			.iter()
			.filter(|a| !a.resolved)
			.map(to_notification_alert)
			.collect(),
		resolved: after_silence
			.iter()
			.filter(|a| a.resolved)
			.map(to_notification_alert)
			.collect(),
	};

	retry::send_with_retry(receiver, &notification, &ctx.retry_policy, &ctx.shutdown)
		.await
		.map_err(|failure| match failure {
			retry::RetryFailure::Cancelled => cancelled(),
			retry::RetryFailure::Failed(source, attempts) if attempts >= ctx.retry_policy.max_attempts => PipelineError::RetriesExhausted {
				receiver: receiver.name().to_string(),
				attempts,
			},
			retry::RetryFailure::Failed(source, _attempts) => PipelineError::Permanent {
				receiver: receiver.name().to_string(),
				source: Box::new(source),
			},
		})?;

	// 9. SetNotifies
	let entry = ctx.nflog.log(nflog_key, firing, resolved);
	info!(%group_key, receiver = receiver.name(), "notification sent");
	crate::metrics::inc_notifications_sent(receiver.name());
	let _ = entry; // broadcast is wired by the cluster module's channel registration

	Ok(())
}

fn to_notification_alert(a: &PipelineAlert) -> NotificationAlert {
	NotificationAlert {
		fingerprint: a.fingerprint,
		labels: a.labels.clone(),
		annotations: a.annotations.clone(),
	}
}

/// Fans out a flushed group snapshot to every configured receiver, running
/// each receiver's pipeline concurrently; an error in one receiver does not
/// affect others (spec.md §4.3 "an error in one receiver does not affect others").
pub async fn fan_out_by_receiver(
	ctx: Arc<PipelineContext>,
	group_key: GroupKey,
	receivers: Vec<Arc<dyn Receiver>>,
	repeat_interval: jiff::Span,
	alerts: Vec<PipelineAlert>,
) -> Vec<(String, Result<(), PipelineError>)> {
	let mut handles = Vec::with_capacity(receivers.len());
	for receiver in receivers {
		let ctx = ctx.clone();
		let group_key = group_key.clone();
		let alerts = alerts.clone();
		handles.push(tokio::spawn(async move {
			let name = receiver.name().to_string();
			let result = run(&ctx, &group_key, receiver.as_ref(), repeat_interval, alerts).await;
			if let Err(err) = &result {
				warn!(receiver = %name, error = %crate::error::LogError(err), "pipeline invocation failed");
				crate::metrics::inc_notifications_failed(&name);
			}
			(name, result)
		}));
	}
	let mut results = Vec::with_capacity(handles.len());
	for handle in handles {
		match handle.await {
			Ok(pair) => results.push(pair),
			Err(_) => continue, // task panicked/cancelled; spec.md §4.3 "on context cancellation, aborts"
		}
	}
	results
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::{
		clock::FakeClock,
		matcher::Matcher,
		receiver::RecordingReceiver,
		silence::SilenceLimits,
		types::{Annotations, LabelSet},
	};

	fn ctx(clock: FakeClock) -> PipelineContext {
		let shared_clock: SharedClock = Arc::new(clock);
		PipelineContext {
			silences: Arc::new(Silences::new(shared_clock.clone(), jiff::Span::new().hours(1), SilenceLimits::default())),
			inhibitor: Arc::new(Inhibitor::compile(vec![]).unwrap()),
			nflog: Arc::new(NotificationLog::new(shared_clock.clone(), jiff::Span::new().hours(5))),
			marker: Arc::new(crate::marker::MarkerStore::new()),
			clock: shared_clock,
			cluster: Arc::new(SingleNodeCluster),
			gossip_settle_wait_bound: Duration::from_millis(0),
			peer_position_base_timeout: Duration::from_millis(0),
			retry_policy: RetryPolicy::default(),
			shutdown: CancellationToken::new(),
		}
	}

	fn alert(name: &str, resolved: bool) -> PipelineAlert {
		let labels = LabelSet::from_pairs([("alertname", name)]);
		PipelineAlert {
			fingerprint: labels.fingerprint(),
			labels,
			annotations: Annotations::new(),
			resolved,
		}
	}

	#[tokio::test]
	async fn delivers_to_receiver_when_nothing_suppresses() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let context = ctx(clock);
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let group_key = GroupKey::new("route-1", vec![]);
		run(&context, &group_key, receiver.as_ref(), jiff::Span::new().minutes(5), vec![alert("Foo", false)])
			.await
			.unwrap();
		assert_eq!(receiver.received().len(), 1);
	}

	#[tokio::test]
	async fn silenced_alert_never_reaches_receiver() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let context = ctx(clock);
		context
			.silences
			.set(
				None,
				vec![Matcher::equal("alertname", "Foo")],
				context.clock.now(),
				context.clock.now().checked_add(jiff::Span::new().minutes(5)).unwrap(),
				"alice".into(),
				"".into(),
			)
			.unwrap();
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let group_key = GroupKey::new("route-1", vec![]);
		run(&context, &group_key, receiver.as_ref(), jiff::Span::new().minutes(5), vec![alert("Foo", false)])
			.await
			.unwrap();
		assert!(receiver.received().is_empty());
	}

	#[tokio::test]
	async fn dedup_skips_resend_before_repeat_interval() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let context = ctx(clock.clone());
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let group_key = GroupKey::new("route-1", vec![]);
		let repeat = jiff::Span::new().minutes(5);

		run(&context, &group_key, receiver.as_ref(), repeat, vec![alert("Foo", false)]).await.unwrap();
		assert_eq!(receiver.received().len(), 1);

		clock.advance(jiff::Span::new().seconds(30));
		run(&context, &group_key, receiver.as_ref(), repeat, vec![alert("Foo", false)]).await.unwrap();
		assert_eq!(receiver.received().len(), 1, "should not resend before repeat-interval");

		clock.advance(jiff::Span::new().minutes(5));
		run(&context, &group_key, receiver.as_ref(), repeat, vec![alert("Foo", false)]).await.unwrap();
		assert_eq!(receiver.received().len(), 2, "should resend after repeat-interval elapses");
	}

	#[tokio::test]
	async fn retryable_failure_eventually_succeeds() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let mut context = ctx(clock);
		context.retry_policy = RetryPolicy {
			max_attempts: 5,
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
		};
		let receiver = Arc::new(RecordingReceiver::new("webhook-b").fail_retryably_for(2));
		let group_key = GroupKey::new("route-1", vec![]);
		run(&context, &group_key, receiver.as_ref(), jiff::Span::new().minutes(5), vec![alert("Foo", false)])
			.await
			.unwrap();
		assert_eq!(receiver.received().len(), 1);
	}

	#[tokio::test]
	async fn silence_stage_records_the_silencing_id_on_the_marker() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let context = ctx(clock);
		let silence_id = context
			.silences
			.set(
				None,
				vec![Matcher::equal("alertname", "Foo")],
				context.clock.now(),
				context.clock.now().checked_add(jiff::Span::new().minutes(5)).unwrap(),
				"alice".into(),
				"".into(),
			)
			.unwrap();
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let group_key = GroupKey::new("route-1", vec![]);
		let a = alert("Foo", false);
		let fp = a.fingerprint;
		run(&context, &group_key, receiver.as_ref(), jiff::Span::new().minutes(5), vec![a]).await.unwrap();

		let marker = context.marker.get(fp).unwrap();
		assert!(marker.active_silence_ids.contains(&silence_id));
		assert_eq!(marker.state, crate::marker::MarkerState::Suppressed);
	}

	#[tokio::test]
	async fn cancellation_before_dispatch_abandons_the_invocation() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let mut context = ctx(clock);
		context.peer_position_base_timeout = Duration::from_secs(60);
		context.cluster = Arc::new(SingleNodeCluster);
		context.shutdown.cancel();
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let group_key = GroupKey::new("route-1", vec![]);
		let err = run(&context, &group_key, receiver.as_ref(), jiff::Span::new().minutes(5), vec![alert("Foo", false)])
			.await
			.unwrap_err();
		assert!(matches!(err, PipelineError::Cancelled { .. }));
		assert!(receiver.received().is_empty());
	}
}
