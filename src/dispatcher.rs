//! Aggregation groups and the dispatch loop (spec.md §4.2).
//!
//! Group timers are driven by a single `DelayQueue`-backed wheel rather than
//! one `tokio::time::sleep` task per group, per spec.md §9 "Background timers".
//! The event loop follows the daemon's `tokio::select!` run-loop shape
//! (`alertd/src/daemon.rs`'s `run_with_shutdown`), generalized from file-watch
//! events to alert-subscription and timer events.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex},
};

use futures::StreamExt as _;
use jiff::Timestamp;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, instrument, warn};

use crate::{
	clock::{SharedClock, span_to_duration},
	pipeline::{self, PipelineAlert, PipelineContext},
	provider::AlertProvider,
	receiver::Receiver,
	route::RouteTree,
	types::{Alert, Fingerprint, GroupKey, LabelSet},
};

struct GroupAlert {
	alert: Alert,
	/// True once this alert's resolved copy has been included in a flush
	/// (spec.md §4.2 "A resolved alert must be included in exactly one flush").
	reported_resolved: bool,
}

/// In-memory state for one aggregation group (spec.md §3 "Aggregation group").
struct GroupState {
	alerts: StdMutex<HashMap<Fingerprint, GroupAlert>>,
	/// Serializes flushes for this group: a flush task holds this lock for its
	/// whole invocation, so a timer firing while the previous flush is still
	/// in-flight simply queues behind it instead of running concurrently
	/// (spec.md §5 "a new flush is not scheduled while the previous pipeline
	/// invocation for the same group is in flight").
	flush_lock: Arc<AsyncMutex<()>>,
}

impl GroupState {
	fn new() -> Self {
		Self {
			alerts: StdMutex::new(HashMap::new()),
			flush_lock: Arc::new(AsyncMutex::new(())),
		}
	}

	fn insert(&self, alert: Alert) {
		let fp = alert.fingerprint();
		self.alerts.lock().unwrap().insert(fp, GroupAlert { alert, reported_resolved: false });
	}

	fn is_empty(&self) -> bool {
		self.alerts.lock().unwrap().is_empty()
	}

	/// Snapshots the group's current alerts as pipeline alerts, marking each
	/// resolved alert's resolution reported and pruning entries that were
	/// already reported resolved on a prior flush (spec.md §4.2
	/// "Resolved-alert handling").
	fn snapshot_and_prune(&self, now: Timestamp) -> Vec<PipelineAlert> {
		let mut alerts = self.alerts.lock().unwrap();
		let mut out = Vec::with_capacity(alerts.len());
		alerts.retain(|_, entry| {
			let resolved_now = entry.alert.resolved_at(now);
			if !resolved_now {
				entry.reported_resolved = false;
			}
			if resolved_now && entry.reported_resolved {
				return false;
			}
			out.push(PipelineAlert {
				fingerprint: entry.alert.fingerprint(),
				labels: entry.alert.labels.clone(),
				annotations: entry.alert.annotations.clone(),
				resolved: resolved_now,
			});
			if resolved_now {
				entry.reported_resolved = true;
			}
			true
		});
		out
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
	GroupWait,
	GroupInterval,
}

struct TimerEntry {
	group_key: GroupKey,
	kind: TimerKind,
}

/// Owns aggregation groups, routes incoming alerts into them, and fires
/// pipeline flushes on their timers (spec.md §2 "Dispatcher").
pub struct Dispatcher {
	route_tree: Arc<RouteTree>,
	provider: Arc<AlertProvider>,
	receivers: HashMap<String, Arc<dyn Receiver>>,
	pipeline_ctx: Arc<PipelineContext>,
	clock: SharedClock,
	groups: StdMutex<HashMap<GroupKey, Arc<GroupState>>>,
	shutdown: tokio_util::sync::CancellationToken,
	/// In-flight flush tasks, joined by `run()` on shutdown so `stop()` really
	/// waits for pipeline invocations to finish (spec.md §4.2 "Stop").
	flush_handles: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
	/// Shares `pipeline_ctx.shutdown` as this dispatcher's own shutdown signal,
	/// so `stop()` both stops new flushes from being scheduled and tells every
	/// in-flight pipeline invocation to abandon itself at its next checkpoint
	/// (spec.md §4.2 "Stop", §5 "Cancellation and timeouts").
	pub fn new(
		route_tree: Arc<RouteTree>,
		provider: Arc<AlertProvider>,
		receivers: HashMap<String, Arc<dyn Receiver>>,
		pipeline_ctx: Arc<PipelineContext>,
		clock: SharedClock,
	) -> Arc<Self> {
		let shutdown = pipeline_ctx.shutdown.clone();
		Arc::new(Self {
			route_tree,
			provider,
			receivers,
			pipeline_ctx,
			clock,
			groups: StdMutex::new(HashMap::new()),
			shutdown,
			flush_handles: StdMutex::new(Vec::new()),
		})
	}

	/// Signals shutdown; `run` returns once in-flight flushes complete
	/// (spec.md §4.2 "Stop").
	pub fn stop(&self) {
		self.shutdown.cancel();
	}

	/// Snapshot of group keys currently tracked, for the alert-list/groups API
	/// (spec.md §4.2 "Groups(filter)"). Filtering by label-matcher predicate is
	/// the caller's responsibility over the returned keys' label values.
	pub fn group_keys(&self) -> Vec<GroupKey> {
		self.groups.lock().unwrap().keys().cloned().collect()
	}

	/// Subscribes to the alert provider and runs the dispatch loop until
	/// `stop()` is called (spec.md §4.2 "Run").
	#[instrument(skip(self))]
	pub async fn run(self: Arc<Self>) {
		let mut subscription = self.provider.subscribe();
		let mut timers: DelayQueue<TimerEntry> = DelayQueue::new();
		info!("dispatcher started");
		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => {
					info!("dispatcher shutting down");
					break;
				}
				next = subscription.next() => {
					match next {
						Some(alert) => self.route_and_insert(alert, &mut timers),
						None => break,
					}
				}
				Some(expired) = timers.next() => {
					self.handle_timer(expired.into_inner(), &mut timers).await;
				}
			}
		}
		self.join_in_flight_flushes().await;
	}

	fn route_and_insert(&self, alert: Alert, timers: &mut DelayQueue<TimerEntry>) {
		for route in self.route_tree.route(&alert.labels) {
			let group_key = route.group_key_for(&alert.labels);
			let is_new = {
				let mut groups = self.groups.lock().unwrap();
				let existed = groups.contains_key(&group_key);
				let group = groups.entry(group_key.clone()).or_insert_with(|| Arc::new(GroupState::new()));
				group.insert(alert.clone());
				!existed
			};
			if is_new {
				debug!(%group_key, route = route.id, "new aggregation group, arming group-wait timer");
				timers.insert(
					TimerEntry { group_key, kind: TimerKind::GroupWait },
					span_to_duration(route.group_wait),
				);
			}
		}
	}

	async fn handle_timer(self: &Arc<Self>, entry: TimerEntry, timers: &mut DelayQueue<TimerEntry>) {
		let Some(route) = self.route_tree.node_by_id(&entry.group_key.route_id) else {
			warn!(group = %entry.group_key, "group references a route no longer in the tree, dropping");
			self.groups.lock().unwrap().remove(&entry.group_key);
			return;
		};
		let group = {
			let groups = self.groups.lock().unwrap();
			groups.get(&entry.group_key).cloned()
		};
		let Some(group) = group else {
			return;
		};

		match entry.kind {
			TimerKind::GroupWait => {
				self.spawn_flush(entry.group_key.clone(), group, route.receiver.clone(), route.repeat_interval);
				timers.insert(
					TimerEntry { group_key: entry.group_key, kind: TimerKind::GroupInterval },
					span_to_duration(route.group_interval),
				);
			}
			TimerKind::GroupInterval => {
				if group.is_empty() {
					debug!(group = %entry.group_key, "aggregation group empty after a full group-interval, tearing down");
					self.groups.lock().unwrap().remove(&entry.group_key);
					return;
				}
				self.spawn_flush(entry.group_key.clone(), group, route.receiver.clone(), route.repeat_interval);
				timers.insert(
					TimerEntry { group_key: entry.group_key, kind: TimerKind::GroupInterval },
					span_to_duration(route.group_interval),
				);
			}
		}
	}

	/// Snapshots the group and spawns its pipeline invocation concurrently
	/// (spec.md §4.2 "Flushing → Collecting immediately after snapshot").
	/// Pipeline errors are recorded and never tear down the group
	/// (spec.md §4.2 "Failure policy").
	fn spawn_flush(
		self: &Arc<Self>,
		group_key: GroupKey,
		group: Arc<GroupState>,
		receiver_name: String,
		repeat_interval: jiff::Span,
	) {
		let now = self.clock.now();
		let snapshot = group.snapshot_and_prune(now);
		if snapshot.is_empty() {
			return;
		}
		let Some(receiver) = self.receivers.get(&receiver_name).cloned() else {
			warn!(receiver = receiver_name, "no receiver registered for route, dropping flush");
			return;
		};
		let ctx = self.pipeline_ctx.clone();
		let flush_lock = group.flush_lock.clone();
		let handle = tokio::spawn(async move {
			let _serialization_guard = flush_lock.lock().await;
			let results = pipeline::fan_out_by_receiver(ctx, group_key, vec![receiver], repeat_interval, snapshot).await;
			for (name, result) in results {
				if let Err(err) = result {
					warn!(receiver = name, error = %crate::error::LogError(&err), "pipeline flush failed, will retry next repeat-interval");
				}
			}
		});
		let mut handles = self.flush_handles.lock().unwrap();
		handles.retain(|h| !h.is_finished());
		handles.push(handle);
	}

	/// Awaits every flush task spawned but not yet finished, so `run()` only
	/// returns once all in-flight pipeline invocations have completed
	/// (spec.md §4.2 "Stop").
	async fn join_in_flight_flushes(&self) {
		let handles = std::mem::take(&mut *self.flush_handles.lock().unwrap());
		for handle in handles {
			let _ = handle.await;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		clock::FakeClock,
		inhibit::Inhibitor,
		nflog::NotificationLog,
		pipeline::SingleNodeCluster,
		receiver::RecordingReceiver,
		route::{GroupBy, RouteConfig},
		silence::{SilenceLimits, Silences},
		types::Annotations,
	};

	fn route_config(id: &str, receiver: &str, group_wait_ms: u64, group_interval_ms: u64) -> RouteConfig {
		RouteConfig {
			id: id.to_string(),
			receiver: receiver.to_string(),
			matchers: Vec::new(),
			group_by: GroupBy::Labels(vec!["alertname".to_string()]),
			group_wait: jiff::Span::new().milliseconds(group_wait_ms as i64),
			group_interval: jiff::Span::new().milliseconds(group_interval_ms as i64),
			repeat_interval: jiff::Span::new().minutes(5),
			continue_matching: false,
			children: Vec::new(),
		}
	}

	fn dispatcher(receiver: Arc<RecordingReceiver>, clock: SharedClock) -> (Arc<Dispatcher>, Arc<AlertProvider>) {
		let tree = Arc::new(RouteTree::compile(route_config("root", "webhook", 50, 50)).unwrap());
		let provider = Arc::new(AlertProvider::new(clock.clone(), jiff::Span::new().minutes(5)));
		let mut receivers: HashMap<String, Arc<dyn Receiver>> = HashMap::new();
		receivers.insert("webhook".to_string(), receiver);
		let ctx = Arc::new(PipelineContext {
			silences: Arc::new(Silences::new(clock.clone(), jiff::Span::new().hours(1), SilenceLimits::default())),
			inhibitor: Arc::new(Inhibitor::compile(vec![]).unwrap()),
			nflog: Arc::new(NotificationLog::new(clock.clone(), jiff::Span::new().hours(5))),
			marker: Arc::new(crate::marker::MarkerStore::new()),
			clock: clock.clone(),
			cluster: Arc::new(SingleNodeCluster),
			gossip_settle_wait_bound: Duration::from_millis(0),
			peer_position_base_timeout: Duration::from_millis(0),
			retry_policy: Default::default(),
			shutdown: tokio_util::sync::CancellationToken::new(),
		});
		let dispatcher = Dispatcher::new(tree, provider.clone(), receivers, ctx, clock);
		(dispatcher, provider)
	}

	/// Lets the cooperative scheduler drain every task that is ready to make
	/// progress without depending on wall-clock or paused-clock elapsing,
	/// since the dispatcher spawns a flush task that itself awaits a nested
	/// per-receiver task.
	async fn drain_ready_tasks() {
		for _ in 0..50 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test(start_paused = true)]
	async fn flushes_a_new_group_after_group_wait() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let shared: SharedClock = Arc::new(clock);
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let (dispatcher, provider) = dispatcher(receiver.clone(), shared);

		let run_handle = tokio::spawn(dispatcher.clone().run());
		provider
			.put(LabelSet::from_pairs([("alertname", "Foo")]), Annotations::new(), None, None, None)
			.unwrap();

		tokio::time::advance(Duration::from_millis(200)).await;
		drain_ready_tasks().await;
		assert_eq!(receiver.received().len(), 1);

		dispatcher.stop();
		let _ = tokio::time::timeout(Duration::from_millis(500), run_handle).await;
	}

	#[tokio::test(start_paused = true)]
	async fn group_tears_down_once_empty_after_an_interval() {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let shared: SharedClock = Arc::new(clock);
		let receiver = Arc::new(RecordingReceiver::new("webhook"));
		let (dispatcher, provider) = dispatcher(receiver.clone(), shared.clone());

		let run_handle = tokio::spawn(dispatcher.clone().run());
		let now = shared.now();
		provider
			.put(
				LabelSet::from_pairs([("alertname", "Foo")]),
				Annotations::new(),
				Some(now),
				Some(now),
				None,
			)
			.unwrap();

		tokio::time::advance(Duration::from_millis(400)).await;
		drain_ready_tasks().await;
		assert!(dispatcher.group_keys().is_empty(), "group should have torn down once drained");

		dispatcher.stop();
		let _ = tokio::time::timeout(Duration::from_millis(500), run_handle).await;
	}
}
