//! Prometheus metrics (SPEC_FULL.md §2.4; spec.md §6 "Metrics (produced)").
//!
//! Tracks the following metrics:
//! - `alertmantle_cluster_failed_peers`: Peers currently in the Failed state (gauge)
//! - `alertmantle_cluster_reconnects_total`: Peer rejoin events observed (counter)
//! - `alertmantle_silences_by_state`: Silences grouped by logical state (gauge vec)
//! - `alertmantle_gc_duration_seconds`: Time spent in a GC pass (summary)
//! - `alertmantle_snapshot_bytes`: Size of the last snapshot written, per component (gauge vec)
//! - `alertmantle_query_duration_seconds`: Time spent answering a store query (histogram)
//! - `alertmantle_notifications_sent_total` / `_failed_total`: Pipeline delivery outcomes per receiver (counter vecs)

use std::sync::OnceLock;

use miette::{IntoDiagnostic, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CLUSTER_FAILED_PEERS: OnceLock<IntGauge> = OnceLock::new();
static CLUSTER_RECONNECTS_TOTAL: OnceLock<prometheus::IntCounter> = OnceLock::new();
static SILENCES_BY_STATE: OnceLock<IntGaugeVec> = OnceLock::new();
static GC_DURATION: OnceLock<prometheus::Histogram> = OnceLock::new();
static SNAPSHOT_BYTES: OnceLock<IntGaugeVec> = OnceLock::new();
static QUERY_DURATION: OnceLock<Histogram> = OnceLock::new();
static NOTIFICATIONS_SENT_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static NOTIFICATIONS_FAILED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

pub fn init_metrics() {
	let registry = Registry::new();

	let cluster_failed_peers = IntGauge::new("alertmantle_cluster_failed_peers", "Peers currently in the Failed state").expect("failed to create cluster_failed_peers metric");

	let cluster_reconnects_total = prometheus::IntCounter::new("alertmantle_cluster_reconnects_total", "Peer rejoin events observed").expect("failed to create cluster_reconnects_total metric");

	let silences_by_state = IntGaugeVec::new(Opts::new("alertmantle_silences_by_state", "Silence count grouped by logical state"), &["state"]).expect("failed to create silences_by_state metric");

	let gc_duration = prometheus::Histogram::with_opts(HistogramOpts::new("alertmantle_gc_duration_seconds", "Time spent in a GC pass")).expect("failed to create gc_duration metric");

	let snapshot_bytes = IntGaugeVec::new(Opts::new("alertmantle_snapshot_bytes", "Size in bytes of the last snapshot written"), &["component"]).expect("failed to create snapshot_bytes metric");

	let query_duration = Histogram::with_opts(HistogramOpts::new("alertmantle_query_duration_seconds", "Time spent answering a store query")).expect("failed to create query_duration metric");

	let notifications_sent_total = IntCounterVec::new(Opts::new("alertmantle_notifications_sent_total", "Notifications successfully sent"), &["receiver"]).expect("failed to create notifications_sent_total metric");

	let notifications_failed_total =
		IntCounterVec::new(Opts::new("alertmantle_notifications_failed_total", "Notifications that failed to send"), &["receiver"]).expect("failed to create notifications_failed_total metric");

	registry.register(Box::new(cluster_failed_peers.clone())).expect("failed to register cluster_failed_peers metric");
	registry.register(Box::new(cluster_reconnects_total.clone())).expect("failed to register cluster_reconnects_total metric");
	registry.register(Box::new(silences_by_state.clone())).expect("failed to register silences_by_state metric");
	registry.register(Box::new(gc_duration.clone())).expect("failed to register gc_duration metric");
	registry.register(Box::new(snapshot_bytes.clone())).expect("failed to register snapshot_bytes metric");
	registry.register(Box::new(query_duration.clone())).expect("failed to register query_duration metric");
	registry.register(Box::new(notifications_sent_total.clone())).expect("failed to register notifications_sent_total metric");
	registry.register(Box::new(notifications_failed_total.clone())).expect("failed to register notifications_failed_total metric");

	REGISTRY.set(registry).expect("metrics already initialized");
	CLUSTER_FAILED_PEERS.set(cluster_failed_peers).expect("metrics already initialized");
	CLUSTER_RECONNECTS_TOTAL.set(cluster_reconnects_total).expect("metrics already initialized");
	SILENCES_BY_STATE.set(silences_by_state).expect("metrics already initialized");
	GC_DURATION.set(gc_duration).expect("metrics already initialized");
	SNAPSHOT_BYTES.set(snapshot_bytes).expect("metrics already initialized");
	QUERY_DURATION.set(query_duration).expect("metrics already initialized");
	NOTIFICATIONS_SENT_TOTAL.set(notifications_sent_total).expect("metrics already initialized");
	NOTIFICATIONS_FAILED_TOTAL.set(notifications_failed_total).expect("metrics already initialized");
}

pub fn set_cluster_failed_peers(count: usize) {
	if let Some(metric) = CLUSTER_FAILED_PEERS.get() {
		metric.set(count as i64);
	}
}

pub fn inc_cluster_reconnects() {
	if let Some(metric) = CLUSTER_RECONNECTS_TOTAL.get() {
		metric.inc();
	}
}

pub fn set_silences_by_state(state: &str, count: usize) {
	if let Some(metric) = SILENCES_BY_STATE.get() {
		metric.with_label_values(&[state]).set(count as i64);
	}
}

pub fn observe_gc_duration(seconds: f64) {
	if let Some(metric) = GC_DURATION.get() {
		metric.observe(seconds);
	}
}

pub fn set_snapshot_bytes(component: &str, bytes: usize) {
	if let Some(metric) = SNAPSHOT_BYTES.get() {
		metric.with_label_values(&[component]).set(bytes as i64);
	}
}

pub fn observe_query_duration(seconds: f64) {
	if let Some(metric) = QUERY_DURATION.get() {
		metric.observe(seconds);
	}
}

pub fn inc_notifications_sent(receiver: &str) {
	if let Some(metric) = NOTIFICATIONS_SENT_TOTAL.get() {
		metric.with_label_values(&[receiver]).inc();
	}
}

pub fn inc_notifications_failed(receiver: &str) {
	if let Some(metric) = NOTIFICATIONS_FAILED_TOTAL.get() {
		metric.with_label_values(&[receiver]).inc();
	}
}

pub fn gather_metrics() -> Result<String> {
	let registry = REGISTRY.get().ok_or_else(|| miette::miette!("metrics not initialized"))?;
	let metric_families = registry.gather();
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();
	encoder.encode(&metric_families, &mut buffer).into_diagnostic()?;
	String::from_utf8(buffer).into_diagnostic()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn gather_before_init_is_an_error() {
		// NB: relies on test execution order not having called init_metrics()
		// in this process; acceptable for a smoke test of the error path.
		if REGISTRY.get().is_none() {
			assert!(gather_metrics().is_err());
		}
	}
}
