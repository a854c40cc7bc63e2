//! Typed configuration surface (SPEC_FULL.md §2.3).
//!
//! Concrete receiver bodies are out of scope (spec.md §1 Non-goals), so
//! `ReceiverConfig` only carries enough to know a receiver *exists* under a
//! name a route can target; wiring a name to an actual `Arc<dyn Receiver>`
//! is the embedder's job.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use miette::{IntoDiagnostic, Result, miette};
use serde::Deserialize;
use ulid::Ulid;

use crate::{
	cluster::{ClusterConfig, TlsMaterial, TransportConfig},
	inhibit::InhibitRuleConfig,
	route::RouteConfig,
	silence::SilenceLimits,
};

/// A receiver name a route can target. Holds no delivery configuration of
/// its own (spec.md §1 "concrete receiver implementations" is a Non-goal);
/// `kind` is free-form, read only by the embedder's receiver factory.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverConfig {
	pub name: String,
	pub kind: String,
}

/// Gossip cluster section of the config file, converted into a
/// `ClusterConfig` at startup once an `identity` has been settled on.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSection {
	pub bind_addr: SocketAddr,
	pub advertise_addr: SocketAddr,
	#[serde(default)]
	pub seeds: Vec<String>,
	#[serde(default = "default_probe_interval")]
	pub probe_interval_secs: u64,
	#[serde(default = "default_gossip_interval")]
	pub gossip_interval_secs: u64,
	#[serde(default = "default_push_pull_interval")]
	pub push_pull_interval_secs: u64,
	#[serde(default = "default_reconnect_interval")]
	pub reconnect_interval_secs: u64,
	#[serde(default = "default_reconnect_timeout")]
	pub reconnect_timeout_secs: u64,
	#[serde(default = "default_settle_poll_interval")]
	pub settle_poll_interval_secs: u64,
	#[serde(default = "default_settle_deadline")]
	pub settle_deadline_secs: u64,
	#[serde(default = "default_push_pull_timeout")]
	pub push_pull_timeout_secs: u64,
	/// Absent: plain TCP (the default). Present: mutual TLS between peers
	/// off a shared cluster CA (spec.md §4.7 "Transport").
	#[serde(default)]
	pub tls: Option<TlsSection>,
}

/// PEM file paths for the TLS transport variant.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TlsSection {
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	pub ca_path: PathBuf,
}

fn default_probe_interval() -> u64 {
	1
}

fn default_gossip_interval() -> u64 {
	1
}

fn default_push_pull_interval() -> u64 {
	30
}

fn default_reconnect_interval() -> u64 {
	10
}

fn default_reconnect_timeout() -> u64 {
	60
}

fn default_settle_poll_interval() -> u64 {
	1
}

fn default_settle_deadline() -> u64 {
	15
}

fn default_push_pull_timeout() -> u64 {
	5
}

impl ClusterSection {
	/// Builds a `ClusterConfig` for a freshly-chosen peer identity.
	///
	/// `identity` is not read from the file: it is generated once per
	/// process and persisted by the embedder alongside the data directory
	/// (spec.md §4.7 "each peer participates in gossip with a ULID
	/// identity"), not baked into static config shared across replicas.
	pub fn into_cluster_config(self, identity: Ulid) -> Result<ClusterConfig> {
		let transport = match &self.tls {
			None => TransportConfig::Tcp,
			Some(tls) => TransportConfig::Tls(std::sync::Arc::new(
				TlsMaterial::load(&tls.cert_path, &tls.key_path, &tls.ca_path).map_err(|err| miette!("failed to load cluster TLS material: {err}"))?,
			)),
		};
		Ok(ClusterConfig {
			identity,
			bind_addr: self.bind_addr,
			advertise_addr: self.advertise_addr,
			seeds: self.seeds,
			probe_interval: Duration::from_secs(self.probe_interval_secs),
			gossip_interval: Duration::from_secs(self.gossip_interval_secs),
			push_pull_interval: Duration::from_secs(self.push_pull_interval_secs),
			reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
			reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
			settle_poll_interval: Duration::from_secs(self.settle_poll_interval_secs),
			settle_deadline: Duration::from_secs(self.settle_deadline_secs),
			push_pull_timeout: Duration::from_secs(self.push_pull_timeout_secs),
			transport,
		})
	}
}

/// Retention/limits for the two gossiped stores (spec.md §4.4, §4.6).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoreSection {
	pub silence_retention: jiff::Span,
	pub nflog_retention: jiff::Span,
	#[serde(default = "default_silence_max_count")]
	pub silence_max_count: usize,
	#[serde(default = "default_silence_max_encoded_size")]
	pub silence_max_encoded_size: usize,
}

fn default_silence_max_count() -> usize {
	SilenceLimits::default().max_count
}

fn default_silence_max_encoded_size() -> usize {
	SilenceLimits::default().max_encoded_size
}

impl StoreSection {
	pub fn silence_limits(&self) -> SilenceLimits {
		SilenceLimits {
			max_count: self.silence_max_count,
			max_encoded_size: self.silence_max_encoded_size,
		}
	}
}

/// Root configuration object (SPEC_FULL.md §2.3).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// Directory snapshot files (`silences.json`, `nflog.json`) are
	/// persisted to and loaded from on startup (spec.md §4.4, §4.6
	/// "Snapshot format").
	pub data_dir: PathBuf,
	/// How long an alert may go unreported before the provider expires it
	/// (spec.md §4 "Alert Provider").
	pub resolve_timeout: jiff::Span,
	pub routes: RouteConfig,
	#[serde(default)]
	pub receivers: Vec<ReceiverConfig>,
	#[serde(default)]
	pub inhibit_rules: Vec<InhibitRuleConfig>,
	pub cluster: ClusterSection,
	pub stores: StoreSection,
}

impl Config {
	pub fn from_yaml(content: &str) -> Result<Self> {
		serde_yaml::from_str(content).into_diagnostic()
	}

	pub fn from_json(content: &str) -> Result<Self> {
		serde_json::from_str(content).into_diagnostic()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_yaml() -> &'static str {
		r#"
dataDir: /var/lib/alertmantle
resolveTimeout: 5m
routes:
  id: root
  receiver: default
  groupWait: 30s
  groupInterval: 5m
  repeatInterval: 4h
cluster:
  bindAddr: 0.0.0.0:7946
  advertiseAddr: 10.0.0.1:7946
  seeds: ["10.0.0.2:7946"]
stores:
  silenceRetention: 120h
  nflogRetention: 120h
"#
	}

	fn sample_json() -> &'static str {
		r#"{
			"dataDir": "/var/lib/alertmantle",
			"resolveTimeout": "5m",
			"routes": {
				"id": "root",
				"receiver": "default",
				"groupWait": "30s",
				"groupInterval": "5m",
				"repeatInterval": "4h"
			},
			"cluster": {
				"bindAddr": "0.0.0.0:7946",
				"advertiseAddr": "10.0.0.1:7946",
				"seeds": ["10.0.0.2:7946"]
			},
			"stores": {
				"silenceRetention": "120h",
				"nflogRetention": "120h"
			}
		}"#
	}

	#[test]
	fn parses_a_minimal_yaml_document() {
		let config = Config::from_yaml(sample_yaml()).unwrap();
		assert_eq!(config.routes.receiver, "default");
		assert_eq!(config.cluster.seeds, vec!["10.0.0.2:7946".to_string()]);
		assert!(config.receivers.is_empty());
		assert!(config.inhibit_rules.is_empty());
	}

	#[test]
	fn cluster_section_converts_with_injected_identity() {
		let config = Config::from_yaml(sample_yaml()).unwrap();
		let identity = Ulid::new();
		let cluster_config = config.cluster.into_cluster_config(identity).unwrap();
		assert_eq!(cluster_config.identity, identity);
		assert_eq!(cluster_config.probe_interval, Duration::from_secs(1));
		assert_eq!(cluster_config.push_pull_interval, Duration::from_secs(30));
	}

	#[test]
	fn parses_a_minimal_json_document() {
		let config = Config::from_json(sample_json()).unwrap();
		assert_eq!(config.routes.receiver, "default");
		assert_eq!(config.stores.silence_max_count, SilenceLimits::default().max_count);
	}

	#[test]
	fn cluster_section_without_tls_defaults_to_plain_transport() {
		let config = Config::from_yaml(sample_yaml()).unwrap();
		assert!(config.cluster.tls.is_none());
	}

	#[test]
	fn cluster_section_surfaces_tls_material_load_failures() {
		let yaml = r#"
dataDir: /var/lib/alertmantle
resolveTimeout: 5m
routes:
  id: root
  receiver: default
  groupWait: 30s
  groupInterval: 5m
  repeatInterval: 4h
cluster:
  bindAddr: 0.0.0.0:7946
  advertiseAddr: 10.0.0.1:7946
  seeds: ["10.0.0.2:7946"]
  tls:
    certPath: /nonexistent/cert.pem
    keyPath: /nonexistent/key.pem
    caPath: /nonexistent/ca.pem
stores:
  silenceRetention: 120h
  nflogRetention: 120h
"#;
		let config = Config::from_yaml(yaml).unwrap();
		assert!(config.cluster.tls.is_some());
		assert!(config.cluster.into_cluster_config(Ulid::new()).is_err());
	}
}
