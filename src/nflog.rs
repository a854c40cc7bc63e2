//! Durable, gossiped record of notification-log entries (spec.md §4.6).

use std::{
	collections::{HashMap, HashSet},
	io::{Read, Write},
	path::Path,
	sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{clock::SharedClock, error::NflogError, types::{Fingerprint, GroupKey}};

/// Key for a notification-log entry (spec.md §3 "Keyed by (group-key, receiver-name)").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NflogKey {
	pub group_key: GroupKey,
	pub receiver: String,
}

/// A single notification-log entry (spec.md §3 "Notification-log entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NflogEntry {
	pub key: NflogKey,
	pub timestamp: jiff::Timestamp,
	pub firing: HashSet<Fingerprint>,
	pub resolved: HashSet<Fingerprint>,
	pub expires_at: jiff::Timestamp,
}

struct Inner {
	entries: HashMap<NflogKey, NflogEntry>,
}

pub struct NotificationLog {
	inner: RwLock<Inner>,
	clock: SharedClock,
	retention: jiff::Span,
}

impl NotificationLog {
	pub fn new(clock: SharedClock, retention: jiff::Span) -> Self {
		Self {
			inner: RwLock::new(Inner {
				entries: HashMap::new(),
			}),
			clock,
			retention,
		}
	}

	/// Appends/replaces the entry for `key` with `timestamp = now`
	/// (spec.md §4.6 "Log(...)"). Persistence/broadcast are the caller's
	/// responsibility (the pipeline's SetNotifies stage, §4.3).
	pub fn log(&self, key: NflogKey, firing: HashSet<Fingerprint>, resolved: HashSet<Fingerprint>) -> NflogEntry {
		let now = self.clock.now();
		let entry = NflogEntry {
			key: key.clone(),
			timestamp: now,
			firing,
			resolved,
			expires_at: now.checked_add(self.retention).unwrap_or(now),
		};
		self.inner.write().unwrap().entries.insert(key, entry.clone());
		entry
	}

	/// Used by the Dedup stage (spec.md §4.6 "Query(...)").
	pub fn query(&self, key: &NflogKey) -> Option<NflogEntry> {
		self.inner.read().unwrap().entries.get(key).cloned()
	}

	/// CRDT merge: keep the entry with the greatest timestamp per key
	/// (spec.md §3 "Peer state", §8 "after quiescence the entry retained... is
	/// the one with the greatest timestamp").
	pub fn merge(&self, incoming: NflogEntry) {
		let mut inner = self.inner.write().unwrap();
		let should_install = match inner.entries.get(&incoming.key) {
			Some(existing) => incoming.timestamp > existing.timestamp,
			None => true,
		};
		if should_install {
			inner.entries.insert(incoming.key.clone(), incoming);
		}
	}

	/// Removes entries whose `expires_at < now` (spec.md §4.6 "GC()").
	pub fn gc(&self) -> usize {
		let now = self.clock.now();
		let mut inner = self.inner.write().unwrap();
		let before = inner.entries.len();
		inner.entries.retain(|_, e| e.expires_at >= now);
		before - inner.entries.len()
	}

	pub fn marshal_full(&self) -> Vec<NflogEntry> {
		self.inner.read().unwrap().entries.values().cloned().collect()
	}

	pub fn snapshot_save(&self, path: &Path) -> Result<(), NflogError> {
		let entries = self.marshal_full();
		let mut buf = Vec::new();
		for entry in &entries {
			let encoded = serde_json::to_vec(entry).map_err(|e| NflogError::SnapshotDecode(e.to_string()))?;
			buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
			buf.extend_from_slice(&encoded);
		}
		let dir = path.parent().unwrap_or_else(|| Path::new("."));
		let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(NflogError::SnapshotWrite)?;
		tmp.write_all(&buf).map_err(NflogError::SnapshotWrite)?;
		tmp.persist(path).map_err(|e| NflogError::SnapshotWrite(e.error))?;
		Ok(())
	}

	pub fn snapshot_load(&self, path: &Path) -> Result<usize, NflogError> {
		let mut file = match std::fs::File::open(path) {
			Ok(f) => f,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(NflogError::SnapshotRead(e)),
		};
		let mut buf = Vec::new();
		file.read_to_end(&mut buf).map_err(NflogError::SnapshotRead)?;

		let mut cursor = 0usize;
		let mut loaded = 0usize;
		while cursor + 4 <= buf.len() {
			let len = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
			cursor += 4;
			if cursor + len > buf.len() {
				warn!("notification log snapshot truncated, stopping load early");
				break;
			}
			match serde_json::from_slice::<NflogEntry>(&buf[cursor..cursor + len]) {
				Ok(entry) => {
					self.merge(entry);
					loaded += 1;
				}
				Err(e) => warn!(error = %e, "dropping corrupt notification log snapshot entry"),
			}
			cursor += len;
		}
		info!(loaded, %path.display(), "loaded notification log snapshot");
		Ok(loaded)
	}
}

pub fn default_snapshot_path(data_dir: &Path) -> std::path::PathBuf {
	data_dir.join("nflog.snapshot")
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::clock::FakeClock;
	use crate::types::LabelSet;

	fn key() -> NflogKey {
		NflogKey {
			group_key: GroupKey::new("route-1", vec![("alertname".into(), "Foo".into())]),
			receiver: "webhook".into(),
		}
	}

	fn fp(label: &str) -> Fingerprint {
		LabelSet::from_pairs([("alertname", label)]).fingerprint()
	}

	fn log() -> (NotificationLog, FakeClock) {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		(NotificationLog::new(Arc::new(clock.clone()), jiff::Span::new().hours(5)), clock)
	}

	#[test]
	fn query_after_log_returns_same_entry() {
		let (nflog, _clock) = log();
		nflog.log(key(), [fp("Foo")].into_iter().collect(), HashSet::new());
		let entry = nflog.query(&key()).unwrap();
		assert!(entry.firing.contains(&fp("Foo")));
	}

	#[test]
	fn merge_keeps_greatest_timestamp() {
		let (nflog, clock) = log();
		nflog.log(key(), [fp("Foo")].into_iter().collect(), HashSet::new());
		let mut later = nflog.query(&key()).unwrap();
		later.timestamp = later.timestamp.checked_add(jiff::Span::new().seconds(1)).unwrap();
		later.resolved = [fp("Foo")].into_iter().collect();
		nflog.merge(later.clone());
		let stored = nflog.query(&key()).unwrap();
		assert_eq!(stored.timestamp, later.timestamp);
		assert!(stored.resolved.contains(&fp("Foo")));
		let _ = clock;
	}

	#[test]
	fn merge_ignores_older_timestamp() {
		let (nflog, _clock) = log();
		nflog.log(key(), [fp("Foo")].into_iter().collect(), HashSet::new());
		let current = nflog.query(&key()).unwrap();
		let mut stale = current.clone();
		stale.timestamp = stale.timestamp.checked_sub(jiff::Span::new().seconds(1)).unwrap();
		stale.resolved = [fp("Foo")].into_iter().collect();
		nflog.merge(stale);
		let stored = nflog.query(&key()).unwrap();
		assert!(stored.resolved.is_empty());
	}

	#[test]
	fn gc_removes_expired_entries() {
		let (nflog, clock) = log();
		nflog.log(key(), HashSet::new(), HashSet::new());
		assert_eq!(nflog.gc(), 0);
		clock.advance(jiff::Span::new().hours(6));
		assert_eq!(nflog.gc(), 1);
	}

	#[test]
	fn snapshot_round_trips() {
		let (nflog, _clock) = log();
		nflog.log(key(), [fp("Foo")].into_iter().collect(), HashSet::new());
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nflog.snapshot");
		nflog.snapshot_save(&path).unwrap();

		let (loaded, _clock2) = log();
		let count = loaded.snapshot_load(&path).unwrap();
		assert_eq!(count, 1);
		assert!(loaded.query(&key()).is_some());
	}
}
