//! Gossiped, indexed store of silence records (spec.md §4.4).

use std::{
	collections::HashMap,
	io::{Read, Write},
	path::{Path, PathBuf},
	sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
	clock::SharedClock,
	error::SilenceError,
	matcher::{Matcher, MatcherList},
	types::LabelSet,
};

/// Logical state of a silence, a pure function of (start, end, now)
/// (spec.md §3 "Logical state").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SilenceState {
	Pending,
	Active,
	Expired,
}

/// A silence record (spec.md §3 "Silence").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Silence {
	pub id: Uuid,
	pub matchers: Vec<Matcher>,
	pub starts_at: jiff::Timestamp,
	pub ends_at: jiff::Timestamp,
	pub updated_at: jiff::Timestamp,
	pub creator: String,
	pub comment: String,
}

impl Silence {
	pub fn state(&self, now: jiff::Timestamp) -> SilenceState {
		if now < self.starts_at {
			SilenceState::Pending
		} else if now <= self.ends_at {
			SilenceState::Active
		} else {
			SilenceState::Expired
		}
	}

	fn validate(matchers: &MatcherList, starts_at: jiff::Timestamp, ends_at: jiff::Timestamp) -> Result<(), SilenceError> {
		if matchers.is_empty() {
			return Err(SilenceError::NoMatchers);
		}
		if matchers.matches_empty_label_set() {
			return Err(SilenceError::MatchesEmptyLabelSet);
		}
		if ends_at < starts_at {
			return Err(SilenceError::EndBeforeStart);
		}
		Ok(())
	}
}

/// On-disk/on-wire envelope: the silence plus its mesh expiry
/// (spec.md §3 "the record's Mesh-envelope expires-at = end-time + retention";
/// §4.4 "Snapshot format").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSilence {
	pub silence: Silence,
	pub expires_at: jiff::Timestamp,
}

struct IndexedSilence {
	silence: Silence,
	expires_at: jiff::Timestamp,
	matchers: MatcherList,
	install_version: u64,
}

struct Inner {
	by_id: HashMap<Uuid, IndexedSilence>,
	/// (version, id) ordered by insertion; binary-searchable by version
	/// (spec.md §4.4 "Version index").
	version_index: Vec<(u64, Uuid)>,
	next_version: u64,
}

pub struct SilenceLimits {
	pub max_count: usize,
	pub max_encoded_size: usize,
}

impl Default for SilenceLimits {
	fn default() -> Self {
		Self {
			max_count: 1 << 16,
			max_encoded_size: 64 * 1024,
		}
	}
}

pub struct Silences {
	inner: RwLock<Inner>,
	clock: SharedClock,
	retention: jiff::Span,
	limits: SilenceLimits,
}

impl Silences {
	pub fn new(clock: SharedClock, retention: jiff::Span, limits: SilenceLimits) -> Self {
		Self {
			inner: RwLock::new(Inner {
				by_id: HashMap::new(),
				version_index: Vec::new(),
				next_version: 1,
			}),
			clock,
			retention,
			limits,
		}
	}

	/// Installs a new silence, or, when `existing` names one already stored,
	/// either updates it in place or replaces it with a fresh id (spec.md §4.4
	/// "Set(silence) → id": "if replacing an existing silence whose matchers
	/// changed or whose active window shifted backwards, expire the old and
	/// create new"; otherwise the record is updated in place).
	pub fn set(
		&self,
		existing: Option<Uuid>,
		matchers: Vec<Matcher>,
		starts_at: jiff::Timestamp,
		ends_at: jiff::Timestamp,
		creator: String,
		comment: String,
	) -> Result<Uuid, SilenceError> {
		let compiled = MatcherList::compile(matchers.clone()).map_err(|_| SilenceError::NoMatchers)?;
		Silence::validate(&compiled, starts_at, ends_at)?;

		let encoded_size = estimate_encoded_size(&matchers, &comment);
		if encoded_size > self.limits.max_encoded_size {
			return Err(SilenceError::TooLarge {
				size: encoded_size,
				limit: self.limits.max_encoded_size,
			});
		}

		let now = self.clock.now();

		let Some(id) = existing else {
			let silence = Silence {
				id: Uuid::new_v4(),
				matchers,
				starts_at,
				ends_at,
				updated_at: now,
				creator,
				comment,
			};
			return self.install(silence, compiled);
		};

		let shifted_backward = {
			let inner = self.inner.read().unwrap();
			let current = &inner.by_id.get(&id).ok_or(SilenceError::NotFound(id))?.silence;
			current.matchers != matchers || starts_at < current.starts_at || ends_at < current.ends_at
		};

		if shifted_backward {
			self.expire(id)?;
			let silence = Silence {
				id: Uuid::new_v4(),
				matchers,
				starts_at,
				ends_at,
				updated_at: now,
				creator,
				comment,
			};
			return self.install(silence, compiled);
		}

		let mut inner = self.inner.write().unwrap();
		let entry = inner.by_id.get_mut(&id).ok_or(SilenceError::NotFound(id))?;
		entry.silence.matchers = matchers;
		entry.silence.starts_at = starts_at;
		entry.silence.ends_at = ends_at;
		entry.silence.updated_at = now;
		entry.silence.creator = creator;
		entry.silence.comment = comment;
		entry.matchers = compiled;
		entry.expires_at = ends_at.checked_add(self.retention).unwrap_or(ends_at);
		Ok(id)
	}

	fn install(&self, silence: Silence, matchers: MatcherList) -> Result<Uuid, SilenceError> {
		let mut inner = self.inner.write().unwrap();
		if inner.by_id.len() >= self.limits.max_count && !inner.by_id.contains_key(&silence.id) {
			return Err(SilenceError::TooManySilences {
				limit: self.limits.max_count,
			});
		}
		let id = silence.id;
		let version = inner.next_version;
		inner.next_version += 1;
		let expires_at = silence.ends_at.checked_add(self.retention).unwrap_or(silence.ends_at);
		inner.by_id.insert(
			id,
			IndexedSilence {
				silence,
				expires_at,
				matchers,
				install_version: version,
			},
		);
		inner.version_index.push((version, id));
		Ok(id)
	}

	/// Sets end-time (and start-time, if still pending) to now
	/// (spec.md §4.4 "Expire(id)"). Idempotent on an already-expired silence.
	pub fn expire(&self, id: Uuid) -> Result<(), SilenceError> {
		let now = self.clock.now();
		let mut inner = self.inner.write().unwrap();
		let entry = inner.by_id.get_mut(&id).ok_or(SilenceError::NotFound(id))?;
		if entry.silence.state(now) == SilenceState::Expired {
			return Ok(());
		}
		if entry.silence.state(now) == SilenceState::Pending {
			entry.silence.starts_at = now;
		}
		entry.silence.ends_at = now;
		entry.silence.updated_at = now;
		entry.expires_at = now.checked_add(self.retention).unwrap_or(now);
		Ok(())
	}

	/// Returns every installed silence whose matchers all match `labels`.
	pub fn query_matching(&self, labels: &LabelSet) -> Vec<Silence> {
		let inner = self.inner.read().unwrap();
		inner
			.by_id
			.values()
			.filter(|entry| entry.matchers.matches(labels))
			.map(|entry| entry.silence.clone())
			.collect()
	}

	pub fn query_by_state(&self, state: SilenceState) -> Vec<Silence> {
		let now = self.clock.now();
		let inner = self.inner.read().unwrap();
		inner
			.by_id
			.values()
			.filter(|entry| entry.silence.state(now) == state)
			.map(|entry| entry.silence.clone())
			.collect()
	}

	/// Resumes from the first entry whose install-version exceeds `since`, in
	/// install order (spec.md §4.4 "Query(since=V) uses binary search").
	pub fn query_since(&self, since: u64) -> Vec<Silence> {
		let inner = self.inner.read().unwrap();
		let idx = inner.version_index.partition_point(|(v, _)| *v <= since);
		inner.version_index[idx..]
			.iter()
			.filter_map(|(_, id)| inner.by_id.get(id).map(|e| e.silence.clone()))
			.collect()
	}

	pub fn current_version(&self) -> u64 {
		self.inner.read().unwrap().next_version.saturating_sub(1)
	}

	/// Used by the Silencer: true iff any active silence's matchers all match
	/// `labels` (spec.md §4.4 "Mutes(labelSet) → bool").
	pub fn mutes(&self, labels: &LabelSet) -> Option<Uuid> {
		let now = self.clock.now();
		let inner = self.inner.read().unwrap();
		inner.by_id.values().find_map(|entry| {
			(entry.silence.state(now) == SilenceState::Active && entry.matchers.matches(labels))
				.then_some(entry.silence.id)
		})
	}

	/// Purges records whose `expires_at < now` from every index
	/// (spec.md §4.4 "GC()").
	pub fn gc(&self) -> usize {
		let now = self.clock.now();
		let mut inner = self.inner.write().unwrap();
		let dead: Vec<Uuid> = inner
			.by_id
			.iter()
			.filter(|(_, e)| e.expires_at < now)
			.map(|(id, _)| *id)
			.collect();
		for id in &dead {
			inner.by_id.remove(id);
		}
		inner.version_index.retain(|(_, id)| inner.by_id.contains_key(id));
		dead.len()
	}

	/// CRDT merge: keep the record with the latest `updated_at` per id
	/// (spec.md §3 "Peer state", §8 "commutative and associative").
	pub fn merge(&self, incoming: MeshSilence) -> Result<(), SilenceError> {
		let compiled = MatcherList::compile(incoming.silence.matchers.clone())
			.map_err(|e| SilenceError::SnapshotDecode(e.to_string()))?;
		let mut inner = self.inner.write().unwrap();
		let should_install = match inner.by_id.get(&incoming.silence.id) {
			Some(existing) => incoming.silence.updated_at > existing.silence.updated_at,
			None => true,
		};
		if !should_install {
			return Ok(());
		}
		let id = incoming.silence.id;
		let version = inner.next_version;
		inner.next_version += 1;
		inner.by_id.insert(
			id,
			IndexedSilence {
				silence: incoming.silence,
				expires_at: incoming.expires_at,
				matchers: compiled,
				install_version: version,
			},
		);
		inner.version_index.push((version, id));
		Ok(())
	}

	/// Full-state marshal for anti-entropy (spec.md §4.7 "serialize-full").
	pub fn marshal_full(&self) -> Vec<MeshSilence> {
		let inner = self.inner.read().unwrap();
		inner
			.by_id
			.values()
			.map(|e| MeshSilence {
				silence: e.silence.clone(),
				expires_at: e.expires_at,
			})
			.collect()
	}

	/// Writes the length-prefixed snapshot atomically via a sibling temp file
	/// and rename (spec.md §6 "Snapshot files"), after the daemon's
	/// load/write-through-tempfile discipline.
	pub fn snapshot_save(&self, path: &Path) -> Result<(), SilenceError> {
		let entries = self.marshal_full();
		let mut buf = Vec::new();
		for entry in &entries {
			let encoded = serde_json::to_vec(entry).map_err(|e| SilenceError::SnapshotDecode(e.to_string()))?;
			buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
			buf.extend_from_slice(&encoded);
		}
		let dir = path.parent().unwrap_or_else(|| Path::new("."));
		let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(SilenceError::SnapshotWrite)?;
		tmp.write_all(&buf).map_err(SilenceError::SnapshotWrite)?;
		tmp.persist(path).map_err(|e| SilenceError::SnapshotWrite(e.error))?;
		Ok(())
	}

	/// Loads a snapshot, tolerating absence and corruption
	/// (spec.md §6 "Loading tolerates absence and corruption").
	pub fn snapshot_load(&self, path: &Path) -> Result<usize, SilenceError> {
		let mut file = match std::fs::File::open(path) {
			Ok(f) => f,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(SilenceError::SnapshotRead(e)),
		};
		let mut buf = Vec::new();
		file.read_to_end(&mut buf).map_err(SilenceError::SnapshotRead)?;

		let mut cursor = 0usize;
		let mut loaded = 0usize;
		while cursor + 4 <= buf.len() {
			let len = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
			cursor += 4;
			if cursor + len > buf.len() {
				warn!("silence snapshot truncated, stopping load early");
				break;
			}
			match serde_json::from_slice::<MeshSilence>(&buf[cursor..cursor + len]) {
				Ok(entry) => {
					if self.merge(entry).is_ok() {
						loaded += 1;
					}
				}
				Err(e) => warn!(error = %e, "dropping corrupt silence snapshot entry"),
			}
			cursor += len;
		}
		info!(loaded, %path.display(), "loaded silence snapshot");
		Ok(loaded)
	}
}

fn estimate_encoded_size(matchers: &[Matcher], comment: &str) -> usize {
	matchers.iter().map(|m| m.name.len() + m.pattern.len()).sum::<usize>() + comment.len()
}

pub fn default_snapshot_path(data_dir: &Path) -> PathBuf {
	data_dir.join("silences.snapshot")
}
