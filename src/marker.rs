//! Per-fingerprint state cache (spec.md §3 "Marker").

use std::{
	collections::{HashMap, HashSet},
	sync::RwLock,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Fingerprint;

/// The externally-visible state of an alert's fingerprint, a pure function of
/// whether it is silenced or inhibited (spec.md §3 Marker, §8 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerState {
	#[default]
	Unprocessed,
	Active,
	Suppressed,
}

/// Per-fingerprint cache written by the Silencer, Inhibitor and Pipeline, read
/// by the alert list API (spec.md §3 "Marker").
#[derive(Debug, Clone, Default)]
pub struct Marker {
	pub active_silence_ids: HashSet<Uuid>,
	pub pending_silence_ids: HashSet<Uuid>,
	pub silence_version_observed: u64,
	pub inhibited_by: Vec<Fingerprint>,
	pub state: MarkerState,
}

impl Marker {
	/// Recomputes `state` from the current silence/inhibition sets. Called by
	/// the Silencer and Inhibitor after they update the respective sets.
	pub fn recompute_state(&mut self) {
		self.state = if !self.active_silence_ids.is_empty() || !self.inhibited_by.is_empty() {
			MarkerState::Suppressed
		} else {
			MarkerState::Active
		};
	}

	pub fn set_silenced_by(&mut self, ids: HashSet<Uuid>) {
		self.active_silence_ids = ids;
		self.recompute_state();
	}

	pub fn set_inhibited_by(&mut self, fps: Vec<Fingerprint>) {
		self.inhibited_by = fps;
		self.recompute_state();
	}
}

/// Map of fingerprint to [`Marker`], guarded by a single read-write mutex
/// (spec.md §5 "Shared-resource policy" — read-mostly, short critical
/// sections, same discipline as the alert provider's fingerprint map).
#[derive(Debug, Default)]
pub struct MarkerStore {
	markers: RwLock<HashMap<Fingerprint, Marker>>,
}

impl MarkerStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, fp: Fingerprint) -> Option<Marker> {
		self.markers.read().unwrap().get(&fp).cloned()
	}

	pub fn state_of(&self, fp: Fingerprint) -> MarkerState {
		self.markers
			.read()
			.unwrap()
			.get(&fp)
			.map(|m| m.state)
			.unwrap_or(MarkerState::Unprocessed)
	}

	pub fn with_mut<R>(&self, fp: Fingerprint, f: impl FnOnce(&mut Marker) -> R) -> R {
		let mut markers = self.markers.write().unwrap();
		let marker = markers.entry(fp).or_default();
		f(marker)
	}

	/// Drops markers for fingerprints no longer tracked by the alert provider,
	/// called from the same maintenance tick that garbage-collects alerts.
	pub fn retain(&self, live: &HashSet<Fingerprint>) {
		self.markers.write().unwrap().retain(|fp, _| live.contains(fp));
	}

	pub fn len(&self) -> usize {
		self.markers.read().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fp(n: u64) -> Fingerprint {
		crate::types::LabelSet::from_pairs([("n", n.to_string())]).fingerprint()
	}

	#[test]
	fn unprocessed_by_default() {
		let store = MarkerStore::new();
		assert_eq!(store.state_of(fp(1)), MarkerState::Unprocessed);
	}

	#[test]
	fn silencing_marks_suppressed() {
		let store = MarkerStore::new();
		let id = Uuid::new_v4();
		store.with_mut(fp(1), |m| m.set_silenced_by([id].into_iter().collect()));
		assert_eq!(store.state_of(fp(1)), MarkerState::Suppressed);
	}

	#[test]
	fn clearing_silence_and_inhibition_reverts_to_active() {
		let store = MarkerStore::new();
		let id = Uuid::new_v4();
		store.with_mut(fp(1), |m| m.set_silenced_by([id].into_iter().collect()));
		store.with_mut(fp(1), |m| m.set_silenced_by(HashSet::new()));
		assert_eq!(store.state_of(fp(1)), MarkerState::Active);
	}

	#[test]
	fn retain_drops_markers_for_dead_fingerprints() {
		let store = MarkerStore::new();
		store.with_mut(fp(1), |m| m.set_silenced_by(HashSet::new()));
		store.with_mut(fp(2), |m| m.set_silenced_by(HashSet::new()));
		store.retain(&[fp(1)].into_iter().collect());
		assert_eq!(store.len(), 1);
	}
}
