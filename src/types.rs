//! Core data model: alerts, label sets and their fingerprints (spec.md §3).

use std::{
	collections::BTreeMap,
	fmt,
	hash::{Hash, Hasher},
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// A label set, stored sorted by key so that two sets built in different orders
/// compare and hash identically. Order-irrelevance is an invariant from spec.md §3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_pairs<I, K, V>(pairs: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.get(name).map(String::as_str)
	}

	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.insert(name.into(), value.into());
	}

	pub fn contains_key(&self, name: &str) -> bool {
		self.0.contains_key(name)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// True iff every label in `other` is present with the same value in `self`.
	pub fn is_superset_of(&self, other: &LabelSet) -> bool {
		other.iter().all(|(k, v)| self.get(k) == Some(v))
	}

	pub fn fingerprint(&self) -> Fingerprint {
		// FNV-1a over sorted (name, value) pairs, each pair separated by a byte
		// that cannot appear in a label name, so {a:"b,c"} and {a:"b", c:""}
		// never collide. A pure function of the label set (spec.md §3 invariant).
		const OFFSET: u64 = 0xcbf29ce484222325;
		const PRIME: u64 = 0x100000001b3;
		let mut hash = OFFSET;
		let mut feed = |bytes: &[u8]| {
			for &b in bytes {
				hash ^= b as u64;
				hash = hash.wrapping_mul(PRIME);
			}
		};
		for (k, v) in self.iter() {
			feed(k.as_bytes());
			feed(&[0u8]);
			feed(v.as_bytes());
			feed(&[1u8]);
		}
		Fingerprint(hash)
	}
}

impl FromIterator<(String, String)> for LabelSet {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl fmt::Display for LabelSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{")?;
		for (idx, (k, v)) in self.0.iter().enumerate() {
			if idx > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{k}={v:?}")?;
		}
		write!(f, "}}")
	}
}

/// Stable identity of an alert, derived purely from its label set (spec.md §3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// Free-form annotation map (spec.md §3); unlike labels, not part of identity.
pub type Annotations = BTreeMap<String, String>;

/// An alert as ingested from an external monitoring producer (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
	pub labels: LabelSet,
	pub annotations: Annotations,
	pub starts_at: Timestamp,
	pub ends_at: Timestamp,
	pub updated_at: Timestamp,
	/// True when `ends_at` is a sliding horizon advanced by the producer rather than
	/// an explicit resolution time (spec.md §3 "no explicit end-time").
	pub timeout: bool,
	pub generator_url: Option<String>,
}

impl Alert {
	/// Builds an alert from an ingest request, applying spec.md §6's defaulting rules.
	pub fn ingest(
		labels: LabelSet,
		annotations: Annotations,
		starts_at: Option<Timestamp>,
		ends_at: Option<Timestamp>,
		generator_url: Option<String>,
		now: Timestamp,
		resolve_timeout: jiff::Span,
	) -> Result<Self, IngestError> {
		if labels.is_empty() {
			return Err(IngestError::EmptyLabelSet);
		}
		let starts_at = starts_at.unwrap_or(now);
		let (ends_at, timeout) = match ends_at {
			Some(e) => (e, false),
			None => (
				starts_at
					.checked_add(resolve_timeout)
					.unwrap_or(starts_at),
				true,
			),
		};
		if ends_at < starts_at {
			return Err(IngestError::EndBeforeStart { starts_at, ends_at });
		}
		Ok(Self {
			labels,
			annotations,
			starts_at,
			ends_at,
			updated_at: now,
			timeout,
			generator_url,
		})
	}

	pub fn fingerprint(&self) -> Fingerprint {
		self.labels.fingerprint()
	}

	/// Resolved iff its end time has passed (spec.md §3 Lifecycle).
	pub fn resolved_at(&self, now: Timestamp) -> bool {
		self.ends_at <= now
	}

	/// spec.md §3 "Merge rule": start is the earliest, end is the later of overlapping
	/// windows (else the incoming alert's), annotations come from whichever side is
	/// newer.
	pub fn merge(&self, incoming: &Alert) -> Alert {
		let starts_at = self.starts_at.min(incoming.starts_at);
		let overlaps = incoming.starts_at <= self.ends_at;
		let ends_at = if overlaps {
			self.ends_at.max(incoming.ends_at)
		} else {
			incoming.ends_at
		};
		let newer = if incoming.updated_at >= self.updated_at {
			incoming
		} else {
			self
		};
		Alert {
			labels: self.labels.clone(),
			annotations: newer.annotations.clone(),
			starts_at,
			ends_at,
			updated_at: incoming.updated_at.max(self.updated_at),
			timeout: incoming.timeout,
			generator_url: incoming.generator_url.clone().or_else(|| self.generator_url.clone()),
		}
	}

	/// Garbage-collectible once resolved for longer than the maintenance window
	/// (spec.md §3 Lifecycle).
	pub fn expired(&self, now: Timestamp, resolve_timeout: jiff::Span) -> bool {
		self.resolved_at(now)
			&& self
				.ends_at
				.checked_add(resolve_timeout)
				.map(|deadline| deadline < now)
				.unwrap_or(false)
	}
}

/// Canonical, restart-stable string form of an aggregation group key
/// (spec.md §4.1 "Group key"). Hashing is used only for map bucketing;
/// equality and the canonical string are what matter for stability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
	pub route_id: String,
	pub values: Vec<(String, String)>,
}

impl GroupKey {
	pub fn new(route_id: impl Into<String>, values: Vec<(String, String)>) -> Self {
		Self {
			route_id: route_id.into(),
			values,
		}
	}
}

impl fmt::Display for GroupKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.route_id)?;
		for (k, v) in &self.values {
			write!(f, "/{k}={v}")?;
		}
		Ok(())
	}
}

impl Hash for GroupKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.to_string().hash(state);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprint_is_order_independent() {
		let a = LabelSet::from_pairs([("alertname", "Foo"), ("job", "bar")]);
		let b = LabelSet::from_pairs([("job", "bar"), ("alertname", "Foo")]);
		assert_eq!(a.fingerprint(), b.fingerprint());
	}

	#[test]
	fn fingerprint_distinguishes_value_boundaries() {
		let a = LabelSet::from_pairs([("a", "b,c")]);
		let b = LabelSet::from_pairs([("a", "b"), ("c", "")]);
		assert_ne!(a.fingerprint(), b.fingerprint());
	}

	#[test]
	fn ingest_rejects_ends_before_starts() {
		let now = "2026-01-01T00:00:00Z".parse().unwrap();
		let starts = "2026-01-01T00:10:00Z".parse().unwrap();
		let ends = "2026-01-01T00:00:00Z".parse().unwrap();
		let err = Alert::ingest(
			LabelSet::from_pairs([("a", "b")]),
			Annotations::new(),
			Some(starts),
			Some(ends),
			None,
			now,
			jiff::Span::new().minutes(5),
		)
		.unwrap_err();
		assert!(matches!(err, IngestError::EndBeforeStart { .. }));
	}

	#[test]
	fn ingest_defaults_ends_at_from_resolve_timeout() {
		let now: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
		let alert = Alert::ingest(
			LabelSet::from_pairs([("a", "b")]),
			Annotations::new(),
			None,
			None,
			None,
			now,
			jiff::Span::new().minutes(5),
		)
		.unwrap();
		assert_eq!(alert.starts_at, now);
		assert!(alert.timeout);
		assert_eq!(alert.ends_at, now.checked_add(jiff::Span::new().minutes(5)).unwrap());
	}

	#[test]
	fn merge_keeps_earliest_start_and_newer_annotations() {
		let t0: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
		let t1 = t0.checked_add(jiff::Span::new().minutes(1)).unwrap();
		let t2 = t0.checked_add(jiff::Span::new().minutes(2)).unwrap();
		let labels = LabelSet::from_pairs([("a", "b")]);

		let mut old_annotations = Annotations::new();
		old_annotations.insert("summary".into(), "old".into());
		let old = Alert {
			labels: labels.clone(),
			annotations: old_annotations,
			starts_at: t1,
			ends_at: t2,
			updated_at: t1,
			timeout: true,
			generator_url: None,
		};

		let mut new_annotations = Annotations::new();
		new_annotations.insert("summary".into(), "new".into());
		let incoming = Alert {
			labels,
			annotations: new_annotations,
			starts_at: t0,
			ends_at: t2,
			updated_at: t2,
			timeout: true,
			generator_url: None,
		};

		let merged = old.merge(&incoming);
		assert_eq!(merged.starts_at, t0);
		assert_eq!(merged.annotations.get("summary").unwrap(), "new");
	}

	#[test]
	fn merge_does_not_extend_past_a_gap() {
		let t0: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
		let t1 = t0.checked_add(jiff::Span::new().minutes(1)).unwrap();
		let t5 = t0.checked_add(jiff::Span::new().minutes(5)).unwrap();
		let t6 = t0.checked_add(jiff::Span::new().minutes(6)).unwrap();
		let labels = LabelSet::from_pairs([("a", "b")]);

		let old = Alert {
			labels: labels.clone(),
			annotations: Annotations::new(),
			starts_at: t0,
			ends_at: t1,
			updated_at: t1,
			timeout: false,
			generator_url: None,
		};
		// incoming starts after old ended: no overlap, end becomes incoming's end.
		let incoming = Alert {
			labels,
			annotations: Annotations::new(),
			starts_at: t5,
			ends_at: t6,
			updated_at: t6,
			timeout: false,
			generator_url: None,
		};

		let merged = old.merge(&incoming);
		assert_eq!(merged.ends_at, t6);
	}
}
