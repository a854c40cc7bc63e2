//! Inhibition rule evaluation (spec.md §4.5).

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{
	matcher::{Matcher, MatcherList},
	provider::AlertProvider,
	types::{Fingerprint, LabelSet},
};

/// Uncompiled inhibition rule configuration
/// (SPEC_FULL.md §2.3 "InhibitRuleConfig list").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InhibitRuleConfig {
	pub source_matchers: Vec<Matcher>,
	pub target_matchers: Vec<Matcher>,
	pub equal: Vec<String>,
}

struct CompiledRule {
	source_matchers: MatcherList,
	target_matchers: MatcherList,
	equal: Vec<String>,
}

struct FiringSource {
	fingerprint: Fingerprint,
	labels: LabelSet,
}

struct Inner {
	/// Per-rule cache of currently-firing source alerts
	/// (spec.md §4.5 "Maintains per-rule indexes of currently firing source alerts").
	firing_sources: Vec<Vec<FiringSource>>,
}

/// Evaluates inhibition rules against the alert provider
/// (spec.md §2 "Inhibitor").
pub struct Inhibitor {
	rules: Vec<CompiledRule>,
	inner: RwLock<Inner>,
}

impl Inhibitor {
	pub fn compile(rules: Vec<InhibitRuleConfig>) -> Result<Self, regex::Error> {
		let mut compiled = Vec::with_capacity(rules.len());
		for rule in rules {
			compiled.push(CompiledRule {
				source_matchers: MatcherList::compile(rule.source_matchers)?,
				target_matchers: MatcherList::compile(rule.target_matchers)?,
				equal: rule.equal,
			});
		}
		let n = compiled.len();
		Ok(Self {
			rules: compiled,
			inner: RwLock::new(Inner {
				firing_sources: (0..n).map(|_| Vec::new()).collect(),
			}),
		})
	}

	/// Rebuilds the per-rule firing-source cache from the alert provider's
	/// current state (spec.md §4.5 "Operation": "Subscribes to the alert
	/// provider; on each update reindexes the firing-source cache").
	pub fn reindex(&self, provider: &AlertProvider) {
		let now_alerts = provider.all();
		let mut firing_sources: Vec<Vec<FiringSource>> = self.rules.iter().map(|_| Vec::new()).collect();
		for alert in &now_alerts {
			for (idx, rule) in self.rules.iter().enumerate() {
				if rule.source_matchers.matches(&alert.labels) {
					firing_sources[idx].push(FiringSource {
						fingerprint: alert.fingerprint(),
						labels: alert.labels.clone(),
					});
				}
			}
		}
		self.inner.write().unwrap().firing_sources = firing_sources;
	}

	/// True iff `target` is muted by a currently-firing source alert
	/// (spec.md §4.5 "Contract"). O(rules × sources-per-rule) per call; the
	/// fingerprint of the muting source is returned for marker bookkeeping.
	pub fn mutes(&self, target: &LabelSet) -> Option<Fingerprint> {
		let inner = self.inner.read().unwrap();
		for (idx, rule) in self.rules.iter().enumerate() {
			if !rule.target_matchers.matches(target) {
				continue;
			}
			for source in &inner.firing_sources[idx] {
				if rule
					.equal
					.iter()
					.all(|name| source.labels.get(name) == target.get(name))
				{
					return Some(source.fingerprint);
				}
			}
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::clock::FakeClock;
	use crate::types::Annotations;

	fn provider_with(alerts: &[(&str, &str, &str)]) -> AlertProvider {
		let clock = FakeClock::at("2026-01-01T00:00:00Z".parse().unwrap());
		let provider = AlertProvider::new(Arc::new(clock), jiff::Span::new().minutes(5));
		for (alertname, job, zone) in alerts {
			provider
				.put(
					LabelSet::from_pairs([("alertname", *alertname), ("job", *job), ("zone", *zone)]),
					Annotations::new(),
					None,
					None,
					None,
				)
				.unwrap();
		}
		provider
	}

	fn rule() -> InhibitRuleConfig {
		InhibitRuleConfig {
			source_matchers: vec![Matcher::equal("alertname", "JobDown")],
			target_matchers: vec![Matcher::equal("alertname", "InstanceDown")],
			equal: vec!["job".into(), "zone".into()],
		}
	}

	#[test]
	fn target_not_muted_without_firing_source() {
		let inhibitor = Inhibitor::compile(vec![rule()]).unwrap();
		let provider = provider_with(&[("InstanceDown", "j", "aa")]);
		inhibitor.reindex(&provider);
		let target = LabelSet::from_pairs([("alertname", "InstanceDown"), ("job", "j"), ("zone", "aa")]);
		assert!(inhibitor.mutes(&target).is_none());
	}

	#[test]
	fn target_muted_when_source_fires_with_matching_equal_labels() {
		let inhibitor = Inhibitor::compile(vec![rule()]).unwrap();
		let provider = provider_with(&[("JobDown", "j", "aa"), ("InstanceDown", "j", "aa")]);
		inhibitor.reindex(&provider);
		let target = LabelSet::from_pairs([("alertname", "InstanceDown"), ("job", "j"), ("zone", "aa")]);
		assert!(inhibitor.mutes(&target).is_some());
	}

	#[test]
	fn target_not_muted_when_equal_labels_differ() {
		let inhibitor = Inhibitor::compile(vec![rule()]).unwrap();
		let provider = provider_with(&[("JobDown", "j", "aa"), ("InstanceDown", "j", "ab")]);
		inhibitor.reindex(&provider);
		let target = LabelSet::from_pairs([("alertname", "InstanceDown"), ("job", "j"), ("zone", "ab")]);
		assert!(inhibitor.mutes(&target).is_none());
	}
}
