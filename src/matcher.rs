//! Label matchers and matcher lists (spec.md §3 Silence, §4.1 Route Tree, §9 Open Question).
//!
//! The core never parses matcher *text* — that lexer/parser is out of scope
//! (spec.md §1). This module only models the already-parsed `MatchOp`/`Matcher`
//! structures and their evaluation against a [`LabelSet`].

use std::sync::Mutex;

use lru_time_cache::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::LabelSet;

/// Kind of comparison a [`Matcher`] performs (spec.md §3 "type ∈ {equal, not-equal, regex, not-regex}").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
	Equal,
	NotEqual,
	Regex,
	NotRegex,
}

impl MatchOp {
	fn is_negative(self) -> bool {
		matches!(self, MatchOp::NotEqual | MatchOp::NotRegex)
	}
}

/// A single label predicate: `name <op> pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matcher {
	pub name: String,
	pub pattern: String,
	pub op: MatchOp,
}

impl Matcher {
	pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			pattern: value.into(),
			op: MatchOp::Equal,
		}
	}

	pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			pattern: value.into(),
			op: MatchOp::NotEqual,
		}
	}

	pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			pattern: pattern.into(),
			op: MatchOp::Regex,
		}
	}

	pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			pattern: pattern.into(),
			op: MatchOp::NotRegex,
		}
	}

	/// True when this matcher, evaluated alone, would match the empty string value
	/// (spec.md §8 boundary behavior: "every matcher matches the empty string").
	pub fn matches_empty_string(&self) -> bool {
		match self.op {
			MatchOp::Equal => self.pattern.is_empty(),
			MatchOp::NotEqual => !self.pattern.is_empty(),
			MatchOp::Regex => Regex::new(&anchored(&self.pattern))
				.map(|re| re.is_match(""))
				.unwrap_or(false),
			MatchOp::NotRegex => Regex::new(&anchored(&self.pattern))
				.map(|re| !re.is_match(""))
				.unwrap_or(true),
		}
	}
}

fn anchored(pattern: &str) -> String {
	// Whole-string anchored match, matching `{label=~"pattern"}`'s conventional
	// meaning (spec.md §9 Open Question resolution).
	format!("^(?:{pattern})$")
}

/// A compiled, cached matcher: wraps [`Matcher`] with a pre-built `Regex` for the
/// regex/not-regex ops and a small result cache, after
/// `fast_regex_matcher.rs`'s cache-and-compare shape.
const MATCH_CACHE_SIZE: usize = 256;
const MATCH_CACHE_EXPIRY: std::time::Duration = std::time::Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct CompiledMatcher {
	matcher: Matcher,
	regex: Option<Regex>,
	cache: Mutex<LruCache<String, bool>>,
}

impl CompiledMatcher {
	pub fn compile(matcher: Matcher) -> Result<Self, regex::Error> {
		let regex = match matcher.op {
			MatchOp::Regex | MatchOp::NotRegex => Some(Regex::new(&anchored(&matcher.pattern))?),
			MatchOp::Equal | MatchOp::NotEqual => None,
		};
		Ok(Self {
			matcher,
			regex,
			cache: Mutex::new(LruCache::with_expiry_duration_and_capacity(
				MATCH_CACHE_EXPIRY,
				MATCH_CACHE_SIZE,
			)),
		})
	}

	pub fn name(&self) -> &str {
		&self.matcher.name
	}

	/// Evaluates this matcher against a single label value (absent labels are
	/// treated as an empty-string value, matching the spec's label-set semantics).
	pub fn matches_value(&self, value: &str) -> bool {
		match self.matcher.op {
			MatchOp::Equal => value == self.matcher.pattern,
			MatchOp::NotEqual => value != self.matcher.pattern,
			MatchOp::Regex | MatchOp::NotRegex => {
				let is_match = {
					let mut cache = self.cache.lock().unwrap();
					if let Some(&hit) = cache.get(value) {
						hit
					} else {
						let hit = self.regex.as_ref().unwrap().is_match(value);
						cache.put(value.to_string(), hit);
						hit
					}
				};
				if self.matcher.op.is_negative() {
					!is_match
				} else {
					is_match
				}
			}
		}
	}

	pub fn matches(&self, labels: &LabelSet) -> bool {
		self.matches_value(labels.get(&self.matcher.name).unwrap_or(""))
	}
}

/// An ordered, compiled matcher list. Matches iff every matcher matches
/// (spec.md §4.1 "a label-matcher list is evaluated... the node matches if
/// every matcher matches"; §4.4 "Mutes": "all match").
#[derive(Debug)]
pub struct MatcherList(Vec<CompiledMatcher>);

impl MatcherList {
	pub fn compile(matchers: Vec<Matcher>) -> Result<Self, regex::Error> {
		matchers
			.into_iter()
			.map(CompiledMatcher::compile)
			.collect::<Result<Vec<_>, _>>()
			.map(Self)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn matches(&self, labels: &LabelSet) -> bool {
		self.0.iter().all(|m| m.matches(labels))
	}

	/// True iff this matcher list would match the empty label set
	/// (spec.md §3/§8 boundary: a silence where "every matcher matches the empty
	/// string" is rejected — this checks whether *all* matchers would,
	/// collectively, match no labels at all).
	pub fn matches_empty_label_set(&self) -> bool {
		!self.0.is_empty() && self.0.iter().all(|m| m.matches_value(""))
	}

	/// Names of the labels referenced, used by the inhibitor's "equal" list check
	/// and by group-by-label resolution.
	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(CompiledMatcher::name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn equal_matcher_matches_exact_value() {
		let m = CompiledMatcher::compile(Matcher::equal("alertname", "Foo")).unwrap();
		let labels = LabelSet::from_pairs([("alertname", "Foo")]);
		assert!(m.matches(&labels));
		let labels = LabelSet::from_pairs([("alertname", "Bar")]);
		assert!(!m.matches(&labels));
	}

	#[test]
	fn not_equal_matcher_matches_missing_label() {
		let m = CompiledMatcher::compile(Matcher::not_equal("job", "x")).unwrap();
		let labels = LabelSet::new();
		assert!(m.matches(&labels));
	}

	#[test]
	fn regex_matcher_is_anchored() {
		let m = CompiledMatcher::compile(Matcher::regex("job", "foo.*")).unwrap();
		assert!(m.matches_value("foobar"));
		assert!(!m.matches_value("xfoobar"));
	}

	#[test]
	fn not_regex_inverts_result() {
		let m = CompiledMatcher::compile(Matcher::not_regex("job", "foo.*")).unwrap();
		assert!(!m.matches_value("foobar"));
		assert!(m.matches_value("bar"));
	}

	#[test]
	fn matcher_list_requires_all_to_match() {
		let list = MatcherList::compile(vec![
			Matcher::equal("alertname", "Foo"),
			Matcher::equal("job", "bar"),
		])
		.unwrap();
		assert!(list.matches(&LabelSet::from_pairs([("alertname", "Foo"), ("job", "bar")])));
		assert!(!list.matches(&LabelSet::from_pairs([("alertname", "Foo")])));
	}

	#[test]
	fn empty_matcher_list_is_not_matches_empty_label_set() {
		let list = MatcherList::compile(vec![]).unwrap();
		assert!(!list.matches_empty_label_set());
	}

	#[test]
	fn matcher_list_matching_empty_label_set_is_detected() {
		let list = MatcherList::compile(vec![Matcher::not_equal("job", "x")]).unwrap();
		assert!(list.matches_empty_label_set());
	}

	#[test]
	fn matcher_list_with_one_required_value_does_not_match_empty() {
		let list = MatcherList::compile(vec![
			Matcher::equal("alertname", "Foo"),
			Matcher::not_equal("job", "x"),
		])
		.unwrap();
		assert!(!list.matches_empty_label_set());
	}
}
