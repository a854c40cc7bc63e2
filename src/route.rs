//! Compiled hierarchical routing tree (spec.md §4.1).

use serde::{Deserialize, Serialize};

use crate::{
	matcher::{Matcher, MatcherList},
	types::{GroupKey, LabelSet},
};

/// How an aggregation group's key is derived for alerts matching a route leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupBy {
	Labels(Vec<String>),
	All,
}

/// Uncompiled, serde-facing configuration for one route node
/// (SPEC_FULL.md §2.3 "RouteConfig tree").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
	pub id: String,
	pub receiver: String,
	#[serde(default)]
	pub matchers: Vec<Matcher>,
	#[serde(default = "default_group_by")]
	pub group_by: GroupBy,
	pub group_wait: jiff::Span,
	pub group_interval: jiff::Span,
	pub repeat_interval: jiff::Span,
	#[serde(default)]
	pub continue_matching: bool,
	#[serde(default)]
	pub children: Vec<RouteConfig>,
}

fn default_group_by() -> GroupBy {
	GroupBy::Labels(Vec::new())
}

/// One compiled node in the route tree. The root node's `matchers` must be
/// empty (it always matches, spec.md §4.1 "The root must always match").
pub struct Route {
	pub id: String,
	pub receiver: String,
	matchers: MatcherList,
	pub group_by: GroupBy,
	pub group_wait: jiff::Span,
	pub group_interval: jiff::Span,
	pub repeat_interval: jiff::Span,
	pub continue_matching: bool,
	pub children: Vec<Route>,
}

impl Route {
	pub fn compile(config: RouteConfig) -> Result<Self, regex::Error> {
		Ok(Self {
			id: config.id,
			receiver: config.receiver,
			matchers: MatcherList::compile(config.matchers)?,
			group_by: config.group_by,
			group_wait: config.group_wait,
			group_interval: config.group_interval,
			repeat_interval: config.repeat_interval,
			continue_matching: config.continue_matching,
			children: config
				.children
				.into_iter()
				.map(Route::compile)
				.collect::<Result<_, _>>()?,
		})
	}

	fn matches(&self, labels: &LabelSet) -> bool {
		self.matchers.matches(labels)
	}

	/// Forms the group key for an alert routed to this leaf
	/// (spec.md §4.1 "Group key").
	pub fn group_key_for(&self, labels: &LabelSet) -> GroupKey {
		let values = match &self.group_by {
			GroupBy::All => labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
			GroupBy::Labels(names) => names
				.iter()
				.map(|name| (name.clone(), labels.get(name).unwrap_or("").to_string()))
				.collect(),
		};
		GroupKey::new(self.id.clone(), values)
	}

	/// Pre-order traversal matching an alert to every leaf route it resolves
	/// to (spec.md §4.1 "Algorithm").
	fn collect_matches<'a>(&'a self, labels: &LabelSet, out: &mut Vec<&'a Route>) {
		if !self.matches(labels) {
			return;
		}
		let mut any_child_matched = false;
		for child in &self.children {
			if child.matches(labels) {
				any_child_matched = true;
				child.collect_matches(labels, out);
				if !child.continue_matching {
					break;
				}
			}
		}
		if !any_child_matched {
			out.push(self);
		}
	}
}

/// The compiled route tree, rooted at a single node that must match every
/// alert unconditionally (spec.md §4.1).
pub struct RouteTree {
	root: Route,
}

impl RouteTree {
	pub fn compile(root: RouteConfig) -> Result<Self, regex::Error> {
		Ok(Self {
			root: Route::compile(root)?,
		})
	}

	/// Returns the ordered list of leaf routes matching `labels`
	/// (spec.md §4.1 "Output order is deterministic").
	pub fn route(&self, labels: &LabelSet) -> Vec<&Route> {
		let mut out = Vec::new();
		self.root.collect_matches(labels, &mut out);
		out
	}

	/// Looks up a compiled node by its route id, used by the dispatcher to
	/// recover a matched leaf's timing parameters from a stored `GroupKey`
	/// without holding a borrowed `&Route` across an await point.
	pub fn node_by_id(&self, id: &str) -> Option<&Route> {
		fn find<'a>(route: &'a Route, id: &str) -> Option<&'a Route> {
			if route.id == id {
				return Some(route);
			}
			route.children.iter().find_map(|child| find(child, id))
		}
		find(&self.root, id)
	}
}
