//! Dedup stage (spec.md §4.3 stage 7, "Repeat-interval semantics").

use std::collections::HashSet;

use jiff::Timestamp;

use crate::{nflog::NflogEntry, types::Fingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
	Send,
	Skip,
}

/// Decides whether this flush should reach the Retry stage.
///
/// A resend happens when (a) resolved alerts not previously reported need
/// reporting, (b) the firing set changed since the last send, or (c) the
/// repeat-interval has elapsed since the last send of the same firing set
/// (spec.md §4.3 "Repeat-interval semantics"). Otherwise the send is skipped.
pub fn decide(
	previous: Option<&NflogEntry>,
	firing: &HashSet<Fingerprint>,
	resolved: &HashSet<Fingerprint>,
	now: Timestamp,
	repeat_interval: jiff::Span,
) -> DedupDecision {
	let Some(previous) = previous else {
		return DedupDecision::Send;
	};

	let has_new_resolutions = resolved.iter().any(|fp| !previous.resolved.contains(fp));
	if has_new_resolutions {
		return DedupDecision::Send;
	}

	if firing != &previous.firing {
		return DedupDecision::Send;
	}

	let next_allowed = previous.timestamp.checked_add(repeat_interval).unwrap_or(previous.timestamp);
	if now >= next_allowed {
		DedupDecision::Send
	} else {
		DedupDecision::Skip
	}
}
