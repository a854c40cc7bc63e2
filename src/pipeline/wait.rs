//! WaitByPeerPosition and WaitByConfiguredDelay stages (spec.md §4.3, stages 2 & 6).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// True if `cancel` won the race against the wait, i.e. the caller should
/// abandon the pipeline invocation (spec.md §5 "Cancellation and timeouts").
///
/// Sleeps for `peer_position * base_timeout`, staggering flushes across peers
/// so lower-positioned peers send first (spec.md §4.3 stage 2).
pub async fn by_peer_position(base_timeout: Duration, peer_position: usize, cancel: &CancellationToken) -> bool {
	let wait = base_timeout * peer_position as u32;
	if wait.is_zero() {
		return false;
	}
	tokio::select! {
		_ = tokio::time::sleep(wait) => false,
		_ = cancel.cancelled() => true,
	}
}

/// Applies the receiver-specific send delay (spec.md §4.3 stage 6). Returns
/// `true` if cancelled before the delay elapsed.
pub async fn by_configured_delay(delay: Duration, cancel: &CancellationToken) -> bool {
	if delay.is_zero() {
		return false;
	}
	tokio::select! {
		_ = tokio::time::sleep(delay) => false,
		_ = cancel.cancelled() => true,
	}
}
