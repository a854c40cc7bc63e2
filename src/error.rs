use std::fmt;

/// Renders an error and its full source chain on one line, for `tracing` call sites.
///
/// Mirrors the daemon's own one-line error formatting: `tracing::error!` fields read
/// poorly with `{:?}` miette reports, so call sites use `LogError(&err)` instead.
pub struct LogError<'a, E: std::error::Error>(pub &'a E);

impl<E: std::error::Error> fmt::Display for LogError<'_, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)?;
		let mut source = self.0.source();
		while let Some(err) = source {
			write!(f, ": {err}")?;
			source = err.source();
		}
		Ok(())
	}
}

/// Errors from the silence store (spec.md §4.4, §7 taxonomy).
#[derive(Debug, thiserror::Error)]
pub enum SilenceError {
	#[error("silence has no matchers")]
	NoMatchers,
	#[error("every matcher in this silence would match the empty label set")]
	MatchesEmptyLabelSet,
	#[error("silence end time is before its start time")]
	EndBeforeStart,
	#[error("silence {0} not found")]
	NotFound(uuid::Uuid),
	#[error("maximum silence count ({limit}) exceeded")]
	TooManySilences { limit: usize },
	#[error("silence encoded size ({size}) exceeds the per-silence limit ({limit})")]
	TooLarge { size: usize, limit: usize },
	#[error("failed to read silence snapshot: {0}")]
	SnapshotRead(#[source] std::io::Error),
	#[error("failed to write silence snapshot: {0}")]
	SnapshotWrite(#[source] std::io::Error),
	#[error("failed to decode silence snapshot entry: {0}")]
	SnapshotDecode(String),
}

/// Errors from the notification log (spec.md §4.6, §7 taxonomy).
#[derive(Debug, thiserror::Error)]
pub enum NflogError {
	#[error("failed to read notification log snapshot: {0}")]
	SnapshotRead(#[source] std::io::Error),
	#[error("failed to write notification log snapshot: {0}")]
	SnapshotWrite(#[source] std::io::Error),
	#[error("failed to decode notification log snapshot entry: {0}")]
	SnapshotDecode(String),
}

/// Errors from alert ingest (spec.md §6 "Alert ingest", §7 "Invalid input").
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
	#[error("alert endsAt ({ends_at:?}) is before startsAt ({starts_at:?})")]
	EndBeforeStart {
		starts_at: jiff::Timestamp,
		ends_at: jiff::Timestamp,
	},
	#[error("alert has no labels")]
	EmptyLabelSet,
}

/// Errors raised while matching a label set against a route tree (spec.md §4.1).
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
	#[error("root route did not match: every root route must match unconditionally")]
	RootDidNotMatch,
}

/// Errors surfaced by a single pipeline stage (spec.md §4.3, §7).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
	#[error("receiver {receiver} send failed (retryable): {source}")]
	Retryable {
		receiver: String,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("receiver {receiver} send failed (permanent): {source}")]
	Permanent {
		receiver: String,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("pipeline invocation for group {group_key} cancelled")]
	Cancelled { group_key: String },
	#[error("retry budget exhausted for receiver {receiver} after {attempts} attempts")]
	RetriesExhausted { receiver: String, attempts: u32 },
}

/// Errors raised by the gossip cluster transport (spec.md §4.7, §7 "Fatal"/"Transient I/O").
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
	#[error("failed to bind gossip transport on {addr}: {source}")]
	Bind {
		addr: std::net::SocketAddr,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to resolve seed {seed}: {source}")]
	SeedResolve {
		seed: String,
		#[source]
		source: std::io::Error,
	},
	#[error("transport send to {addr} failed: {source}")]
	Send {
		addr: std::net::SocketAddr,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to decode gossip message from {addr}: {reason}")]
	Decode {
		addr: std::net::SocketAddr,
		reason: String,
	},
	#[error("channel {0} is not registered")]
	UnknownChannel(String),
	#[error("TLS handshake with {addr} failed: {source}")]
	TlsHandshake {
		addr: std::net::SocketAddr,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to load TLS material from {path}: {reason}")]
	TlsMaterial { path: std::path::PathBuf, reason: String },
}
