//! Gossip membership and state-replication substrate (spec.md §4.7).
//!
//! UDP carries membership pings and best-effort broadcast; TCP carries
//! full-state anti-entropy push-pull over a keyed connection pool
//! (spec.md §4.7 "Transport", §5 "Connection pool"). The socket-loop shape
//! follows the daemon's `daemon.rs` spawn-one-task-per-concern pattern,
//! generalized from file-watch/HTTP/scheduler tasks to gossip/anti-entropy
//! tasks.

use std::{
	collections::{HashMap, VecDeque},
	net::SocketAddr,
	path::Path,
	sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
	time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::Rng as _;
use rustls::pki_types::{CertificateDer, IpAddr as RustlsIpAddr, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	net::{TcpListener, TcpStream, UdpSocket},
	sync::{Mutex as AsyncMutex, watch},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::{
	error::{ClusterError, LogError},
	pipeline::ClusterView,
};

/// Either of the two wire transports spec.md §4.7 allows: plain TCP
/// (default) or a TLS-wrapped variant doing mutual authentication between
/// peers off a shared cluster CA. Both frame packet/stream traffic over the
/// same keyed connection pool (spec.md §5 "Connection pool") — the choice
/// only changes what `ConnectionPool`/`accept_loop` hand back, not how
/// anti-entropy speaks to it.
#[derive(Clone)]
pub enum TransportConfig {
	Tcp,
	Tls(Arc<TlsMaterial>),
}

impl std::fmt::Debug for TransportConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TransportConfig::Tcp => write!(f, "Tcp"),
			TransportConfig::Tls(_) => write!(f, "Tls"),
		}
	}
}

/// Loaded certificate material for the TLS transport: a peer's own
/// cert+key plus the cluster CA, from which both a `ServerConfig`
/// (requiring client certs signed by the CA) and a `ClientConfig`
/// (trusting only the CA) are derived. Peers authenticate each other by
/// certificate chain only, not by hostname, since cluster members are
/// addressed by IP and rotate; callers mint one leaf cert per peer off a
/// shared offline CA.
pub struct TlsMaterial {
	server_config: Arc<rustls::ServerConfig>,
	client_config: Arc<rustls::ClientConfig>,
}

impl TlsMaterial {
	/// Loads `cert_path`/`key_path` (this peer's leaf certificate and
	/// private key, PEM) and `ca_path` (the cluster CA, PEM) and builds
	/// mutual-TLS server and client configs from them.
	pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self, ClusterError> {
		let certs = load_certs(cert_path)?;
		let key = load_private_key(key_path)?;
		let ca_certs = load_certs(ca_path)?;

		let mut roots = rustls::RootCertStore::empty();
		for ca in &ca_certs {
			roots.add(ca.clone()).map_err(|e| ClusterError::TlsMaterial {
				path: ca_path.to_path_buf(),
				reason: e.to_string(),
			})?;
		}

		let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots.clone()))
			.build()
			.map_err(|e| ClusterError::TlsMaterial {
				path: ca_path.to_path_buf(),
				reason: e.to_string(),
			})?;
		let server_config = rustls::ServerConfig::builder()
			.with_client_cert_verifier(client_verifier)
			.with_single_cert(certs.clone(), key.clone())
			.map_err(|e| ClusterError::TlsMaterial {
				path: cert_path.to_path_buf(),
				reason: e.to_string(),
			})?;

		let client_config = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_client_auth_cert(certs, key)
			.map_err(|e| ClusterError::TlsMaterial {
				path: cert_path.to_path_buf(),
				reason: e.to_string(),
			})?;

		Ok(Self {
			server_config: Arc::new(server_config),
			client_config: Arc::new(client_config),
		})
	}
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClusterError> {
	let bytes = std::fs::read(path).map_err(|e| ClusterError::TlsMaterial {
		path: path.to_path_buf(),
		reason: e.to_string(),
	})?;
	rustls_pemfile::certs(&mut bytes.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| ClusterError::TlsMaterial {
			path: path.to_path_buf(),
			reason: e.to_string(),
		})
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClusterError> {
	let bytes = std::fs::read(path).map_err(|e| ClusterError::TlsMaterial {
		path: path.to_path_buf(),
		reason: e.to_string(),
	})?;
	rustls_pemfile::private_key(&mut bytes.as_slice())
		.map_err(|e| ClusterError::TlsMaterial {
			path: path.to_path_buf(),
			reason: e.to_string(),
		})?
		.ok_or_else(|| ClusterError::TlsMaterial {
			path: path.to_path_buf(),
			reason: "no private key found in file".to_string(),
		})
}

/// Unifies plain and TLS-wrapped connections behind one object-safe type so
/// `ConnectionPool`, `read_envelope` and `write_envelope` don't need to know
/// which transport is in play.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

const MAX_DATAGRAM: usize = 16 * 1024;
const REBROADCAST_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum GossipMessage {
	Ping { id: Ulid, advertise: SocketAddr },
	Pong { id: Ulid, advertise: SocketAddr },
	Broadcast { channel: String, payload: Vec<u8> },
}

/// A replicated state component registered with the cluster under a channel
/// key (spec.md §4.7 "Broadcast": "Each replicated state component...
/// supplies two callbacks: serialize-full... and merge-delta").
pub trait GossipedComponent: Send + Sync {
	fn channel(&self) -> &str;
	fn serialize_full(&self) -> Vec<u8>;
	fn merge_delta(&self, from: SocketAddr, bytes: &[u8]) -> Result<(), ClusterError>;
}

/// Adapts [`crate::silence::Silences`] to the gossip channel interface.
pub struct SilencesChannel(pub Arc<crate::silence::Silences>);

impl GossipedComponent for SilencesChannel {
	fn channel(&self) -> &str {
		"silences"
	}

	fn serialize_full(&self) -> Vec<u8> {
		encode_frames(&self.0.marshal_full())
	}

	fn merge_delta(&self, from: SocketAddr, bytes: &[u8]) -> Result<(), ClusterError> {
		let frames: Vec<crate::silence::MeshSilence> =
			decode_frames(bytes).map_err(|reason| ClusterError::Decode { addr: from, reason })?;
		for frame in frames {
			if let Err(err) = self.0.merge(frame) {
				warn!(%from, error = %LogError(&err), "rejected incoming silence during gossip merge");
			}
		}
		Ok(())
	}
}

/// Adapts [`crate::nflog::NotificationLog`] to the gossip channel interface.
pub struct NflogChannel(pub Arc<crate::nflog::NotificationLog>);

impl GossipedComponent for NflogChannel {
	fn channel(&self) -> &str {
		"nflog"
	}

	fn serialize_full(&self) -> Vec<u8> {
		encode_frames(&self.0.marshal_full())
	}

	fn merge_delta(&self, from: SocketAddr, bytes: &[u8]) -> Result<(), ClusterError> {
		let frames: Vec<crate::nflog::NflogEntry> =
			decode_frames(bytes).map_err(|reason| ClusterError::Decode { addr: from, reason })?;
		for frame in frames {
			self.0.merge(frame);
		}
		Ok(())
	}
}

/// Length-prefixed JSON framing, matching the on-disk snapshot format used by
/// `silence.rs`/`nflog.rs` (spec.md §6 "length-prefixed concatenations").
fn encode_frames<T: Serialize>(items: &[T]) -> Vec<u8> {
	let mut buf = Vec::new();
	for item in items {
		let encoded = serde_json::to_vec(item).expect("gossiped state is always serializable");
		buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
		buf.extend_from_slice(&encoded);
	}
	buf
}

fn decode_frames<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<Vec<T>, String> {
	let mut cursor = 0usize;
	let mut out = Vec::new();
	while cursor + 4 <= bytes.len() {
		let len = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
		cursor += 4;
		if cursor + len > bytes.len() {
			return Err("truncated gossip frame".to_string());
		}
		out.push(serde_json::from_slice(&bytes[cursor..cursor + len]).map_err(|e| e.to_string())?);
		cursor += len;
	}
	Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerStatus {
	Alive,
	Failed,
}

struct PeerEntry {
	id: Ulid,
	advertise: SocketAddr,
	status: PeerStatus,
	last_seen: Instant,
	leave_time: Option<Instant>,
}

/// Startup configuration for the gossip cluster (SPEC_FULL.md §2.3;
/// spec.md §6 "gossip bind/advertise addresses, peer seed list, ... ,
/// reconnect interval/timeout, gossip/push-pull/probe intervals").
#[derive(Debug, Clone)]
pub struct ClusterConfig {
	pub identity: Ulid,
	pub bind_addr: SocketAddr,
	pub advertise_addr: SocketAddr,
	pub seeds: Vec<String>,
	/// Cadence for liveness pings to known peers.
	pub probe_interval: Duration,
	/// Cadence for rebroadcasting recently-sent deltas, strengthening
	/// best-effort delivery over lossy UDP (spec.md §4.7 "Broadcast":
	/// "idempotent CRDT merge ensures convergence").
	pub gossip_interval: Duration,
	/// Cadence for full-state anti-entropy push-pull with a random live peer.
	pub push_pull_interval: Duration,
	/// Cadence for seed re-resolution and stale-peer sweeps.
	pub reconnect_interval: Duration,
	/// How long a `Failed` peer is retained before being forgotten.
	pub reconnect_timeout: Duration,
	pub settle_poll_interval: Duration,
	pub settle_deadline: Duration,
	/// Per-operation I/O deadline for a pooled anti-entropy connection
	/// (spec.md §4.7 "the pool keys connections by (address, timeout)").
	pub push_pull_timeout: Duration,
	/// Plain TCP by default; `Tls` wraps both the accept side and the
	/// pooled outbound connections in mutual TLS (spec.md §4.7 "Transport").
	pub transport: TransportConfig,
}

#[derive(Serialize, Deserialize)]
struct PushPullFrame {
	channel: String,
	payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct PushPullEnvelope {
	frames: Vec<PushPullFrame>,
}

/// TCP connections keyed by (address, timeout), reused while alive and
/// redialed on demand; a borrowed connection self-locks for the duration of
/// its use rather than being returned to a shared pool (spec.md §5
/// "Connection pool").
struct ConnectionPool {
	conns: StdMutex<HashMap<(SocketAddr, Duration), Arc<AsyncMutex<Option<BoxedStream>>>>>,
}

impl ConnectionPool {
	fn new() -> Self {
		Self {
			conns: StdMutex::new(HashMap::new()),
		}
	}

	async fn borrow(
		&self,
		addr: SocketAddr,
		timeout: Duration,
		transport: &TransportConfig,
	) -> Result<tokio::sync::OwnedMutexGuard<Option<BoxedStream>>, ClusterError> {
		let slot = {
			let mut conns = self.conns.lock().unwrap();
			conns.entry((addr, timeout)).or_insert_with(|| Arc::new(AsyncMutex::new(None))).clone()
		};
		let mut guard = slot.lock_owned().await;
		if guard.is_none() {
			let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
				.await
				.map_err(|_| ClusterError::Send {
					addr,
					source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
				})?
				.map_err(|source| ClusterError::Send { addr, source })?;
			let stream: BoxedStream = match transport {
				TransportConfig::Tcp => Box::new(tcp),
				TransportConfig::Tls(material) => {
					let connector = TlsConnector::from(material.client_config.clone());
					let server_name = ServerName::IpAddress(RustlsIpAddr::from(addr.ip()));
					let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
						.await
						.map_err(|_| ClusterError::TlsHandshake {
							addr,
							source: std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"),
						})?
						.map_err(|source| ClusterError::TlsHandshake { addr, source })?;
					Box::new(tls)
				}
			};
			*guard = Some(stream);
		}
		Ok(guard)
	}

	fn evict(guard: &mut tokio::sync::OwnedMutexGuard<Option<BoxedStream>>) {
		*guard = None;
	}
}

/// Gossip membership, broadcast and anti-entropy for one peer
/// (spec.md §2 "Cluster").
pub struct Cluster {
	config: ClusterConfig,
	socket: Arc<UdpSocket>,
	listener: AsyncMutex<Option<TcpListener>>,
	peers: StdRwLock<HashMap<Ulid, PeerEntry>>,
	channels: HashMap<String, Arc<dyn GossipedComponent>>,
	recent: StdMutex<VecDeque<(String, Vec<u8>)>>,
	settle_tx: watch::Sender<bool>,
	settle_rx: watch::Receiver<bool>,
	pool: ConnectionPool,
	tls_acceptor: Option<TlsAcceptor>,
	shutdown: CancellationToken,
}

impl Cluster {
	/// Binds the UDP gossip socket and TCP anti-entropy listener
	/// (spec.md §7 "Fatal: cannot bind gossip port at startup").
	pub async fn bind(config: ClusterConfig, channels: Vec<Arc<dyn GossipedComponent>>) -> Result<Arc<Self>, ClusterError> {
		let tls_acceptor = match &config.transport {
			TransportConfig::Tcp => None,
			TransportConfig::Tls(material) => Some(TlsAcceptor::from(material.server_config.clone())),
		};
		let socket = UdpSocket::bind(config.bind_addr)
			.await
			.map_err(|source| ClusterError::Bind { addr: config.bind_addr, source })?;
		let listener = TcpListener::bind(config.bind_addr)
			.await
			.map_err(|source| ClusterError::Bind { addr: config.bind_addr, source })?;
		let (settle_tx, settle_rx) = watch::channel(false);
		let channels = channels.into_iter().map(|c| (c.channel().to_string(), c)).collect();
		Ok(Arc::new(Self {
			config,
			socket: Arc::new(socket),
			listener: AsyncMutex::new(Some(listener)),
			peers: StdRwLock::new(HashMap::new()),
			channels,
			recent: StdMutex::new(VecDeque::new()),
			settle_tx,
			settle_rx,
			pool: ConnectionPool::new(),
			tls_acceptor,
			shutdown: CancellationToken::new(),
		}))
	}

	pub fn stop(&self) {
		self.shutdown.cancel();
	}

	/// Live peer count including self, for metrics/diagnostics.
	pub fn member_count(&self) -> usize {
		self.peers.read().unwrap().values().filter(|p| p.status == PeerStatus::Alive).count() + 1
	}

	pub fn failed_peer_count(&self) -> usize {
		self.peers.read().unwrap().values().filter(|p| p.status == PeerStatus::Failed).count()
	}

	/// Publishes a delta to every live peer and buffers it for a few rounds
	/// of rebroadcast (spec.md §4.7 "Broadcast").
	#[instrument(skip(self, payload))]
	pub async fn broadcast(&self, channel: &str, payload: Vec<u8>) {
		{
			let mut recent = self.recent.lock().unwrap();
			if recent.len() >= REBROADCAST_BUFFER {
				recent.pop_front();
			}
			recent.push_back((channel.to_string(), payload.clone()));
		}
		self.send_to_all_alive(&GossipMessage::Broadcast {
			channel: channel.to_string(),
			payload,
		})
		.await;
	}

	async fn send_to_all_alive(&self, msg: &GossipMessage) {
		let Ok(bytes) = serde_json::to_vec(msg) else { return };
		let targets: Vec<SocketAddr> = self.peers.read().unwrap().values().filter(|p| p.status == PeerStatus::Alive).map(|p| p.advertise).collect();
		for addr in targets {
			let _ = self.socket.send_to(&bytes, addr).await;
		}
	}

	async fn ping(&self, addr: SocketAddr) {
		let msg = GossipMessage::Ping {
			id: self.config.identity,
			advertise: self.config.advertise_addr,
		};
		if let Ok(bytes) = serde_json::to_vec(&msg) {
			let _ = self.socket.send_to(&bytes, addr).await;
		}
	}

	fn mark_alive(&self, id: Ulid, advertise: SocketAddr) {
		if id == self.config.identity {
			return;
		}
		let mut peers = self.peers.write().unwrap();
		let entry = peers.entry(id).or_insert_with(|| PeerEntry {
			id,
			advertise,
			status: PeerStatus::Failed,
			last_seen: Instant::now(),
			leave_time: None,
		});
		entry.advertise = advertise;
		entry.last_seen = Instant::now();
		if entry.status == PeerStatus::Failed {
			info!(peer = %id, "peer joined or rejoined the cluster");
		}
		entry.status = PeerStatus::Alive;
		entry.leave_time = None;
	}

	async fn handle_datagram(&self, addr: SocketAddr, msg: GossipMessage) {
		match msg {
			GossipMessage::Ping { id, advertise } => {
				self.mark_alive(id, advertise);
				let pong = GossipMessage::Pong {
					id: self.config.identity,
					advertise: self.config.advertise_addr,
				};
				if let Ok(bytes) = serde_json::to_vec(&pong) {
					let _ = self.socket.send_to(&bytes, addr).await;
				}
			}
			GossipMessage::Pong { id, advertise } => self.mark_alive(id, advertise),
			GossipMessage::Broadcast { channel, payload } => {
				if let Some(component) = self.channels.get(&channel) {
					if let Err(err) = component.merge_delta(addr, &payload) {
						warn!(%addr, channel, error = %LogError(&err), "failed to merge broadcast gossip message");
					}
				} else {
					debug!(%addr, channel, "received broadcast for unregistered channel");
				}
			}
		}
	}

	async fn udp_loop(self: Arc<Self>) {
		let mut buf = vec![0u8; MAX_DATAGRAM];
		loop {
			let (len, addr) = match self.socket.recv_from(&mut buf).await {
				Ok(pair) => pair,
				Err(err) => {
					warn!(error = %err, "gossip UDP recv failed");
					continue;
				}
			};
			match serde_json::from_slice::<GossipMessage>(&buf[..len]) {
				Ok(msg) => self.handle_datagram(addr, msg).await,
				Err(err) => warn!(%addr, error = %err, "dropping malformed gossip datagram"),
			}
		}
	}

	async fn probe_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.config.probe_interval);
		loop {
			ticker.tick().await;
			let addrs: Vec<SocketAddr> = self.peers.read().unwrap().values().map(|p| p.advertise).collect();
			for addr in addrs {
				self.ping(addr).await;
			}
		}
	}

	async fn gossip_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.config.gossip_interval);
		loop {
			ticker.tick().await;
			let buffered: Vec<(String, Vec<u8>)> = self.recent.lock().unwrap().iter().cloned().collect();
			for (channel, payload) in buffered {
				self.send_to_all_alive(&GossipMessage::Broadcast { channel, payload }).await;
			}
		}
	}

	async fn resolve_seeds(&self) {
		for seed in &self.config.seeds {
			match tokio::net::lookup_host(seed.as_str()).await {
				Ok(addrs) => {
					for addr in addrs {
						let known = self.peers.read().unwrap().values().any(|p| p.advertise == addr);
						if !known {
							self.ping(addr).await;
						}
					}
				}
				Err(err) => warn!(seed, error = %err, "failed to resolve gossip seed"),
			}
		}
	}

	/// Resolves seeds, then marks peers unseen for three probe intervals
	/// `Failed`, then forgets peers `Failed` for longer than
	/// `reconnect_timeout` (spec.md §4.7 "Peer states").
	async fn maintenance_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.config.reconnect_interval);
		let stale_after = self.config.probe_interval.saturating_mul(3);
		loop {
			ticker.tick().await;
			self.resolve_seeds().await;
			let now = Instant::now();
			let mut peers = self.peers.write().unwrap();
			for peer in peers.values_mut() {
				if peer.status == PeerStatus::Alive && now.saturating_duration_since(peer.last_seen) > stale_after {
					peer.status = PeerStatus::Failed;
					peer.leave_time = Some(now);
					warn!(peer = %peer.id, "peer failed gossip liveness check");
				}
			}
			peers.retain(|_, peer| match peer.leave_time {
				Some(left) => now.saturating_duration_since(left) <= self.config.reconnect_timeout,
				None => true,
			});
		}
	}

	/// Polls member count until stable across three consecutive polls or
	/// `settle_deadline` elapses (spec.md §4.7 "Settle").
	async fn settle_loop(self: Arc<Self>) {
		let mut history: VecDeque<usize> = VecDeque::with_capacity(3);
		let deadline = tokio::time::Instant::now() + self.config.settle_deadline;
		let mut ticker = tokio::time::interval(self.config.settle_poll_interval);
		loop {
			ticker.tick().await;
			history.push_back(self.member_count());
			if history.len() > 3 {
				history.pop_front();
			}
			let stable = history.len() == 3 && history.iter().all(|c| *c == history[0]);
			if stable || tokio::time::Instant::now() >= deadline {
				let _ = self.settle_tx.send(true);
				info!(stable, members = self.member_count(), "gossip membership settled");
				return;
			}
		}
	}

	async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
		loop {
			match listener.accept().await {
				Ok((stream, addr)) => {
					let this = self.clone();
					tokio::spawn(async move { this.serve_push_pull(stream, addr).await });
				}
				Err(err) => warn!(error = %err, "gossip TCP accept failed"),
			}
		}
	}

	async fn serve_push_pull(&self, stream: TcpStream, addr: SocketAddr) {
		let mut stream: BoxedStream = match &self.tls_acceptor {
			None => Box::new(stream),
			Some(acceptor) => match acceptor.accept(stream).await {
				Ok(tls) => Box::new(tls),
				Err(source) => {
					warn!(%addr, error = %LogError(&ClusterError::TlsHandshake { addr, source }), "inbound TLS handshake failed");
					return;
				}
			},
		};
		if let Err(err) = self.serve_push_pull_inner(&mut *stream, addr).await {
			warn!(%addr, error = %LogError(&err), "inbound anti-entropy exchange failed");
		}
	}

	async fn serve_push_pull_inner(&self, stream: &mut dyn AsyncStream, addr: SocketAddr) -> Result<(), ClusterError> {
		let remote = read_envelope(stream, addr).await?;
		self.apply_envelope(addr, remote);
		let local = self.local_envelope();
		write_envelope(stream, addr, &local).await
	}

	fn local_envelope(&self) -> PushPullEnvelope {
		PushPullEnvelope {
			frames: self
				.channels
				.values()
				.map(|c| PushPullFrame {
					channel: c.channel().to_string(),
					payload: c.serialize_full(),
				})
				.collect(),
		}
	}

	fn apply_envelope(&self, from: SocketAddr, envelope: PushPullEnvelope) {
		for frame in envelope.frames {
			match self.channels.get(&frame.channel) {
				Some(component) => {
					if let Err(err) = component.merge_delta(from, &frame.payload) {
						warn!(%from, channel = frame.channel, error = %LogError(&err), "failed to merge anti-entropy frame");
					}
				}
				None => debug!(%from, channel = frame.channel, "anti-entropy frame for unregistered channel"),
			}
		}
	}

	/// Initiates anti-entropy with one peer: sends the local full state, then
	/// reads and merges the peer's (spec.md §4.7 "anti-entropy full-state
	/// pull/push").
	async fn push_pull_with(&self, addr: SocketAddr) -> Result<(), ClusterError> {
		let mut guard = self.pool.borrow(addr, self.config.push_pull_timeout, &self.config.transport).await?;
		let stream: &mut dyn AsyncStream = &mut **guard.as_mut().expect("borrow always populates the slot");

		let result = async {
			write_envelope(stream, addr, &self.local_envelope()).await?;
			read_envelope(stream, addr).await
		}
		.await;

		match result {
			Ok(remote) => {
				self.apply_envelope(addr, remote);
				Ok(())
			}
			Err(err) => {
				ConnectionPool::evict(&mut guard);
				Err(err)
			}
		}
	}

	async fn push_pull_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.config.push_pull_interval);
		loop {
			ticker.tick().await;
			let target = {
				let peers = self.peers.read().unwrap();
				let alive: Vec<SocketAddr> = peers.values().filter(|p| p.status == PeerStatus::Alive).map(|p| p.advertise).collect();
				if alive.is_empty() {
					None
				} else {
					Some(alive[rand::thread_rng().gen_range(0..alive.len())])
				}
			};
			let Some(target) = target else { continue };
			if let Err(err) = self.push_pull_with(target).await {
				warn!(peer = %target, error = %LogError(&err), "anti-entropy push-pull failed");
			}
		}
	}

	/// Runs every background task until `stop()` is called.
	pub async fn run(self: Arc<Self>) {
		let listener = self.listener.lock().await.take().expect("Cluster::run must be called exactly once");
		info!(bind = %self.config.bind_addr, "cluster started");
		let handles = vec![
			tokio::spawn(self.clone().accept_loop(listener)),
			tokio::spawn(self.clone().udp_loop()),
			tokio::spawn(self.clone().probe_loop()),
			tokio::spawn(self.clone().gossip_loop()),
			tokio::spawn(self.clone().maintenance_loop()),
			tokio::spawn(self.clone().push_pull_loop()),
			tokio::spawn(self.clone().settle_loop()),
		];
		self.shutdown.cancelled().await;
		info!("cluster shutting down");
		for handle in handles {
			handle.abort();
		}
	}
}

async fn read_envelope(stream: &mut dyn AsyncStream, addr: SocketAddr) -> Result<PushPullEnvelope, ClusterError> {
	let len = stream.read_u32().await.map_err(|source| ClusterError::Send { addr, source })?;
	let mut buf = vec![0u8; len as usize];
	stream.read_exact(&mut buf).await.map_err(|source| ClusterError::Send { addr, source })?;
	serde_json::from_slice(&buf).map_err(|e| ClusterError::Decode { addr, reason: e.to_string() })
}

async fn write_envelope(stream: &mut dyn AsyncStream, addr: SocketAddr, envelope: &PushPullEnvelope) -> Result<(), ClusterError> {
	let encoded = serde_json::to_vec(envelope).map_err(|e| ClusterError::Decode { addr, reason: e.to_string() })?;
	stream.write_u32(encoded.len() as u32).await.map_err(|source| ClusterError::Send { addr, source })?;
	stream.write_all(&encoded).await.map_err(|source| ClusterError::Send { addr, source })?;
	Ok(())
}

#[async_trait]
impl ClusterView for Cluster {
	async fn wait_settled(&self, bound: Duration) {
		let mut rx = self.settle_rx.clone();
		let _ = tokio::time::timeout(bound, async {
			while !*rx.borrow() {
				if rx.changed().await.is_err() {
					break;
				}
			}
		})
		.await;
	}

	fn peer_position(&self) -> usize {
		let peers = self.peers.read().unwrap();
		let mut ids: Vec<String> = peers.values().filter(|p| p.status == PeerStatus::Alive).map(|p| p.id.to_string()).collect();
		let local = self.config.identity.to_string();
		ids.push(local.clone());
		ids.sort();
		ids.iter().position(|id| *id == local).unwrap_or(0)
	}
}
