use std::{collections::HashMap, fs, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use miette::{IntoDiagnostic, Result, miette};
use tracing::{debug, info};
use ulid::Ulid;

use alertmantle::{
	AlertProvider, Cluster, Dispatcher, GossipedComponent, MarkerStore, NflogChannel, NotificationLog, NullReceiver,
	PipelineContext, Receiver, RouteTree, Silences, SilencesChannel, SystemClock,
};

/// Alert routing, grouping, silencing and gossiped notification dispatch.
#[derive(Debug, Clone, Parser)]
struct Args {
	/// Path to the YAML or JSON configuration file.
	#[arg(long, env = "ALERTMANTLE_CONFIG")]
	config: PathBuf,

	/// Verbosity: repeat for more detail (-v, -vv, -vvv).
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,
}

fn setup_logging(verbose: u8) {
	let directive = match verbose {
		0 => "alertmantle=info",
		1 => "info,alertmantle=debug",
		2 => "debug",
		_ => "trace",
	};
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| directive.into()))
		.init();
}

/// Loads this peer's gossip identity from `<data_dir>/identity`, generating
/// and persisting a fresh one on first run (spec.md §4.7 "each peer
/// participates in gossip with a ULID identity" — stable across restarts, not
/// shared config baked into the file every replica reads).
fn load_or_create_identity(data_dir: &std::path::Path) -> Result<Ulid> {
	let path = data_dir.join("identity");
	if let Ok(contents) = fs::read_to_string(&path) {
		return contents.trim().parse::<Ulid>().into_diagnostic();
	}
	let identity = Ulid::new();
	fs::write(&path, identity.to_string()).into_diagnostic()?;
	Ok(identity)
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	setup_logging(args.verbose);
	debug!(?args, "got arguments");

	let raw = fs::read_to_string(&args.config).into_diagnostic()?;
	let config = match args.config.extension().and_then(|e| e.to_str()) {
		Some("json") => alertmantle::Config::from_json(&raw)?,
		_ => alertmantle::Config::from_yaml(&raw)?,
	};

	fs::create_dir_all(&config.data_dir).into_diagnostic()?;
	alertmantle::init_metrics();

	let clock: alertmantle::SharedClock = Arc::new(SystemClock);
	let identity = load_or_create_identity(&config.data_dir)?;

	let route_tree = Arc::new(RouteTree::compile(config.routes.clone()).map_err(|err| miette!("invalid route tree: {err}"))?);
	let inhibitor = Arc::new(alertmantle::Inhibitor::compile(config.inhibit_rules.clone()).map_err(|err| miette!("invalid inhibit rule: {err}"))?);
	let provider = Arc::new(AlertProvider::new(clock.clone(), config.resolve_timeout));

	let silences = Arc::new(Silences::new(clock.clone(), config.stores.silence_retention, config.stores.silence_limits()));
	let silence_snapshot = config.data_dir.join("silences.json");
	match silences.snapshot_load(&silence_snapshot) {
		Ok(count) => info!(count, "loaded silence snapshot"),
		Err(err) => return Err(miette!("failed to load silence snapshot: {err}")),
	}

	let nflog = Arc::new(NotificationLog::new(clock.clone(), config.stores.nflog_retention));
	let nflog_snapshot = config.data_dir.join("nflog.json");
	match nflog.snapshot_load(&nflog_snapshot) {
		Ok(count) => info!(count, "loaded notification log snapshot"),
		Err(err) => return Err(miette!("failed to load notification log snapshot: {err}")),
	}

	if config.cluster.tls.is_some() {
		let _ = rustls::crypto::ring::default_provider().install_default();
	}

	let channels: Vec<Arc<dyn GossipedComponent>> = vec![Arc::new(SilencesChannel(silences.clone())), Arc::new(NflogChannel(nflog.clone()))];
	let cluster_config = config.cluster.clone().into_cluster_config(identity)?;
	let cluster = Cluster::bind(cluster_config, channels).await.map_err(|err| miette!("failed to bind gossip transport: {err}"))?;

	let receivers: HashMap<String, Arc<dyn Receiver>> = config
		.receivers
		.iter()
		.map(|r| (r.name.clone(), Arc::new(NullReceiver::new(r.name.clone())) as Arc<dyn Receiver>))
		.collect();

	let marker = Arc::new(MarkerStore::new());
	let pipeline_ctx = Arc::new(PipelineContext {
		silences: silences.clone(),
		inhibitor: inhibitor.clone(),
		nflog: nflog.clone(),
		marker,
		clock: clock.clone(),
		cluster: cluster.clone(),
		gossip_settle_wait_bound: Duration::from_secs(5),
		peer_position_base_timeout: Duration::from_millis(500),
		retry_policy: alertmantle::RetryPolicy::default(),
		shutdown: tokio_util::sync::CancellationToken::new(),
	});

	let dispatcher = Dispatcher::new(route_tree, provider.clone(), receivers, pipeline_ctx, clock.clone());

	let cluster_task = tokio::spawn(cluster.clone().run());
	let dispatcher_task = tokio::spawn(dispatcher.clone().run());
	let reindex_task = tokio::spawn(reindex_loop(provider.clone(), inhibitor.clone()));
	let gc_task = tokio::spawn(gc_loop(provider.clone(), silences.clone(), nflog.clone()));

	info!("alertmantle running");
	tokio::signal::ctrl_c().await.into_diagnostic()?;
	info!("shutdown requested");

	dispatcher.stop();
	cluster.stop();
	reindex_task.abort();
	gc_task.abort();
	let _ = dispatcher_task.await;
	let _ = cluster_task.await;

	silences.snapshot_save(&silence_snapshot).map_err(|err| miette!("failed to save silence snapshot: {err}"))?;
	nflog.snapshot_save(&nflog_snapshot).map_err(|err| miette!("failed to save notification log snapshot: {err}"))?;

	Ok(())
}

/// Rebuilds the inhibitor's firing-source cache on a fixed cadence
/// (spec.md §4.5 "on each update reindexes the firing-source cache").
async fn reindex_loop(provider: Arc<AlertProvider>, inhibitor: Arc<alertmantle::Inhibitor>) {
	let mut ticker = tokio::time::interval(Duration::from_secs(1));
	loop {
		ticker.tick().await;
		inhibitor.reindex(&provider);
	}
}

/// Periodically sweeps expired alerts, silences, and notification log
/// entries (spec.md §3 "Expired entries are garbage-collected").
async fn gc_loop(provider: Arc<AlertProvider>, silences: Arc<Silences>, nflog: Arc<NotificationLog>) {
	let mut ticker = tokio::time::interval(Duration::from_secs(60));
	loop {
		ticker.tick().await;
		let removed_alerts = provider.gc();
		let removed_silences = silences.gc();
		let removed_nflog = nflog.gc();
		debug!(removed_alerts, removed_silences, removed_nflog, "garbage collection pass complete");
	}
}
