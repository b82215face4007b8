// SPDX-License-Identifier: Apache-2.0

//! Entry point: wires gossip membership, mTLS cluster bootstrap, plugin
//! dispatch, and the peer manifest cache into a running node agent (spec
//! §2, §4.3).
//!
//! This binary deliberately stops at the coordination fabric. Concrete
//! plugin bodies and the OCI registry data path are external collaborators
//! (spec §1 "Non-goals"): this process never itself answers `/info` or
//! `/event`, it only dispatches to whichever node does.

mod auth_gate;
mod ca;
mod cli;
mod config;
mod server;

use beskar_auth::AccessController;
use beskar_cache::{CacheConfig, ManifestCache, ManifestLoader, RemoteCacheClient};
use beskar_common::error::{Error, Result};
use beskar_common::node::{HostPort, NodeMetadata};
use beskar_gossip::{GossipConfig, GossipEvent, GossipMember};
use beskar_hash::{HashEntry, NodeHash};
use beskar_plugin::PluginManager;
use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// The cache's wrapped manifest service (spec §4.5 "the wrapped manifest
/// service"). This node agent never serves artifact content of its own — a
/// co-hosted registry process owns that data path — so a miss that reaches
/// this far always means "ask the registry that actually owns the bytes",
/// which this workspace has no handle to. Recorded as an open boundary in
/// DESIGN.md rather than quietly faked with canned data.
struct NoLocalRegistry;

#[async_trait::async_trait]
impl ManifestLoader for NoLocalRegistry {
	async fn load(&self, repository: &str, digest: &str) -> Result<(String, Vec<u8>)> {
		Err(Error::not_implemented(format!(
			"no local registry process to load {repository}@{digest} from; \
			 this node only relays cache traffic for keys it owns"
		)))
	}
}

fn init_logging() {
	let env = env_logger::Env::default()
		.filter_or("RUST_LOG", "info,libp2p=warn,rustls=warn,reqwest=warn,hyper=warn");
	env_logger::Builder::from_env(env).init();
}

fn parse_multiaddr(s: &str) -> Result<libp2p::Multiaddr> {
	s.parse().map_err(|e| Error::invalid_argument(format!("invalid multiaddr {s:?}: {e}")))
}

/// Resolves this node's CA bundle at startup, generating the cluster's CA if
/// nobody answered (spec §4.3, §7). Fatal on any underlying generation
/// failure — there is no fallback bootstrap path.
async fn bootstrap_ca(
	member: &GossipMember,
	remote_state: Option<Vec<u8>>,
	seed_bundle: Option<ca::CaBundle>,
	validity_days: i64,
) -> Result<ca::CaBundle> {
	match ca::resolve_ca(remote_state, seed_bundle, validity_days) {
		Ok(bundle) => Ok(bundle),
		Err(_) => {
			log::info!("ca: no remote state received, becoming the cluster's bootstrap node");
			let bundle = ca::generate_cluster_ca(validity_days)?;
			member.publish_remote_state(bundle.encode())?;
			Ok(bundle)
		}
	}
}

async fn run(args: cli::ServeArgs) -> Result<()> {
	let config = config::NodeConfig::load(&args.config)?;

	log::info!("starting node [hostname: {}]", config.hostname);

	let gossip_config = GossipConfig {
		listen_addr: parse_multiaddr(&config.gossip_listen)?,
		bootstrap_peers: config
			.bootstrap_peers
			.iter()
			.map(|s| parse_multiaddr(s))
			.collect::<Result<Vec<_>>>()?,
		metadata: NodeMetadata {
			hostname: config.hostname.clone(),
			service_port: config.service_port,
			cache_port: config.cache_port,
		},
		heartbeat_interval: Duration::from_millis(config.gossip_heartbeat_ms),
	};

	let seed_bundle = if config.seed_new_cluster {
		Some(ca::generate_cluster_ca(config.ca_validity_days)?)
	} else {
		None
	};
	let seed_state = seed_bundle.as_ref().map(|b| b.encode());

	let (member, remote_state) = GossipMember::start(
		gossip_config,
		seed_state,
		Duration::from_millis(config.remote_state_timeout_ms),
	)
	.await?;

	let ca_bundle = bootstrap_ca(&member, remote_state, seed_bundle, config.ca_validity_days).await?;

	let leaf = beskar_mtls::generate_leaf(
		&ca_bundle.as_cert_key_pair(),
		&config.hostname,
		time::Duration::hours(config.leaf_validity_hours),
		&[config.advertise_addr],
		&[config.hostname.clone()],
	)?;

	let server_tls = Arc::new(beskar_mtls::server_tls_config(&ca_bundle.cert_pem, &leaf.cert_pem, &leaf.key_pem)?);
	let client_tls = beskar_mtls::client_tls_config(&ca_bundle.cert_pem, &leaf.cert_pem, &leaf.key_pem)?;

	let http_client = reqwest::Client::builder()
		.use_preconfigured_tls(client_tls.clone())
		.build()
		.map_err(|e| Error::internal(format!("failed to build mTLS http client: {e}")))?;

	let access_controller = Arc::new(build_access_controller(&config)?);

	let plugin_manager = Arc::new(PluginManager::new(http_client));

	let cache_peers = Arc::new(NodeHash::new());
	cache_peers.add(HashEntry {
		hostname: config.hostname.clone(),
		hostport: HostPort {
			host: config.advertise_addr.to_string(),
			port: config.cache_port,
		},
	});

	let remote_cache_client = RemoteCacheClient::new(client_tls)?;
	let cache = Arc::new(ManifestCache::new(
		NoLocalRegistry,
		config.hostname.clone(),
		cache_peers.clone(),
		remote_cache_client,
		CacheConfig::default(),
	));

	let membership_task = {
		let plugin_manager = plugin_manager.clone();
		let cache_peers = cache_peers.clone();
		let mut events = member.watch();
		tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(GossipEvent::NodeJoin(node)) => {
						cache_peers.add(HashEntry {
							hostname: node.metadata.hostname.clone(),
							hostport: node.cache_hostport(),
						});
						if let Err(e) = plugin_manager.on_join(&node).await {
							log::warn!("plugin manager: on_join({}) failed: {e}", node.metadata.hostname);
						}
					}
					Ok(GossipEvent::NodeLeave(node)) => {
						cache_peers.remove(&node.metadata.hostname);
						plugin_manager.on_leave(&node);
					}
					Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
						log::warn!("membership watcher lagged, skipped {skipped} events");
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
				}
			}
		})
	};

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

	let service_addr = SocketAddr::new(config.advertise_addr, config.service_port);
	let cache_addr = SocketAddr::new(config.advertise_addr, config.cache_port);

	let service_app = plugin_manager
		.router()
		.route_layer(axum::middleware::from_fn_with_state(access_controller, auth_gate::require_access));
	let cache_app = beskar_cache::router(cache);

	let service_server = tokio::spawn(server::serve_mtls(service_addr, server_tls.clone(), service_app, shutdown_rx.clone()));
	let cache_server = tokio::spawn(server::serve_mtls(cache_addr, server_tls, cache_app, shutdown_rx));

	wait_for_shutdown_signal().await;
	log::info!("shutdown signal received, draining connections");
	let _ = shutdown_tx.send(true);

	let _ = service_server.await;
	let _ = cache_server.await;
	membership_task.abort();
	member.shutdown().await?;

	Ok(())
}

fn build_access_controller(config: &config::NodeConfig) -> Result<AccessController> {
	let htpasswd = match &config.htpasswd_path {
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.map_err(|e| Error::invalid_argument(format!("failed to read htpasswd file {path:?}: {e}")))?;
			AccessController::parse_htpasswd(&contents)?
		}
		None => Default::default(),
	};
	Ok(AccessController::new(config.hostname.clone(), htpasswd, config.trusted_peer_hashes.clone()))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		_ = sigterm.recv() => {}
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
	init_logging();

	let args = cli::Args::parse();
	let cli::Commands::Serve(serve_args) = args.command;

	match run(serve_args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			log::error!("fatal: {e}");
			ExitCode::FAILURE
		}
	}
}
