// SPDX-License-Identifier: Apache-2.0

//! Gossip-based cluster membership (spec §4.3).
//!
//! Enriches the dependency choice `ioustamora-AerolithDB/aerolithdb-network`
//! already made (`libp2p` with the `gossipsub`/`identify`/`mdns`/`kad`
//! feature set) with a real implementation: that crate's own `NetworkManager`
//! spawns a task that only sleeps and logs a heartbeat, so there was nothing
//! to adapt beyond the dependency choice itself.
//!
//! Node metadata (spec §3 "Node", §4.3) is broadcast on a gossipsub topic;
//! membership (`NodeJoin`/`NodeLeave`) is derived from gossipsub's own
//! peer-subscription events, which fire on both explicit topic
//! subscribe/unsubscribe and on disconnect — a reasonable proxy for SWIM's
//! failure detection without reimplementing SWIM's probe/ack protocol from
//! scratch. The CA bundle (spec §3 "CA bundle") rides the same topic as a
//! distinguished message type, periodically re-announced by whichever node
//! considers itself the bootstrap node.

mod behaviour;
mod wire;

use beskar_common::error::{Error, Result};
use beskar_common::node::{Node, NodeMetadata};
use dashmap::DashMap;
use libp2p::{identity, mdns, swarm::SwarmEvent, Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub use wire::WireMessage;

/// Configuration for joining or forming a cluster (spec §4.3 `Start`).
#[derive(Debug, Clone)]
pub struct GossipConfig {
	/// Local multiaddr to listen on, e.g. `/ip4/0.0.0.0/tcp/7946`.
	pub listen_addr: Multiaddr,
	/// Addresses of peers to dial on startup. Empty means "form a new
	/// cluster if nobody answers" (spec §4.3: "If no peers respond within
	/// the timeout, the node becomes the bootstrap node").
	pub bootstrap_peers: Vec<Multiaddr>,
	/// The metadata this node publishes with its membership record.
	pub metadata: NodeMetadata,
	/// Gossipsub heartbeat interval; also the cadence of CA re-announcement.
	pub heartbeat_interval: Duration,
}

/// A membership change, as delivered by [`GossipMember::watch`].
#[derive(Debug, Clone)]
pub enum GossipEvent {
	NodeJoin(Node),
	NodeLeave(Node),
}

enum Command {
	PublishRemoteState(Vec<u8>),
	Shutdown(oneshot::Sender<()>),
}

/// A handle to a running gossip membership task (spec §4.3 `Member`).
pub struct GossipMember {
	local_node: Node,
	nodes: Arc<DashMap<PeerId, Node>>,
	events_tx: broadcast::Sender<GossipEvent>,
	command_tx: mpsc::UnboundedSender<Command>,
	task: Option<JoinHandle<()>>,
}

impl GossipMember {
	/// Joins (or forms) a cluster.
	///
	/// If `seed_state` is `Some`, it is announced immediately as this node's
	/// remote state (used by the first node in a cluster to seed the CA
	/// bundle, spec §3). Otherwise this call blocks up to
	/// `remote_state_timeout` waiting for an existing peer to announce its
	/// remote state; if none arrives, the returned state is `None` and the
	/// caller is expected to treat itself as the bootstrap node (spec §4.3).
	pub async fn start(
		config: GossipConfig,
		seed_state: Option<Vec<u8>>,
		remote_state_timeout: Duration,
	) -> Result<(Self, Option<Vec<u8>>)> {
		let keypair = identity::Keypair::generate_ed25519();
		let local_peer_id = PeerId::from(keypair.public());
		let local_node = Node {
			name: local_peer_id.to_string(),
			address: local_addr_from_multiaddr(&config.listen_addr),
			metadata: config.metadata.clone(),
		};

		let behaviour = behaviour::build(&keypair)?;
		let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
			.with_tokio()
			.with_tcp(
				libp2p::tcp::Config::default(),
				libp2p::noise::Config::new,
				libp2p::yamux::Config::default,
			)
			.map_err(|e| Error::internal(format!("failed to configure tcp transport: {e}")))?
			.with_behaviour(|_| behaviour)
			.map_err(|e| Error::internal(format!("failed to attach behaviour: {e}")))?
			.build();

		swarm
			.listen_on(config.listen_addr.clone())
			.map_err(|e| Error::internal(format!("failed to listen on {}: {e}", config.listen_addr)))?;

		behaviour::subscribe(&mut swarm)?;

		for addr in &config.bootstrap_peers {
			if let Err(e) = swarm.dial(addr.clone()) {
				log::warn!("failed to dial bootstrap peer {addr}: {e}");
			}
		}

		let nodes = Arc::new(DashMap::new());
		let (events_tx, _) = broadcast::channel(256);
		let (command_tx, command_rx) = mpsc::unbounded_channel();

		let (remote_state_tx, remote_state_rx) = oneshot::channel();

		let task = tokio::spawn(run(
			swarm,
			local_node.clone(),
			nodes.clone(),
			events_tx.clone(),
			command_rx,
			config.heartbeat_interval,
			seed_state.clone(),
			remote_state_tx,
		));

		let remote_state = if seed_state.is_some() {
			None
		} else {
			match tokio::time::timeout(remote_state_timeout, remote_state_rx).await {
				Ok(Ok(state)) => Some(state),
				_ => None,
			}
		};

		Ok((
			GossipMember {
				local_node,
				nodes,
				events_tx,
				command_tx,
				task: Some(task),
			},
			remote_state,
		))
	}

	/// Announces new remote state (e.g. a freshly seeded CA bundle) to the
	/// cluster, so peers that join later converge on it.
	pub fn publish_remote_state(&self, state: Vec<u8>) -> Result<()> {
		self.command_tx
			.send(Command::PublishRemoteState(state))
			.map_err(|_| Error::unavailable("gossip task has already shut down"))
	}

	/// A stream of membership events, in observation order per remote node
	/// (spec §4.3 invariant). Duplicates are tolerated downstream.
	pub fn watch(&self) -> broadcast::Receiver<GossipEvent> {
		self.events_tx.subscribe()
	}

	pub fn local_node(&self) -> Node {
		self.local_node.clone()
	}

	pub fn nodes(&self) -> Vec<Node> {
		self.nodes.iter().map(|entry| entry.value().clone()).collect()
	}

	pub async fn shutdown(mut self) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		if self.command_tx.send(Command::Shutdown(tx)).is_ok() {
			let _ = rx.await;
		}
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
		Ok(())
	}
}

fn local_addr_from_multiaddr(addr: &Multiaddr) -> String {
	use libp2p::multiaddr::Protocol;
	for protocol in addr.iter() {
		match protocol {
			Protocol::Ip4(ip) => return ip.to_string(),
			Protocol::Ip6(ip) => return ip.to_string(),
			Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
				return name.to_string()
			}
			_ => continue,
		}
	}
	addr.to_string()
}

#[allow(clippy::too_many_arguments)]
async fn run(
	mut swarm: libp2p::Swarm<behaviour::Behaviour>,
	local_node: Node,
	nodes: Arc<DashMap<PeerId, Node>>,
	events_tx: broadcast::Sender<GossipEvent>,
	mut command_rx: mpsc::UnboundedReceiver<Command>,
	heartbeat_interval: Duration,
	mut pending_remote_state: Option<Vec<u8>>,
	remote_state_tx: oneshot::Sender<Vec<u8>>,
) {
	let mut heartbeat = tokio::time::interval(heartbeat_interval);
	let mut remote_state_tx = Some(remote_state_tx);
	let mut bootstrap = pending_remote_state.is_some();

	loop {
		tokio::select! {
			event = swarm.select_next_some() => {
				handle_swarm_event(event, &mut swarm, &local_node, &nodes, &events_tx, &mut remote_state_tx, &mut bootstrap);
			}
			_ = heartbeat.tick() => {
				behaviour::publish(&mut swarm, &WireMessage::Metadata {
					node: local_node.clone(),
				});
				if bootstrap {
					if let Some(state) = pending_remote_state.clone() {
						behaviour::publish(&mut swarm, &WireMessage::RemoteState { bytes: state });
					}
				}
			}
			cmd = command_rx.recv() => {
				match cmd {
					Some(Command::PublishRemoteState(state)) => {
						pending_remote_state = Some(state.clone());
						bootstrap = true;
						behaviour::publish(&mut swarm, &WireMessage::RemoteState { bytes: state });
					}
					Some(Command::Shutdown(ack)) => {
						let _ = ack.send(());
						break;
					}
					None => break,
				}
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
fn handle_swarm_event(
	event: SwarmEvent<behaviour::BehaviourEvent>,
	swarm: &mut libp2p::Swarm<behaviour::Behaviour>,
	local_node: &Node,
	nodes: &Arc<DashMap<PeerId, Node>>,
	events_tx: &broadcast::Sender<GossipEvent>,
	remote_state_tx: &mut Option<oneshot::Sender<Vec<u8>>>,
	bootstrap: &mut bool,
) {
	use behaviour::BehaviourEvent;

	match event {
		// mDNS only discovers a peer's address; it doesn't establish the
		// connection the rest of membership tracking rides on (spec §4.3).
		// `add_explicit_peer` keeps gossipsub meshed with it once connected,
		// and `dial` is what actually gets a connection open on a local
		// network with no configured bootstrap peers.
		SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
			for (peer_id, addr) in peers {
				log::debug!("gossip: mdns discovered peer [peer_id: {peer_id}] at {addr}");
				swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
				if let Err(e) = swarm.dial(addr.clone()) {
					log::debug!("gossip: mdns dial to {addr} failed: {e}");
				}
			}
		}
		SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
			for (peer_id, _addr) in peers {
				swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
			}
		}
		SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossip_event)) => {
			if let libp2p::gossipsub::Event::Message { message, .. } = gossip_event {
				match wire::decode(&message.data) {
					Ok(WireMessage::Metadata { node }) => {
						if node.name == local_node.name {
							return;
						}
						if let Ok(peer_id) = node.name.parse::<PeerId>() {
							let is_new = !nodes.contains_key(&peer_id);
							nodes.insert(peer_id, node.clone());
							if is_new {
								log::info!("gossip: node joined [name: {}]", node.name);
								let _ = events_tx.send(GossipEvent::NodeJoin(node));
							}
						}
					}
					Ok(WireMessage::RemoteState { bytes }) => {
						*bootstrap = false;
						if let Some(tx) = remote_state_tx.take() {
							let _ = tx.send(bytes);
						}
					}
					Err(e) => log::warn!("gossip: failed to decode message: {e}"),
				}
			}
		}
		SwarmEvent::Behaviour(BehaviourEvent::Identify(libp2p::identify::Event::Received {
			peer_id,
			..
		})) => {
			log::debug!("gossip: identified peer [peer_id: {peer_id}]");
		}
		SwarmEvent::ConnectionClosed { peer_id, .. } => {
			if let Some((_, node)) = nodes.remove(&peer_id) {
				log::info!("gossip: node left [name: {}]", node.name);
				let _ = events_tx.send(GossipEvent::NodeLeave(node));
			}
		}
		SwarmEvent::NewListenAddr { address, .. } => {
			log::info!("gossip: listening on {address}");
		}
		_ => {}
	}
}

use futures::StreamExt as _;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn local_addr_extracts_ip4() {
		let addr: Multiaddr = "/ip4/10.0.0.4/tcp/7946".parse().unwrap();
		assert_eq!(local_addr_from_multiaddr(&addr), "10.0.0.4");
	}

	#[tokio::test]
	async fn single_node_with_seed_state_becomes_bootstrap() {
		let config = GossipConfig {
			listen_addr: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
			bootstrap_peers: vec![],
			metadata: NodeMetadata {
				hostname: "solo".to_string(),
				service_port: 9010,
				cache_port: 9011,
			},
			heartbeat_interval: Duration::from_millis(50),
		};

		let (member, remote_state) = GossipMember::start(config, Some(b"ca-bundle".to_vec()), Duration::from_millis(200))
			.await
			.unwrap();
		assert!(remote_state.is_none());
		assert_eq!(member.local_node().metadata.hostname, "solo");
		member.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn single_node_without_peers_times_out_with_no_remote_state() {
		let config = GossipConfig {
			listen_addr: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
			bootstrap_peers: vec![],
			metadata: NodeMetadata {
				hostname: "lonely".to_string(),
				service_port: 9010,
				cache_port: 9011,
			},
			heartbeat_interval: Duration::from_millis(50),
		};

		let (member, remote_state) = GossipMember::start(config, None, Duration::from_millis(150))
			.await
			.unwrap();
		assert!(remote_state.is_none());
		member.shutdown().await.unwrap();
	}
}
