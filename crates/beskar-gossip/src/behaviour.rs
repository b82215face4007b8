// SPDX-License-Identifier: Apache-2.0

//! The libp2p `NetworkBehaviour` combining gossipsub (membership broadcast),
//! mDNS (local-network peer discovery), and identify (peer metadata
//! exchange on connect).

use crate::wire::WireMessage;
use beskar_common::error::{Error, Result};
use libp2p::{gossipsub, identify, identity, mdns, swarm::NetworkBehaviour};

const MEMBERSHIP_TOPIC: &str = "beskar/membership/v1";
const PROTOCOL_VERSION: &str = "/beskar/gossip/1.0.0";

#[derive(NetworkBehaviour)]
pub struct Behaviour {
	pub gossipsub: gossipsub::Behaviour,
	pub mdns: mdns::tokio::Behaviour,
	pub identify: identify::Behaviour,
}

pub fn build(keypair: &identity::Keypair) -> Result<Behaviour> {
	let gossipsub_config = gossipsub::ConfigBuilder::default()
		.heartbeat_interval(std::time::Duration::from_secs(1))
		.validation_mode(gossipsub::ValidationMode::Strict)
		.build()
		.map_err(|e| Error::internal(format!("invalid gossipsub config: {e}")))?;

	let gossipsub = gossipsub::Behaviour::new(
		gossipsub::MessageAuthenticity::Signed(keypair.clone()),
		gossipsub_config,
	)
	.map_err(|e| Error::internal(format!("failed to build gossipsub behaviour: {e}")))?;

	let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), keypair.public().to_peer_id())
		.map_err(|e| Error::internal(format!("failed to build mdns behaviour: {e}")))?;

	let identify = identify::Behaviour::new(identify::Config::new(
		PROTOCOL_VERSION.to_string(),
		keypair.public(),
	));

	Ok(Behaviour { gossipsub, mdns, identify })
}

pub fn subscribe(swarm: &mut libp2p::Swarm<Behaviour>) -> Result<()> {
	let topic = gossipsub::IdentTopic::new(MEMBERSHIP_TOPIC);
	swarm
		.behaviour_mut()
		.gossipsub
		.subscribe(&topic)
		.map_err(|e| Error::internal(format!("failed to subscribe to membership topic: {e}")))?;
	Ok(())
}

/// Best-effort publish: a `Duplicate`/`InsufficientPeers` error from
/// gossipsub just means nobody was listening this tick, which is expected
/// during single-node bootstrap and logged at debug rather than surfaced.
pub fn publish(swarm: &mut libp2p::Swarm<Behaviour>, message: &WireMessage) {
	let topic = gossipsub::IdentTopic::new(MEMBERSHIP_TOPIC);
	let bytes = crate::wire::encode(message);
	if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, bytes) {
		log::debug!("gossip: publish skipped: {e}");
	}
}
