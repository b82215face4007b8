// SPDX-License-Identifier: Apache-2.0

//! The compact binary record carried on the membership gossipsub topic
//! (spec §6 "Gossip: ... node metadata is a compact binary record.").

use beskar_common::node::Node;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
	/// A node announcing (or re-announcing) its membership metadata.
	Metadata { node: Node },
	/// The cluster's shared remote state — in practice, the CA bundle PEM
	/// pair, bincode-encoded by the caller before being wrapped here (spec
	/// §3 "CA bundle").
	RemoteState { bytes: Vec<u8> },
}

pub fn encode(message: &WireMessage) -> Vec<u8> {
	bincode::serialize(message).expect("WireMessage always encodes")
}

pub fn decode(bytes: &[u8]) -> Result<WireMessage, bincode::Error> {
	bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use beskar_common::node::NodeMetadata;

	#[test]
	fn metadata_message_round_trips() {
		let msg = WireMessage::Metadata {
			node: Node {
				name: "peer-id-string".to_string(),
				address: "10.0.0.9".to_string(),
				metadata: NodeMetadata {
					hostname: "node-c".to_string(),
					service_port: 9010,
					cache_port: 9011,
				},
			},
		};
		let encoded = encode(&msg);
		let decoded = decode(&encoded).unwrap();
		match decoded {
			WireMessage::Metadata { node } => assert_eq!(node.metadata.hostname, "node-c"),
			_ => panic!("wrong variant"),
		}
	}
}
