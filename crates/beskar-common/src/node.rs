// SPDX-License-Identifier: Apache-2.0

//! Cluster node identity (spec §3 "Node").

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata a node publishes alongside its gossip membership record (spec
/// §4.3): the stable hostname used for rendezvous hashing, plus the two
/// ports other nodes dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
	/// The stable key used for hashing (spec §3 Node "hostname").
	pub hostname: String,
	/// Plugin HTTP service port.
	pub service_port: u16,
	/// Peer manifest-cache HTTP port.
	pub cache_port: u16,
}

impl NodeMetadata {
	pub fn encode(&self) -> Vec<u8> {
		// infallible: the type has no non-serializable fields.
		bincode::serialize(self).expect("NodeMetadata always encodes")
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
		bincode::deserialize(bytes)
	}
}

/// A live cluster node: gossip-assigned name, advertised address, and the
/// metadata it published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
	/// Gossip-assigned unique name — the membership identity.
	pub name: String,
	/// Advertised address (IP or resolvable hostname), no port.
	pub address: String,
	pub metadata: NodeMetadata,
}

impl Node {
	/// `(address, service_port)`, the unique key spec §3 requires: "(address,
	/// service port) is unique within a cluster at any instant."
	pub fn service_hostport(&self) -> HostPort {
		HostPort {
			host: self.address.clone(),
			port: self.metadata.service_port,
		}
	}

	pub fn cache_hostport(&self) -> HostPort {
		HostPort {
			host: self.address.clone(),
			port: self.metadata.cache_port,
		}
	}
}

/// A `host:port` pair, used wherever the spec says "hostport" (§4.1, §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
	pub host: String,
	pub port: u16,
}

impl fmt::Display for HostPort {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl HostPort {
	pub fn as_https_url(&self, path: &str) -> String {
		format!("https://{}{}", self, path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn node_metadata_round_trips() {
		let meta = NodeMetadata {
			hostname: "node-a".to_string(),
			service_port: 9010,
			cache_port: 9011,
		};
		let encoded = meta.encode();
		let decoded = NodeMetadata::decode(&encoded).unwrap();
		assert_eq!(meta, decoded);
	}

	#[test]
	fn hostport_formats_as_host_colon_port() {
		let hp = HostPort {
			host: "10.0.0.5".to_string(),
			port: 443,
		};
		assert_eq!(hp.to_string(), "10.0.0.5:443");
		assert_eq!(hp.as_https_url("/info"), "https://10.0.0.5:443/info");
	}
}
