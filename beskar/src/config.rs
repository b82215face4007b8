// SPDX-License-Identifier: Apache-2.0

//! The node's TOML configuration file (SPEC_FULL.md §C).
//!
//! Deliberately thin: spec §1 places "configuration file parsing" out of
//! this workspace's scope as an external collaborator's concern, so this
//! struct only carries the handful of fields `main` needs to construct the
//! core types from spec §4 — it does not grow into a layered config system
//! (env overrides, multiple sources, hot reload).

use beskar_common::error::{Error, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

fn default_heartbeat_ms() -> u64 {
	1_000
}

fn default_remote_state_timeout_ms() -> u64 {
	5_000
}

fn default_ca_validity_days() -> i64 {
	3_650
}

fn default_leaf_validity_hours() -> i64 {
	24
}

/// `beskar serve --config <path>`'s TOML schema.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
	/// The stable hostname this node hashes under (spec §3 "Node"
	/// "hostname").
	pub hostname: String,
	/// Advertised address other nodes dial.
	pub advertise_addr: IpAddr,
	/// libp2p multiaddr to listen for gossip on, e.g.
	/// `/ip4/0.0.0.0/tcp/7946`.
	pub gossip_listen: String,
	/// Multiaddrs of peers to dial on startup. Empty means "form a new
	/// cluster if nobody answers" (spec §4.3).
	#[serde(default)]
	pub bootstrap_peers: Vec<String>,
	/// Plugin HTTP service port (spec §3 "Node" "service port").
	pub service_port: u16,
	/// Peer manifest-cache HTTP port (spec §3 "Node" "cache port").
	pub cache_port: u16,
	/// Root directory for this node's on-disk state.
	pub data_dir: PathBuf,
	/// If true, this node seeds a brand-new cluster's CA rather than
	/// waiting to receive one over gossip (spec §4.3 "the node becomes the
	/// bootstrap node").
	#[serde(default)]
	pub seed_new_cluster: bool,
	/// Path to an htpasswd-style file of `user:$2y$...` entries (spec §6
	/// "Auth configuration").
	#[serde(default)]
	pub htpasswd_path: Option<PathBuf>,
	/// Bcrypt hashes of hostnames this node trusts unconditionally once
	/// mTLS has verified the peer certificate (spec §6, §4.12).
	#[serde(default)]
	pub trusted_peer_hashes: Vec<String>,
	#[serde(default = "default_heartbeat_ms")]
	pub gossip_heartbeat_ms: u64,
	#[serde(default = "default_remote_state_timeout_ms")]
	pub remote_state_timeout_ms: u64,
	#[serde(default = "default_ca_validity_days")]
	pub ca_validity_days: i64,
	#[serde(default = "default_leaf_validity_hours")]
	pub leaf_validity_hours: i64,
}

impl NodeConfig {
	pub fn load(path: &std::path::Path) -> Result<Self> {
		let contents = std::fs::read_to_string(path)
			.map_err(|e| Error::invalid_argument(format!("failed to read config file {path:?}: {e}")))?;
		let config: NodeConfig = toml::from_str(&contents)
			.map_err(|e| Error::invalid_argument(format!("failed to parse config file {path:?}: {e}")))?;
		Ok(config)
	}
}
