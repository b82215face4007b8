// SPDX-License-Identifier: Apache-2.0

//! The plugin descriptor fetched from a node's `/info` endpoint (spec §3
//! "Plugin descriptor", §6 "GET /info").

use serde::{Deserialize, Serialize};

/// `Info{name, version, prefix, mediatypes[], router}` (spec §6). The
/// `router` field, if present, is opaque data interpreted by whatever
/// [`crate::route::RoutePolicy`] the plugin kind supplies — this crate
/// only transports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
	pub name: String,
	pub version: semver::Version,
	pub prefix: String,
	pub mediatypes: Vec<String>,
	pub router_policy: Option<serde_json::Value>,
}

impl PluginInfo {
	pub fn encode(&self) -> Vec<u8> {
		bincode::serialize(self).expect("PluginInfo always encodes")
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
		bincode::deserialize(bytes)
	}

	pub fn consumes(&self, mediatype: &str) -> bool {
		self.mediatypes.iter().any(|m| m == mediatype)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn info_round_trips_and_matches_mediatype() {
		let info = PluginInfo {
			name: "yum".to_string(),
			version: semver::Version::new(1, 2, 0),
			prefix: "/artifacts/yum".to_string(),
			mediatypes: vec!["application/vnd.beskar.yum.repo+json".to_string()],
			router_policy: None,
		};
		let decoded = PluginInfo::decode(&info.encode()).unwrap();
		assert!(decoded.consumes("application/vnd.beskar.yum.repo+json"));
		assert!(!decoded.consumes("application/vnd.beskar.ostree+json"));
	}
}
