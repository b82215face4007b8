// SPDX-License-Identifier: Apache-2.0

//! Singleton per-node registry of [`Plugin`]s, driven by gossip join/leave
//! events (spec §4.6).

use crate::descriptor::PluginInfo;
use crate::plugin::{Backoff, Plugin};
use crate::route::PrefixTable;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use beskar_common::error::{Error, Result};
use beskar_common::node::Node;
use beskar_hash::HashEntry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fetches and registers the plugin descriptor for a newly joined node, and
/// adds/removes nodes from each plugin's [`beskar_hash::NodeHash`] (spec
/// §4.6).
pub struct PluginManager {
	plugins: DashMap<String, Arc<Plugin>>,
	http: reqwest::Client,
	info_backoff: Backoff,
}

impl PluginManager {
	pub fn new(http: reqwest::Client) -> Self {
		PluginManager {
			plugins: DashMap::new(),
			http,
			// spec §4.6: "exponential backoff, max-elapsed 5s" for the /info fetch.
			info_backoff: Backoff::new(Duration::from_secs(5), Duration::from_millis(500), Duration::from_millis(50)),
		}
	}

	/// Handles a gossip `NodeJoin`: fetch `/info`, register or upgrade the
	/// plugin, and add this node to its hash ring (spec §4.6 steps 1-4).
	pub async fn on_join(&self, node: &Node) -> Result<()> {
		let hostport = node.service_hostport();
		let url = hostport.as_https_url("/info");
		let http = self.http.clone();

		let info: PluginInfo = self
			.info_backoff
			.retry(|| {
				let url = url.clone();
				let http = http.clone();
				async move {
					let resp = http
						.get(&url)
						.send()
						.await
						.map_err(|e| Error::unavailable(format!("/info fetch from {url} failed: {e}")))?;
					if !resp.status().is_success() {
						return Err(Error::unavailable(format!("/info fetch from {url} returned {}", resp.status())));
					}
					let bytes = resp
						.bytes()
						.await
						.map_err(|e| Error::internal(format!("failed to read /info body: {e}")))?;
					PluginInfo::decode(&bytes).map_err(|e| Error::internal(format!("malformed /info payload: {e}")))
				}
			})
			.await?;

		let entry = HashEntry {
			hostname: node.metadata.hostname.clone(),
			hostport: node.service_hostport(),
		};

		match self.plugins.entry(info.name.clone()) {
			dashmap::mapref::entry::Entry::Vacant(slot) => {
				log::info!("plugin manager: registering new plugin '{}' from {hostport}", info.name);
				let routing = Arc::new(PrefixTable::new(vec![crate::route::PrefixRule {
					prefix: info.prefix.clone(),
					segments: 1,
				}]));
				let plugin = Arc::new(Plugin::new(info, routing, self.http.clone()));
				plugin.hash().add(entry);
				slot.insert(plugin);
			}
			dashmap::mapref::entry::Entry::Occupied(slot) => {
				let plugin = slot.get().clone();
				let routing = Arc::new(PrefixTable::new(vec![crate::route::PrefixRule {
					prefix: info.prefix.clone(),
					segments: 1,
				}]));
				if plugin.maybe_upgrade(info, routing) {
					log::info!("plugin manager: upgraded plugin descriptor from {hostport}");
				}
				plugin.hash().add(entry);
			}
		}

		Ok(())
	}

	/// Handles a gossip `NodeLeave`: remove the node from every plugin's
	/// hash ring. The plugin record itself survives — other peers may still
	/// serve it (spec §4.6).
	pub fn on_leave(&self, node: &Node) {
		for plugin in self.plugins.iter() {
			plugin.hash().remove(&node.metadata.hostname);
		}
	}

	/// `getPlugin(mediatype)` (spec §4.6): used by the registry middleware to
	/// route events.
	pub fn get_plugin_for_mediatype(&self, mediatype: &str) -> Option<Arc<Plugin>> {
		self.plugins
			.iter()
			.find(|entry| entry.value().descriptor().consumes(mediatype))
			.map(|entry| entry.value().clone())
	}

	pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
		self.plugins.get(name).map(|entry| entry.value().clone())
	}

	/// The `/artifacts/{plugin}/...` direct REST surface (spec §4.6 "HTTP
	/// routing").
	pub fn router(self: Arc<Self>) -> Router {
		Router::new().route("/artifacts/:plugin/*rest", any(artifacts_handler)).with_state(self)
	}
}

async fn artifacts_handler(
	State(manager): State<Arc<PluginManager>>,
	Path((plugin_name, _rest)): Path<(String, String)>,
	method: Method,
	uri: Uri,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let Some(plugin) = manager.get_plugin(&plugin_name) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let remote_addr = headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("unknown")
		.to_string();

	plugin.serve_http(&method, &uri, &remote_addr, headers, body).await
}
