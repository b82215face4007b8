// SPDX-License-Identifier: Apache-2.0

//! A single plugin's per-node runtime object (spec §4.7 `Plugin`):
//! `ServeHTTP` routing/reverse-proxy, and `sendEvent` dispatch to the owning
//! node's `/event` endpoint.

use crate::descriptor::PluginInfo;
use crate::route::{RouteDecision, RoutePolicy, RouteRequest};
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use beskar_common::error::{Error, Result};
use beskar_common::event::EventPayload;
use beskar_hash::NodeHash;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff with jitter, capped at `max_interval`, giving up once
/// the running total exceeds `max_elapsed` (spec §7: "all intra-cluster
/// HTTPS calls use exponential backoff (max elapsed 5s, max interval 500
/// ms)."). Grounded on the teacher's linear-backoff-with-jitter loop in
/// `PluginExecutor::start_plugin`, generalized to exponential growth and an
/// elapsed-time cap instead of an attempt-count cap.
pub(crate) struct Backoff {
	max_elapsed: Duration,
	max_interval: Duration,
	base_interval: Duration,
}

impl Backoff {
	pub fn new(max_elapsed: Duration, max_interval: Duration, base_interval: Duration) -> Self {
		Backoff {
			max_elapsed,
			max_interval,
			base_interval,
		}
	}

	pub async fn retry<F, Fut, T>(&self, mut attempt: F) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T>>,
	{
		let start = tokio::time::Instant::now();
		let mut interval = self.base_interval;
		let mut last_err = None;

		loop {
			match attempt().await {
				Ok(value) => return Ok(value),
				Err(err) => {
					last_err = Some(err);
					if start.elapsed() >= self.max_elapsed {
						break;
					}
					let jitter: f64 = rand::rng().random_range(0.5..1.5);
					let sleep_for = interval.mul_f64(jitter).min(self.max_interval);
					sleep(sleep_for).await;
					interval = (interval * 2).min(self.max_interval);
				}
			}
		}

		Err(last_err.unwrap_or_else(|| Error::unavailable("backoff exhausted with no recorded error")))
	}
}

/// A live plugin registration on this node.
pub struct Plugin {
	descriptor: RwLock<PluginInfo>,
	routing: RwLock<Arc<dyn RoutePolicy>>,
	hash: NodeHash,
	http: reqwest::Client,
}

impl Plugin {
	pub fn new(descriptor: PluginInfo, routing: Arc<dyn RoutePolicy>, http: reqwest::Client) -> Self {
		Plugin {
			descriptor: RwLock::new(descriptor),
			routing: RwLock::new(routing),
			hash: NodeHash::new(),
			http,
		}
	}

	pub fn descriptor(&self) -> PluginInfo {
		self.descriptor.read().clone()
	}

	/// Replaces the descriptor and routing policy if `candidate`'s version
	/// is strictly greater (spec §4.6: "if incoming version is strictly
	/// greater, replace descriptor and routing policy").
	pub fn maybe_upgrade(&self, candidate: PluginInfo, routing: Arc<dyn RoutePolicy>) -> bool {
		let mut current = self.descriptor.write();
		if candidate.version > current.version {
			*current = candidate;
			*self.routing.write() = routing;
			true
		} else {
			false
		}
	}

	pub fn hash(&self) -> &NodeHash {
		&self.hash
	}

	/// `ServeHTTP` (spec §4.7 steps 1-3).
	pub async fn serve_http(&self, method: &Method, uri: &Uri, remote_addr: &str, headers: HeaderMap, body: Bytes) -> Response {
		let request = RouteRequest {
			method: method.as_str(),
			path: uri.path(),
			remote_addr,
		};
		let decision = self.routing.read().decide(&request);

		let route_key = match decision {
			RouteDecision::NotFound => return StatusCode::NOT_FOUND.into_response(),
			RouteDecision::Redirect(url) => {
				return (StatusCode::MOVED_PERMANENTLY, [(axum::http::header::LOCATION, url)]).into_response()
			}
			RouteDecision::Repository(repo) => repo,
			RouteDecision::RemoteAddr => remote_addr.to_string(),
		};

		let Some(owner) = self.hash.get(&route_key) else {
			return StatusCode::BAD_GATEWAY.into_response();
		};

		let target = owner.hostport.as_https_url(&format!("{}{}", uri.path(), uri.query().map(|q| format!("?{q}")).unwrap_or_default()));

		self.reverse_proxy(method.clone(), target, headers, body).await
	}

	async fn reverse_proxy(&self, method: Method, target: String, headers: HeaderMap, body: Bytes) -> Response {
		let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
		let mut builder = self.http.request(reqwest_method, &target).body(body.to_vec());
		for (name, value) in headers.iter() {
			if name == axum::http::header::HOST {
				continue;
			}
			builder = builder.header(name.as_str(), value.as_bytes());
		}

		match builder.send().await {
			Ok(resp) => {
				let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
				let mut out = axum::http::HeaderMap::new();
				for (name, value) in resp.headers().iter() {
					if let (Ok(n), Ok(v)) = (
						axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
						axum::http::HeaderValue::from_bytes(value.as_bytes()),
					) {
						out.insert(n, v);
					}
				}
				let bytes = resp.bytes().await.unwrap_or_default();
				(status, out, bytes).into_response()
			}
			Err(err) => {
				log::warn!("plugin: reverse proxy to {target} failed: {err}");
				StatusCode::BAD_GATEWAY.into_response()
			}
		}
	}

	/// `sendEvent` (spec §4.7): POST the encoded event to `/event` on the
	/// given node, falling back to the repository's rendezvous-hashed owner.
	pub async fn send_event(&self, event: &EventPayload, node: Option<&beskar_hash::HashEntry>) -> Result<()> {
		let target = match node {
			Some(entry) => entry.clone(),
			None => self
				.hash
				.get(&event.repository)
				.ok_or_else(|| Error::unavailable("no node owns this repository's event stream"))?,
		};

		let url = target.hostport.as_https_url("/event");
		let backoff = Backoff::new(Duration::from_secs(5), Duration::from_millis(500), Duration::from_millis(50));
		let body = event.encode();

		backoff
			.retry(|| {
				let url = url.clone();
				let body = body.clone();
				async move {
					let resp = self
						.http
						.post(&url)
						.header(axum::http::header::CONTENT_TYPE, "application/octet-stream")
						.body(body)
						.send()
						.await
						.map_err(|e| Error::unavailable(format!("event post to {url} failed: {e}")))?;

					if resp.status().is_success() {
						Ok(())
					} else {
						Err(Error::unavailable(format!("event post to {url} returned {}", resp.status())))
					}
				}
			})
			.await
	}
}
