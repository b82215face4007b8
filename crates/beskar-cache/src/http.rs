// SPDX-License-Identifier: Apache-2.0

//! The peer-facing side of the manifest cache: an axum router serving GET /
//! PUT / DELETE for a key this node owns, and a client that speaks to that
//! router on another node's cache port over mTLS (spec §6 "Cache peers").

use crate::{CacheSink, ManifestCache, ManifestLoader};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use beskar_common::error::{Error, Result};
use beskar_common::node::HostPort;
use std::sync::Arc;

/// A client for the cache peer protocol, built from an mTLS-configured
/// `reqwest::Client` (spec §4.2: all inter-node traffic is mutually
/// authenticated).
#[derive(Clone)]
pub struct RemoteCacheClient {
	http: reqwest::Client,
}

impl RemoteCacheClient {
	/// Builds a client that presents `tls_config` for every connection it
	/// makes — the preconfigured `rustls::ClientConfig` produced by
	/// `beskar_mtls::client_tls_config`.
	pub fn new(tls_config: rustls::ClientConfig) -> Result<Self> {
		let http = reqwest::Client::builder()
			.use_preconfigured_tls(tls_config)
			.build()
			.map_err(|e| Error::internal(format!("failed to build mTLS cache client: {e}")))?;
		Ok(RemoteCacheClient { http })
	}

	/// A client with no TLS configured at all, for tests that exercise only
	/// the local-ownership path and never actually dial a peer.
	#[doc(hidden)]
	pub fn new_insecure_for_test() -> Self {
		RemoteCacheClient {
			http: reqwest::Client::new(),
		}
	}

	pub async fn get(&self, owner: &HostPort, repository: &str, digest: &str) -> Result<(String, Arc<Vec<u8>>)> {
		let url = owner.as_https_url(&format!("/cache/{digest}/{repository}"));
		let resp = self
			.http
			.get(&url)
			.send()
			.await
			.map_err(|e| Error::unavailable(format!("cache peer {owner} unreachable: {e}")))?;

		if resp.status() == StatusCode::NOT_FOUND {
			return Err(Error::not_found(format!("manifest unknown revision: {repository}@{digest}")));
		}
		if !resp.status().is_success() {
			return Err(Error::internal(format!("cache peer {owner} returned {}", resp.status())));
		}

		let mediatype = resp
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("application/octet-stream")
			.to_string();
		let payload = resp
			.bytes()
			.await
			.map_err(|e| Error::internal(format!("failed to read cache peer response body: {e}")))?;

		Ok((mediatype, Arc::new(payload.to_vec())))
	}

	pub async fn put(
		&self,
		owner: &HostPort,
		repository: &str,
		digest: &str,
		mediatype: String,
		payload: &[u8],
	) -> Result<()> {
		let url = owner.as_https_url(&format!("/cache/{digest}/{repository}"));
		let resp = self
			.http
			.put(&url)
			.header(header::CONTENT_TYPE, mediatype)
			.body(payload.to_vec())
			.send()
			.await
			.map_err(|e| Error::unavailable(format!("cache peer {owner} unreachable: {e}")))?;

		if !resp.status().is_success() {
			return Err(Error::internal(format!("cache peer {owner} rejected put: {}", resp.status())));
		}
		Ok(())
	}

	pub async fn delete(&self, owner: &HostPort, repository: &str, digest: &str) -> Result<()> {
		let url = owner.as_https_url(&format!("/cache/{digest}/{repository}"));
		let resp = self
			.http
			.delete(&url)
			.send()
			.await
			.map_err(|e| Error::unavailable(format!("cache peer {owner} unreachable: {e}")))?;

		if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
			return Err(Error::internal(format!("cache peer {owner} rejected delete: {}", resp.status())));
		}
		Ok(())
	}
}

async fn get_handler<L: ManifestLoader + 'static>(
	State(cache): State<Arc<ManifestCache<L>>>,
	Path((digest, repository)): Path<(String, String)>,
) -> Response {
	match cache.peek_local(&repository, &digest) {
		Some((mediatype, payload)) => {
			let body = Bytes::from(payload.as_ref().clone());
			([(header::CONTENT_TYPE, mediatype)], body).into_response()
		}
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

async fn put_handler<L: ManifestLoader + 'static>(
	State(cache): State<Arc<ManifestCache<L>>>,
	Path((digest, repository)): Path<(String, String)>,
	headers: axum::http::HeaderMap,
	body: Bytes,
) -> StatusCode {
	let mediatype = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("application/octet-stream")
		.to_string();
	let sink = CacheSink::Bytes(body.to_vec());
	let payload = match sink {
		CacheSink::Bytes(b) => b,
		CacheSink::Manifest { payload, .. } => payload,
	};
	cache.insert_from_peer(&repository, &digest, mediatype, payload);
	StatusCode::NO_CONTENT
}

async fn delete_handler<L: ManifestLoader + 'static>(
	State(cache): State<Arc<ManifestCache<L>>>,
	Path((digest, repository)): Path<(String, String)>,
) -> StatusCode {
	cache.remove_local(&repository, &digest);
	StatusCode::NO_CONTENT
}

/// Builds the axum router a node mounts on its cache port to serve peers
/// (spec §4.4: "a peer that owns a key serves it to other nodes over this
/// port").
pub fn router<L: ManifestLoader + 'static>(cache: Arc<ManifestCache<L>>) -> Router {
	Router::new()
		.route("/cache/:digest/*repository", get(get_handler::<L>).put(put_handler::<L>).delete(delete_handler::<L>))
		.with_state(cache)
}
