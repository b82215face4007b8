// SPDX-License-Identifier: Apache-2.0

//! Middleware wrapping the external registry's `Manifests` service (spec
//! §4.5 / §6 "Registry boundary (consumed)").
//!
//! The registry itself — blob store, manifest serialization, `/v2/...`
//! routing — is an external collaborator fixed only at its boundary here:
//! [`Manifests`] is that boundary. Everything in this crate sits *around* an
//! implementation of it, never inside one.

use async_trait::async_trait;
use beskar_cache::{ManifestCache, ManifestLoader};
use beskar_common::error::Result;
use std::sync::Arc;

/// The external registry's manifest service, as consumed by this middleware.
/// A real implementation lives outside this crate's scope (spec §1); tests
/// here use an in-memory stand-in.
#[async_trait]
pub trait Manifests: Send + Sync {
	async fn get(&self, repository: &str, digest: &str) -> Result<(String, Vec<u8>)>;
	async fn put(&self, repository: &str, mediatype: &str, payload: &[u8]) -> Result<String>;
	async fn delete(&self, repository: &str, digest: &str) -> Result<()>;
}

/// Invoked after the underlying registry operation has already committed
/// (spec §4.5): "downstream handler errors after a successful underlying
/// operation are logged and not surfaced."
#[async_trait]
pub trait ManifestEventHandler: Send + Sync {
	async fn put(&self, repository: &str, digest: &str, mediatype: &str, payload: &[u8]) -> Result<()>;
	async fn delete(&self, repository: &str, digest: &str, mediatype: &str, payload: &[u8]) -> Result<()>;
}

pub struct CacheLoader<M: Manifests> {
	inner: Arc<M>,
}

#[async_trait]
impl<M: Manifests> ManifestLoader for CacheLoader<M> {
	async fn load(&self, repository: &str, digest: &str) -> Result<(String, Vec<u8>)> {
		self.inner.get(repository, digest).await
	}
}

/// Wraps a [`Manifests`] implementation with cache population/invalidation
/// and downstream event dispatch (spec §4.5).
pub struct ManifestMiddleware<M: Manifests, H: ManifestEventHandler> {
	inner: Arc<M>,
	cache: Arc<ManifestCache<CacheLoader<M>>>,
	events: Arc<H>,
}

impl<M: Manifests + 'static, H: ManifestEventHandler> ManifestMiddleware<M, H> {
	pub fn new(inner: Arc<M>, cache: Arc<ManifestCache<CacheLoader<M>>>, events: Arc<H>) -> Self {
		ManifestMiddleware { inner, cache, events }
	}

	/// Consults the cache first; on miss, loads via the wrapped manifest
	/// service (spec §4.5 `Get`).
	pub async fn get(&self, repository: &str, digest: &str) -> Result<(String, Arc<Vec<u8>>)> {
		self.cache.get(repository, digest).await
	}

	/// Writes through the wrapped service; on success, caches the payload
	/// and fires `ManifestEventHandler.Put`, logging rather than surfacing
	/// any error from it (spec §4.5 `Put`).
	pub async fn put(&self, repository: &str, mediatype: &str, payload: &[u8]) -> Result<String> {
		let digest = self.inner.put(repository, mediatype, payload).await?;

		if let Err(err) = self.cache.put(repository, &digest, mediatype.to_string(), payload.to_vec()).await {
			log::warn!("registry: failed to populate cache after put {repository}@{digest}: {err}");
		}

		if let Err(err) = self.events.put(repository, &digest, mediatype, payload).await {
			log::error!("registry: event handler rejected put for {repository}@{digest}: {err}");
		}

		Ok(digest)
	}

	/// Resolves the current manifest (cached path), deletes through the
	/// wrapped service, invalidates the cache, then fires
	/// `ManifestEventHandler.Delete` (spec §4.5 `Delete`).
	pub async fn delete(&self, repository: &str, digest: &str) -> Result<()> {
		let (mediatype, payload) = self.cache.get(repository, digest).await?;

		self.inner.delete(repository, digest).await?;

		if let Err(err) = self.cache.delete(repository, digest).await {
			log::warn!("registry: failed to invalidate cache after delete {repository}@{digest}: {err}");
		}

		if let Err(err) = self.events.delete(repository, digest, &mediatype, &payload).await {
			log::error!("registry: event handler rejected delete for {repository}@{digest}: {err}");
		}

		Ok(())
	}
}

/// Builds a [`beskar_cache::ManifestCache`] whose loader is the wrapped
/// registry, as [`ManifestMiddleware::new`] requires.
pub fn cache_loader<M: Manifests>(inner: Arc<M>) -> CacheLoader<M> {
	CacheLoader { inner }
}

#[cfg(test)]
mod tests {
	use super::*;
	use beskar_cache::{CacheConfig, RemoteCacheClient};
	use beskar_common::error::Error;
	use beskar_hash::{HashEntry, NodeHash};
	use beskar_common::node::HostPort;
	use parking_lot::Mutex;
	use std::collections::HashMap;

	struct InMemoryRegistry {
		manifests: Mutex<HashMap<String, (String, String, Vec<u8>)>>,
		next_digest: Mutex<u64>,
	}

	impl InMemoryRegistry {
		fn new() -> Self {
			InMemoryRegistry {
				manifests: Mutex::new(HashMap::new()),
				next_digest: Mutex::new(0),
			}
		}
	}

	#[async_trait]
	impl Manifests for InMemoryRegistry {
		async fn get(&self, repository: &str, digest: &str) -> Result<(String, Vec<u8>)> {
			let key = format!("{repository}@{digest}");
			self.manifests
				.lock()
				.get(&key)
				.map(|(mt, _, payload)| (mt.clone(), payload.clone()))
				.ok_or_else(|| Error::not_found("no such manifest"))
		}

		async fn put(&self, repository: &str, mediatype: &str, payload: &[u8]) -> Result<String> {
			let mut counter = self.next_digest.lock();
			*counter += 1;
			let digest = format!("sha256:test{}", *counter);
			let key = format!("{repository}@{digest}");
			self.manifests
				.lock()
				.insert(key, (digest.clone(), mediatype.to_string(), payload.to_vec()));
			Ok(digest)
		}

		async fn delete(&self, repository: &str, digest: &str) -> Result<()> {
			let key = format!("{repository}@{digest}");
			self.manifests.lock().remove(&key);
			Ok(())
		}
	}

	struct RecordingEvents {
		puts: Mutex<Vec<String>>,
		deletes: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl ManifestEventHandler for RecordingEvents {
		async fn put(&self, repository: &str, digest: &str, _mediatype: &str, _payload: &[u8]) -> Result<()> {
			self.puts.lock().push(format!("{repository}@{digest}"));
			Ok(())
		}

		async fn delete(&self, repository: &str, digest: &str, _mediatype: &str, _payload: &[u8]) -> Result<()> {
			self.deletes.lock().push(format!("{repository}@{digest}"));
			Ok(())
		}
	}

	fn solo_ring() -> Arc<NodeHash> {
		let ring = NodeHash::new();
		ring.add(HashEntry {
			hostname: "solo".to_string(),
			hostport: HostPort {
				host: "solo".to_string(),
				port: 9011,
			},
		});
		Arc::new(ring)
	}

	fn middleware() -> ManifestMiddleware<InMemoryRegistry, RecordingEvents> {
		let inner = Arc::new(InMemoryRegistry::new());
		let cache = Arc::new(ManifestCache::new(
			cache_loader(inner.clone()),
			"solo".to_string(),
			solo_ring(),
			RemoteCacheClient::new_insecure_for_test(),
			CacheConfig::default(),
		));
		let events = Arc::new(RecordingEvents {
			puts: Mutex::new(Vec::new()),
			deletes: Mutex::new(Vec::new()),
		});
		ManifestMiddleware::new(inner, cache, events)
	}

	#[tokio::test]
	async fn put_populates_cache_and_fires_event() {
		let mw = middleware();
		let digest = mw.put("artifacts/yum/epel", "application/json", b"hello").await.unwrap();

		let (mediatype, payload) = mw.get("artifacts/yum/epel", &digest).await.unwrap();
		assert_eq!(mediatype, "application/json");
		assert_eq!(payload.as_ref(), b"hello");
		assert_eq!(mw.events.puts.lock().len(), 1);
	}

	#[tokio::test]
	async fn delete_invalidates_cache_and_fires_event() {
		let mw = middleware();
		let digest = mw.put("artifacts/yum/epel", "application/json", b"hello").await.unwrap();
		mw.get("artifacts/yum/epel", &digest).await.unwrap();

		mw.delete("artifacts/yum/epel", &digest).await.unwrap();

		let err = mw.get("artifacts/yum/epel", &digest).await.unwrap_err();
		assert_eq!(err.kind(), beskar_common::error::ErrorKind::NotFound);
		assert_eq!(mw.events.deletes.lock().len(), 1);
	}
}
