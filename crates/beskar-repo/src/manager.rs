// SPDX-License-Identifier: Apache-2.0

//! The per-plugin `repository -> RepoHandler` map (spec §4.8).
//!
//! Grounded on `hipcheck/src/engine/mod.rs`'s lazily-populated query cache
//! (a `DashMap` guarding creation so concurrent callers of the same key
//! share one computation), generalized from "compute once, cache forever"
//! to "create once, `Start` once, and let callers race safely on the
//! in-flight creation".

use crate::handler::{OciOperations, RemoveCallback, RepoHandler, SyncRunner};
use async_trait::async_trait;
use beskar_common::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Builds a fresh, not-yet-started [`RepoHandler`] for a repository name
/// the manager hasn't seen before (spec §4.8 "lazy-creates a handler via a
/// plugin-supplied factory"). Supplied by the plugin kind — it knows how to
/// open that repository's databases and which [`SyncRunner`] to wire up.
#[async_trait]
pub trait RepoHandlerFactory<R: SyncRunner + 'static>: Send + Sync {
	async fn create(&self, repository: &str, on_remove: RemoveCallback) -> Result<Arc<RepoHandler<R>>>;
}

enum Slot<R: SyncRunner + 'static> {
	/// Another caller is currently constructing and starting the handler;
	/// late callers clone this receiver and wait on it instead of racing the
	/// factory. A `watch` channel (rather than `Notify::notify_waiters`)
	/// retains its last value, so a caller that hasn't parked yet when the
	/// creator finishes still observes completion instead of missing it.
	Creating(watch::Receiver<bool>),
	Ready(Arc<RepoHandler<R>>),
}

impl<R: SyncRunner + 'static> Clone for Slot<R> {
	fn clone(&self) -> Self {
		match self {
			Slot::Creating(n) => Slot::Creating(n.clone()),
			Slot::Ready(h) => Slot::Ready(h.clone()),
		}
	}
}

/// Per-plugin map from repository name to its live [`RepoHandler`] (spec
/// §4.8).
pub struct RepositoryManager<R: SyncRunner + 'static> {
	handlers: DashMap<String, Slot<R>>,
	factory: Arc<dyn RepoHandlerFactory<R>>,
}

impl<R: SyncRunner + 'static> RepositoryManager<R> {
	pub fn new(factory: Arc<dyn RepoHandlerFactory<R>>) -> Arc<Self> {
		Arc::new(RepositoryManager {
			handlers: DashMap::new(),
			factory,
		})
	}

	/// `Get(ctx, repository)` (spec §4.8): lazy-creates via the factory,
	/// calls `Start`, and inserts it. Concurrent `Get` with the same key
	/// returns the same instance and blocks late callers until `Start`
	/// returns.
	///
	/// Late callers clone a `watch::Receiver` out of the shard guard and
	/// drop the guard before awaiting it: the guard must not be held across
	/// the wait (DashMap's shard lock would deadlock any other access to this
	/// key for the whole wait), and a plain `Notify::notify_waiters` would
	/// lose the wakeup entirely if the creator finishes in the gap between
	/// the guard being dropped and the wait starting — `watch` retains the
	/// last value so a late-arriving waiter still observes it.
	pub async fn get(self: &Arc<Self>, repository: &str) -> Result<Arc<RepoHandler<R>>> {
		enum Action<R: SyncRunner + 'static> {
			Return(Arc<RepoHandler<R>>),
			Wait(watch::Receiver<bool>),
			Create(watch::Sender<bool>),
		}

		loop {
			let action = match self.handlers.entry(repository.to_string()) {
				Entry::Occupied(occupied) => match occupied.get().clone() {
					Slot::Ready(handler) => Action::Return(handler),
					Slot::Creating(rx) => Action::Wait(rx),
				},
				Entry::Vacant(vacant) => {
					let (tx, rx) = watch::channel(false);
					vacant.insert(Slot::Creating(rx));
					Action::Create(tx)
				}
			};

			match action {
				Action::Return(handler) => return Ok(handler),
				Action::Create(done_tx) => return self.create_and_insert(repository, done_tx).await,
				Action::Wait(mut rx) => {
					// the creator finished (successfully or not) once this
					// resolves; loop to observe the final map state rather than
					// assuming it's ready.
					let _ = rx.wait_for(|done| *done).await;
				}
			}
		}
	}

	async fn create_and_insert(self: &Arc<Self>, repository: &str, done_tx: watch::Sender<bool>) -> Result<Arc<RepoHandler<R>>> {
		let manager = self.clone();
		let repository_owned = repository.to_string();
		let on_remove: RemoveCallback = Arc::new(move |repo: &str| {
			manager.handlers.remove(repo);
		});

		let result = async {
			let handler = self.factory.create(repository, on_remove).await?;
			handler.start().await?;
			Ok(handler)
		}
		.await;

		match &result {
			Ok(handler) => {
				self.handlers.insert(repository_owned, Slot::Ready(handler.clone()));
			}
			Err(_) => {
				// leave no placeholder behind; a retried `Get` should try
				// creation again rather than observe a permanently failed slot.
				self.handlers.remove(&repository_owned);
			}
		}
		let _ = done_tx.send(true);
		result
	}

	/// Returns the handler for `repository` if one is already live, without
	/// creating it.
	pub fn peek(&self, repository: &str) -> Option<Arc<RepoHandler<R>>> {
		match self.handlers.get(repository)?.clone() {
			Slot::Ready(handler) => Some(handler),
			Slot::Creating(_) => None,
		}
	}

	/// Removes a handler's entry directly; used by idle eviction in
	/// addition to the handler's own cleanup-triggered removal.
	pub async fn evict_if_idle(&self, repository: &str) -> Result<()> {
		let Some(handler) = self.peek(repository) else {
			return Ok(());
		};
		if handler.started() {
			return Err(Error::failed_precondition("repository handler is still active"));
		}
		handler.stop().await;
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handler::SyncBarrier;
	use beskar_common::error::Result as BkResult;
	use beskar_db::{InMemoryBlobStore, RepoDatabases};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	struct NoopRunner;

	#[async_trait]
	impl SyncRunner for NoopRunner {
		async fn run_sync(&self, _repository: &str, _barrier: Arc<dyn SyncBarrier>, _dbs: Arc<RepoDatabases>) -> BkResult<()> {
			Ok(())
		}
	}

	struct NoopOci;

	#[async_trait]
	impl OciOperations for NoopOci {
		async fn delete_manifest(&self, _reference: &str) -> BkResult<()> {
			Ok(())
		}

		async fn manifest_digest(&self, _tag_reference: &str) -> BkResult<String> {
			Ok("sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string())
		}

		async fn download_blob(&self, _reference: &str, _dst: &mut (dyn tokio::io::AsyncWrite + Send + Unpin)) -> BkResult<()> {
			Ok(())
		}
	}

	struct CountingFactory {
		dir: tempfile::TempDir,
		creations: AtomicUsize,
	}

	#[async_trait]
	impl RepoHandlerFactory<NoopRunner> for CountingFactory {
		async fn create(&self, repository: &str, on_remove: RemoveCallback) -> BkResult<Arc<RepoHandler<NoopRunner>>> {
			self.creations.fetch_add(1, Ordering::SeqCst);
			// simulate a slow factory so concurrent `get` calls actually race.
			tokio::time::sleep(std::time::Duration::from_millis(30)).await;
			let dbs = Arc::new(RepoDatabases::new(
				self.dir.path().join(repository),
				repository,
				Arc::new(InMemoryBlobStore::new()),
			));
			Ok(RepoHandler::new(repository.to_string(), false, dbs, Arc::new(NoopRunner), Arc::new(NoopOci), on_remove))
		}
	}

	fn factory() -> Arc<CountingFactory> {
		Arc::new(CountingFactory {
			dir: tempfile::tempdir().unwrap(),
			creations: AtomicUsize::new(0),
		})
	}

	#[tokio::test]
	async fn concurrent_get_for_same_repository_creates_once() {
		let factory = factory();
		let manager = RepositoryManager::new(factory.clone());

		let (a, b) = tokio::join!(manager.get("artifacts/yum/epel"), manager.get("artifacts/yum/epel"));
		let a = a.unwrap();
		let b = b.unwrap();

		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(factory.creations.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn many_staggered_late_getters_all_resolve_without_hanging() {
		// Regression test for the lost-wakeup window: a late `get()` caller
		// can observe the `Creating` slot and start waiting at any point
		// relative to the creator finishing and signalling completion.
		// `watch`'s retained-last-value semantics (unlike
		// `Notify::notify_waiters`, which wakes only already-registered
		// waiters) guarantee every one of these resolves regardless of when
		// it starts waiting relative to the creator finishing.
		let factory = factory();
		let manager = RepositoryManager::new(factory.clone());

		let mut tasks = Vec::new();
		for i in 0..50u64 {
			let manager = manager.clone();
			tasks.push(tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(i)).await;
				manager.get("artifacts/yum/epel").await
			}));
		}

		let results = tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(tasks))
			.await
			.expect("some getters hung waiting on a missed completion signal");

		let first = results[0].as_ref().unwrap().as_ref().unwrap().clone();
		for result in &results {
			let handler = result.as_ref().unwrap().as_ref().unwrap();
			assert!(Arc::ptr_eq(&first, handler));
		}
		assert_eq!(factory.creations.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn distinct_repositories_get_distinct_handlers() {
		let factory = factory();
		let manager = RepositoryManager::new(factory.clone());

		let a = manager.get("artifacts/yum/epel").await.unwrap();
		let b = manager.get("artifacts/yum/fedora").await.unwrap();

		assert!(!Arc::ptr_eq(&a, &b));
		assert_eq!(factory.creations.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn handler_cleanup_removes_itself_from_the_manager() {
		let factory = factory();
		let manager = RepositoryManager::new(factory.clone());

		let handler = manager.get("artifacts/yum/epel").await.unwrap();
		assert_eq!(manager.len(), 1);

		handler.stop().await;
		assert_eq!(manager.len(), 0);

		// a subsequent get re-creates it.
		manager.get("artifacts/yum/epel").await.unwrap();
		assert_eq!(factory.creations.load(Ordering::SeqCst), 2);
	}
}
