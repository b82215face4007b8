// SPDX-License-Identifier: Apache-2.0

//! The generic mirror sync engine (spec §4.11): plan, bounded-concurrency
//! execute, and post-sync hook, wired into [`crate::handler::RepoHandler`]
//! as a [`crate::handler::SyncRunner`].
//!
//! Grounded on `hipcheck/src/plugin/manager.rs`'s bounded-concurrency,
//! retrying push pattern (there: pushing plugin-start requests through a
//! semaphore with backoff; here: pushing downloaded artifacts through the
//! same shape) and on spec §4.11's four-step shape (plan, execute add,
//! execute delete, post-sync).

use crate::handler::SyncBarrier;
use async_trait::async_trait;
use beskar_common::error::{Error, Result};
use beskar_db::RepoDatabases;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One upstream artifact discovered during planning (spec §4.11 step 1
/// "enumerate remote artifacts").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
	pub name: String,
	pub url: String,
	pub size: Option<u64>,
}

/// Enumerates the upstream mirror's current artifact set. Implemented per
/// plugin kind: an HTTP directory listing for a generic mirror, a parsed
/// `repomd.xml`/primary.xml for yum, an rsync file list for OSTree (spec
/// §4.11 step 1: "HTTP listing or rsync file list").
#[async_trait]
pub trait MirrorSource: Send + Sync {
	async fn list_remote(&self) -> Result<Vec<RemoteArtifact>>;
}

/// Moves bytes between the upstream mirror, the local filesystem, and the
/// registry as an OCI artifact (spec §4.11 step 2-3: "stream download to a
/// temp file", "push as an OCI artifact", "resolve manifest by tag, delete
/// by digest"). This is the only place the sync engine talks to the
/// registry's actual push/delete surface, kept behind a trait since the OCI
/// data path itself is out of this workspace's scope (spec §1).
#[async_trait]
pub trait ArtifactTransport: Send + Sync {
	async fn download(&self, artifact: &RemoteArtifact, dest: &Path) -> Result<()>;
	/// Pushes the downloaded file as an OCI artifact, returning the
	/// manifest digest the registry assigned it.
	async fn push(&self, name: &str, path: &Path) -> Result<String>;
	/// Resolves `name` to its current manifest and deletes it, returning
	/// the digest that was removed.
	async fn delete(&self, name: &str) -> Result<String>;
}

/// Optional post-sync step: regenerate and push derived repository
/// metadata (spec §4.11 step 4), e.g. a yum plugin's `repomd.xml`.
#[async_trait]
pub trait PostSyncHook: Send + Sync {
	async fn run(&self) -> Result<()>;
}

/// The default post-sync hook: no derived metadata to regenerate (a plain
/// mirror repository has none).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPostSync;

#[async_trait]
impl PostSyncHook for NoopPostSync {
	async fn run(&self) -> Result<()> {
		Ok(())
	}
}

/// Tuning knobs the spec leaves per plugin kind (spec §9 open question:
/// "the sync engine's worker-pool size is per plugin kind (10 or 100 in
/// different call sites)").
#[derive(Debug, Clone)]
pub struct MirrorSyncConfig {
	/// Bounded worker pool size (spec §4.11 step 2: "default 10-100
	/// workers").
	pub workers: usize,
	/// Per-artifact push retry count (spec §4.11 step 2: "retry-up-to-3").
	pub push_retries: usize,
	/// Constant backoff between push retries (spec §7: "5s constant
	/// backoff").
	pub push_retry_backoff: Duration,
	/// How long to wait on the per-artifact barrier before giving up on a
	/// single artifact (distinct from the overall sync; a barrier timeout
	/// fails only that artifact, not the whole sync).
	pub barrier_timeout: Duration,
}

impl Default for MirrorSyncConfig {
	fn default() -> Self {
		MirrorSyncConfig {
			workers: 10,
			push_retries: 3,
			push_retry_backoff: Duration::from_secs(5),
			barrier_timeout: Duration::from_secs(60),
		}
	}
}

/// The generic mirror sync engine (spec §4.11), parameterized over how a
/// plugin kind lists its upstream and moves artifacts. Implements
/// [`crate::handler::SyncRunner`], so a [`crate::handler::RepoHandler`]
/// treats it as an opaque "run a sync" callback.
pub struct MirrorSyncEngine<S: MirrorSource, T: ArtifactTransport, P: PostSyncHook = NoopPostSync> {
	source: S,
	transport: T,
	post_sync: P,
	config: MirrorSyncConfig,
}

impl<S: MirrorSource, T: ArtifactTransport> MirrorSyncEngine<S, T, NoopPostSync> {
	pub fn new(source: S, transport: T, config: MirrorSyncConfig) -> Self {
		MirrorSyncEngine {
			source,
			transport,
			post_sync: NoopPostSync,
			config,
		}
	}
}

impl<S: MirrorSource, T: ArtifactTransport, P: PostSyncHook> MirrorSyncEngine<S, T, P> {
	pub fn with_post_sync(source: S, transport: T, post_sync: P, config: MirrorSyncConfig) -> Self {
		MirrorSyncEngine {
			source,
			transport,
			post_sync,
			config,
		}
	}

	/// Step 1: diff remote against local, producing disjoint add/delete
	/// sets (spec §4.11 step 1).
	async fn plan(&self, dbs: &RepoDatabases) -> Result<(Vec<RemoteArtifact>, Vec<String>)> {
		let remote = self.source.list_remote().await?;
		let local = dbs.list_artifacts().await?;

		let remote_names: HashSet<&str> = remote.iter().map(|a| a.name.as_str()).collect();
		let local_names: HashSet<String> = local.into_iter().map(|a| a.name).collect();

		let to_add: Vec<RemoteArtifact> = remote.into_iter().filter(|a| !local_names.contains(&a.name)).collect();
		let to_delete: Vec<String> = local_names.into_iter().filter(|name| !remote_names.contains(name.as_str())).collect();

		Ok((to_add, to_delete))
	}

	/// Step 2: bounded-concurrency download+push, each guarded by the
	/// per-artifact sync barrier (spec §4.11 step 2).
	async fn push_one(&self, artifact: &RemoteArtifact, downloads_dir: &Path, barrier: &dyn SyncBarrier, dbs: &RepoDatabases) -> Result<()> {
		let dest = downloads_dir.join(sanitize_filename(&artifact.name));
		self.transport.download(artifact, &dest).await?;

		let mut attempt = 0usize;
		let digest = loop {
			attempt += 1;
			match self.transport.push(&artifact.name, &dest).await {
				Ok(digest) => break digest,
				Err(err) if attempt < self.config.push_retries => {
					log::warn!("sync: push of {} failed (attempt {attempt}/{}): {err}", artifact.name, self.config.push_retries);
					tokio::time::sleep(self.config.push_retry_backoff).await;
				}
				Err(err) => {
					let _ = tokio::fs::remove_file(&dest).await;
					return Err(err);
				}
			}
		};
		let _ = tokio::fs::remove_file(&dest).await;

		// arm the barrier before recording, so a digest that's already been
		// processed by the time the record lands still gets observed on the
		// next `queue_event` (spec §4.11 step 2: "on push, the per-artifact
		// barrier ... is used so that the manifest event ... can mark the
		// artifact processed before the sync worker proceeds").
		barrier.register_artifact_alias(&digest, &artifact.name);

		let pushed_at = now_unix_secs();
		dbs.record_artifact(&artifact.name, &digest, artifact.size.unwrap_or(0), pushed_at).await?;

		barrier.wait_artifact(&artifact.name, self.config.barrier_timeout).await
	}

	/// Step 3: resolve-and-delete, also guarded by the barrier.
	async fn delete_one(&self, name: &str, barrier: &dyn SyncBarrier, dbs: &RepoDatabases) -> Result<()> {
		let digest = self.transport.delete(name).await?;
		barrier.register_artifact_alias(&digest, name);
		dbs.remove_artifact(name).await?;
		barrier.wait_artifact(name, self.config.barrier_timeout).await
	}

	async fn log_failure(&self, dbs: &RepoDatabases, name: &str, err: &Error) {
		log::warn!("sync: {name} failed: {err}");
		if let Err(log_err) = dbs.append_log("error", &format!("sync failed for {name}: {err}")).await {
			log::error!("sync: failed to record failure for {name} in log db: {log_err}");
		}
	}
}

fn sanitize_filename(name: &str) -> String {
	name.rsplit('/').next().unwrap_or(name).to_string()
}

fn now_unix_secs() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}

#[async_trait]
impl<S: MirrorSource, T: ArtifactTransport, P: PostSyncHook> crate::handler::SyncRunner for MirrorSyncEngine<S, T, P> {
	/// The full sync (spec §4.11): plan, execute add, execute delete,
	/// post-sync, then persist the outcome to the status DB (spec §4.11
	/// "Post-sync" and §7 "Sync failures are recorded in the sync status
	/// record").
	///
	/// A sync that fails partway leaves the repository in a consistent
	/// state (spec §4.11 "a partial failure yields a strict subset of the
	/// target state"): `record_artifact`/`remove_artifact` are only called
	/// after the corresponding push/delete has already succeeded.
	async fn run_sync(&self, repository: &str, barrier: Arc<dyn SyncBarrier>, dbs: Arc<RepoDatabases>) -> Result<()> {
		let (to_add, to_delete) = self.plan(&dbs).await?;
		let total = to_add.len() as u64;

		let downloads_dir = dbs.downloads_dir();
		tokio::fs::create_dir_all(&downloads_dir).await?;

		let workers = self.config.workers.max(1);
		let push_results: Vec<std::result::Result<(), (String, Error)>> = stream::iter(to_add.into_iter().map(|artifact| {
			let barrier = barrier.clone();
			let dbs = dbs.clone();
			let downloads_dir = downloads_dir.clone();
			async move {
				self.push_one(&artifact, &downloads_dir, &*barrier, &dbs)
					.await
					.map_err(|err| (artifact.name.clone(), err))
			}
		}))
		.buffer_unordered(workers)
		.collect()
		.await;

		let mut synced: u64 = 0;
		let mut failures: Vec<String> = Vec::new();
		for result in push_results {
			match result {
				Ok(()) => synced += 1,
				Err((name, err)) => {
					self.log_failure(&dbs, &name, &err).await;
					failures.push(format!("{name}: {err}"));
				}
			}
		}

		for name in to_delete {
			if let Err(err) = self.delete_one(&name, &*barrier, &dbs).await {
				self.log_failure(&dbs, &name, &err).await;
				failures.push(format!("{name}: {err}"));
			}
		}

		if let Err(err) = self.post_sync.run().await {
			log::warn!("sync: post-sync hook failed for {repository}: {err}");
			failures.push(format!("post-sync: {err}"));
		}

		let error_message = if failures.is_empty() { None } else { Some(failures.join("; ")) };
		dbs.status.set_sync_status(synced, total, error_message.as_deref()).await?;

		match error_message {
			None => Ok(()),
			Some(msg) => Err(Error::internal(format!("sync for {repository} completed with failures: {msg}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use beskar_db::InMemoryBlobStore;
	use parking_lot::Mutex;
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FixedSource {
		artifacts: Vec<RemoteArtifact>,
	}

	#[async_trait]
	impl MirrorSource for FixedSource {
		async fn list_remote(&self) -> Result<Vec<RemoteArtifact>> {
			Ok(self.artifacts.clone())
		}
	}

	struct RecordingBarrier {
		aliases: Mutex<HashMap<String, String>>,
		waited: Mutex<Vec<String>>,
	}

	impl RecordingBarrier {
		fn new() -> Self {
			RecordingBarrier {
				aliases: Mutex::new(HashMap::new()),
				waited: Mutex::new(Vec::new()),
			}
		}
	}

	impl SyncBarrier for RecordingBarrier {
		fn register_artifact_alias(&self, digest: &str, name: &str) {
			self.aliases.lock().insert(digest.to_string(), name.to_string());
		}

		fn wait_artifact<'a>(&'a self, name: &'a str, _timeout: Duration) -> futures::future::BoxFuture<'a, Result<()>> {
			Box::pin(async move {
				self.waited.lock().push(name.to_string());
				Ok(())
			})
		}
	}

	struct InMemoryTransport {
		next_digest: AtomicUsize,
		fail_names: Vec<String>,
		pushed: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl ArtifactTransport for InMemoryTransport {
		async fn download(&self, _artifact: &RemoteArtifact, dest: &Path) -> Result<()> {
			tokio::fs::write(dest, b"payload").await?;
			Ok(())
		}

		async fn push(&self, name: &str, _path: &Path) -> Result<String> {
			if self.fail_names.iter().any(|n| n == name) {
				return Err(Error::internal(format!("simulated push failure for {name}")));
			}
			let n = self.next_digest.fetch_add(1, Ordering::SeqCst);
			self.pushed.lock().push(name.to_string());
			Ok(format!("sha256:push{n}"))
		}

		async fn delete(&self, name: &str) -> Result<String> {
			Ok(format!("sha256:deleted-{name}"))
		}
	}

	fn dbs(dir: &std::path::Path) -> Arc<RepoDatabases> {
		Arc::new(RepoDatabases::new(dir.to_path_buf(), "artifacts/mirror/test", Arc::new(InMemoryBlobStore::new())))
	}

	fn artifact(name: &str) -> RemoteArtifact {
		RemoteArtifact {
			name: name.to_string(),
			url: format!("http://upstream.example/{name}"),
			size: Some(10),
		}
	}

	#[tokio::test]
	async fn syncs_all_remote_artifacts_and_records_them() {
		let dir = tempfile::tempdir().unwrap();
		let dbs = dbs(dir.path());
		let source = FixedSource {
			artifacts: vec![artifact("a.rpm"), artifact("b.rpm"), artifact("c.rpm")],
		};
		let transport = InMemoryTransport {
			next_digest: AtomicUsize::new(0),
			fail_names: vec![],
			pushed: Mutex::new(Vec::new()),
		};
		let engine = MirrorSyncEngine::new(source, transport, MirrorSyncConfig::default());
		let barrier: Arc<dyn SyncBarrier> = Arc::new(RecordingBarrier::new());

		let result = crate::handler::SyncRunner::run_sync(&engine, "artifacts/mirror/test", barrier, dbs.clone()).await;
		assert!(result.is_ok());

		let artifacts = dbs.list_artifacts().await.unwrap();
		assert_eq!(artifacts.len(), 3);

		let status = dbs.status.sync_status().await.unwrap().unwrap();
		assert_eq!(status, (3, 3, None));
	}

	#[tokio::test]
	async fn removes_artifacts_no_longer_present_upstream() {
		let dir = tempfile::tempdir().unwrap();
		let dbs = dbs(dir.path());
		dbs.record_artifact("stale.rpm", "sha256:old", 5, 0).await.unwrap();

		let source = FixedSource { artifacts: vec![] };
		let transport = InMemoryTransport {
			next_digest: AtomicUsize::new(0),
			fail_names: vec![],
			pushed: Mutex::new(Vec::new()),
		};
		let engine = MirrorSyncEngine::new(source, transport, MirrorSyncConfig::default());
		let barrier: Arc<dyn SyncBarrier> = Arc::new(RecordingBarrier::new());

		crate::handler::SyncRunner::run_sync(&engine, "artifacts/mirror/test", barrier, dbs.clone())
			.await
			.unwrap();

		assert!(dbs.list_artifacts().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn partial_push_failure_leaves_only_successes_recorded_and_surfaces_error() {
		let dir = tempfile::tempdir().unwrap();
		let dbs = dbs(dir.path());
		let source = FixedSource {
			artifacts: vec![artifact("good.rpm"), artifact("bad.rpm")],
		};
		let transport = InMemoryTransport {
			next_digest: AtomicUsize::new(0),
			fail_names: vec!["bad.rpm".to_string()],
			pushed: Mutex::new(Vec::new()),
		};
		let config = MirrorSyncConfig {
			push_retries: 1,
			push_retry_backoff: Duration::from_millis(1),
			..MirrorSyncConfig::default()
		};
		let engine = MirrorSyncEngine::new(source, transport, config);
		let barrier: Arc<dyn SyncBarrier> = Arc::new(RecordingBarrier::new());

		let result = crate::handler::SyncRunner::run_sync(&engine, "artifacts/mirror/test", barrier, dbs.clone()).await;
		assert!(result.is_err());

		let artifacts = dbs.list_artifacts().await.unwrap();
		assert_eq!(artifacts.len(), 1);
		assert_eq!(artifacts[0].name, "good.rpm");

		let status = dbs.status.sync_status().await.unwrap().unwrap();
		assert_eq!((status.0, status.1), (1, 2));
		assert!(status.2.unwrap().contains("bad.rpm"));
	}
}
