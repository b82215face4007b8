// SPDX-License-Identifier: Apache-2.0

//! The generic `RepoHandler` skeleton (spec §4.9): event queue, state
//! machine, sync-artifact barrier, and lifecycle.
//!
//! Grounded on the actor-loop shape already used for cluster membership in
//! `beskar_gossip`'s `run()` — a single task owning all mutable state,
//! driven by `tokio::select!` over a handful of channels — generalized here
//! from "one task per node" to "one task per repository handler" (spec
//! §4.9: "exactly one processing goroutine per handler").

use async_trait::async_trait;
use beskar_common::error::{Error, Result};
use beskar_common::event::{Action, Event, EventPayload};
use beskar_common::repository::HandlerState;
use beskar_db::RepoDatabases;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The registry's OCI surface, narrowed to what a plugin body needs through
/// its handler (spec §4.9: "thin wrappers over the registry's OCI operations
/// for use by plugin bodies"). A concrete implementation is supplied by the
/// plugin kind, the same way [`SyncRunner`] is — the registry itself is an
/// external collaborator (spec §1) this crate only ever calls through a
/// trait object.
#[async_trait]
pub trait OciOperations: Send + Sync {
	async fn delete_manifest(&self, reference: &str) -> Result<()>;
	async fn manifest_digest(&self, tag_reference: &str) -> Result<String>;
	async fn download_blob(&self, reference: &str, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;
}

/// The sync-barrier operations a sync engine needs from the handler that
/// owns it (spec §4.9 `SyncArtifact`/`register_artifact_alias`), narrowed to
/// an object-safe trait so [`SyncRunner`] implementations don't need to
/// depend on `RepoHandler<R>`'s own type parameter `R` — avoiding a cyclic
/// generic between the handler and the engine it runs (spec §9's cyclic
/// ownership guidance, applied one level down from
/// `RepositoryManager`/`RepoHandler`).
pub trait SyncBarrier: Send + Sync {
	/// Registers which artifact name a not-yet-processed digest corresponds
	/// to (spec §4.11 step 2, called immediately after a successful push).
	fn register_artifact_alias(&self, digest: &str, name: &str);

	/// `SyncArtifact(ctx, name, timeout)`, boxed for object-safety.
	fn wait_artifact<'a>(&'a self, name: &'a str, timeout: Duration) -> futures::future::BoxFuture<'a, Result<()>>;
}

/// Runs a mirror sync for a repository (spec §4.11). A concrete instance is
/// provided by the plugin-specific sync engine configuration; this crate's
/// generic handler only knows how to arm and await it.
#[async_trait]
pub trait SyncRunner: Send + Sync {
	async fn run_sync(&self, repository: &str, barrier: Arc<dyn SyncBarrier>, dbs: Arc<RepoDatabases>) -> Result<()>;
}

struct QueuedEvent {
	seq: Option<u64>,
	payload: EventPayload,
}

/// Called when the handler finishes cleanup, so the owning
/// [`crate::manager::RepositoryManager`] can drop it from its map. The
/// handler holds only this callback, not a back-pointer to the manager
/// (spec §9: "break cyclic ownership ... by having the handler hold only a
/// remove callback").
pub type RemoveCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The generic per-repository handler (spec §4.9).
pub struct RepoHandler<R: SyncRunner> {
	repository: String,
	mirror: AtomicBool,
	state: SyncMutex<HandlerState>,
	dbs: Arc<RepoDatabases>,
	runner: Arc<R>,
	oci: Arc<dyn OciOperations>,
	queue_tx: mpsc::UnboundedSender<QueuedEvent>,
	queue_rx: SyncMutex<Option<mpsc::UnboundedReceiver<QueuedEvent>>>,
	sync_tx: mpsc::Sender<oneshot::Sender<Result<()>>>,
	sync_rx: SyncMutex<Option<mpsc::Receiver<oneshot::Sender<Result<()>>>>>,
	barriers: DashMap<String, Vec<oneshot::Sender<Result<()>>>>,
	/// digest -> artifact name, so the main loop can resolve which barrier a
	/// processed manifest event satisfies.
	aliases: DashMap<String, String>,
	cancel: CancellationToken,
	task: SyncMutex<Option<JoinHandle<()>>>,
	on_remove: RemoveCallback,
}

impl<R: SyncRunner + 'static> RepoHandler<R> {
	pub fn new(
		repository: String,
		mirror: bool,
		dbs: Arc<RepoDatabases>,
		runner: Arc<R>,
		oci: Arc<dyn OciOperations>,
		on_remove: RemoveCallback,
	) -> Arc<Self> {
		let (queue_tx, queue_rx) = mpsc::unbounded_channel();
		// spec §5: "the sync channel has capacity 1 so concurrent sync requests
		// are either coalesced ... or the caller optionally waits".
		let (sync_tx, sync_rx) = mpsc::channel(1);

		Arc::new(RepoHandler {
			repository,
			mirror: AtomicBool::new(mirror),
			state: SyncMutex::new(HandlerState::Stopped),
			dbs,
			runner,
			oci,
			queue_tx,
			queue_rx: SyncMutex::new(Some(queue_rx)),
			sync_tx,
			sync_rx: SyncMutex::new(Some(sync_rx)),
			barriers: DashMap::new(),
			aliases: DashMap::new(),
			cancel: CancellationToken::new(),
			task: SyncMutex::new(None),
			on_remove,
		})
	}

	pub fn repository(&self) -> &str {
		&self.repository
	}

	pub fn state(&self) -> HandlerState {
		*self.state.lock()
	}

	pub fn started(&self) -> bool {
		self.state() != HandlerState::Stopped
	}

	pub fn stopped(&self) -> bool {
		self.state() == HandlerState::Stopped
	}

	/// `setState`: only `Ready <-> X`; `Deleting` is sticky and returns
	/// `AlreadyExists` for further requests (spec §4.9).
	fn transition(&self, target: HandlerState) -> Result<()> {
		let mut state = self.state.lock();
		if *state == HandlerState::Deleting && target != HandlerState::Stopped {
			return Err(Error::already_exists("repository handler is being deleted"));
		}
		if !state.can_transition_to(target) {
			return Err(Error::unavailable(format!("cannot transition handler from {state} to {target}")));
		}
		*state = target;
		Ok(())
	}

	/// Drains persisted events, spawns the main loop, transitions to `Ready`
	/// (spec §4.9 `Start`).
	pub async fn start(self: &Arc<Self>) -> Result<()> {
		self.transition(HandlerState::Ready).map_err(|_| {
			Error::unavailable("handler already started")
		})?;

		let pending = self.dbs.status.load_pending_events().await?;
		let last_index = pending.last().map(|e| e.seq);
		for event in pending {
			let _ = self.queue_tx.send(QueuedEvent {
				seq: Some(event.seq),
				payload: event.payload,
			});
		}

		let queue_rx = self.queue_rx.lock().take().expect("start called once");
		let sync_rx = self.sync_rx.lock().take().expect("start called once");
		let handler = self.clone();
		let handle = tokio::spawn(async move { handler.run(queue_rx, sync_rx, last_index).await });
		*self.task.lock() = Some(handle);

		Ok(())
	}

	/// Cancels the main loop and waits for cleanup to finish.
	pub async fn stop(self: &Arc<Self>) {
		self.cancel.cancel();
		let handle = self.task.lock().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}

	/// `QueueEvent(event, persist)` (spec §4.9). Manual uploads are refused
	/// on mirror repositories unless a sync is currently running.
	pub async fn queue_event(&self, payload: EventPayload, persist: bool) -> Result<()> {
		if self.mirror.load(Ordering::SeqCst) && self.state() != HandlerState::Syncing {
			return Err(Error::failed_precondition("manual uploads are refused on a mirror repository outside an active sync"));
		}

		let seq = if persist {
			Some(self.dbs.status.append_event(&payload).await?)
		} else {
			None
		};

		self.queue_tx
			.send(QueuedEvent { seq, payload })
			.map_err(|_| Error::unavailable("handler event queue is closed"))
	}

	/// Registers which artifact name a not-yet-processed digest corresponds
	/// to, so the main loop can resolve the barrier once the matching event
	/// is processed. Called by the sync engine immediately after a
	/// successful push (spec §4.11 step 2).
	pub fn register_artifact_alias(&self, digest: &str, name: &str) {
		self.aliases.insert(digest.to_string(), name.to_string());
	}

	/// `SyncArtifact(ctx, name, timeout)` (spec §4.9): blocks until the
	/// barrier fires or `timeout` elapses.
	pub async fn sync_artifact(&self, name: &str, timeout: Duration) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		self.barriers.entry(name.to_string()).or_default().push(tx);

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(Error::unavailable("sync barrier sender dropped")),
			Err(_) => Err(Error::unavailable(format!("sync barrier '{name}' timed out after {timeout:?}"))),
		}
	}

	/// `SyncArtifactReset()` (spec §4.9): forcibly fails all outstanding
	/// barriers.
	pub fn sync_artifact_reset(&self) {
		for mut entry in self.barriers.iter_mut() {
			for tx in entry.value_mut().drain(..) {
				let _ = tx.send(Err(Error::unavailable("sync barrier reset")));
			}
		}
		self.barriers.clear();
	}

	fn fire_barrier(&self, name: &str, result: Result<()>) {
		if let Some((_, mut senders)) = self.barriers.remove(name) {
			let mut remaining = result;
			for tx in senders.drain(..) {
				let to_send = match &remaining {
					Ok(()) => Ok(()),
					Err(e) => Err(Error::new(e.kind(), e.to_string())),
				};
				let _ = tx.send(to_send);
			}
			let _ = &mut remaining;
		}
	}

	/// `DeleteManifest(ref)` (spec §4.9): thin wrapper over the registry's OCI
	/// delete, for use by plugin bodies.
	pub async fn delete_manifest(&self, reference: &str) -> Result<()> {
		self.oci.delete_manifest(reference).await
	}

	/// `GetManifestDigest(tagRef)` (spec §4.9).
	pub async fn get_manifest_digest(&self, tag_reference: &str) -> Result<String> {
		self.oci.manifest_digest(tag_reference).await
	}

	/// `DownloadBlob(ref, dst)` (spec §4.9).
	pub async fn download_blob(&self, reference: &str, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
		self.oci.download_blob(reference, dst).await
	}

	/// `SyncRepository` request (spec §4.9, §5: capacity-1 sync channel).
	/// Non-blocking: a sync already running coalesces into `AlreadyExists`.
	pub fn start_sync(&self) -> Result<oneshot::Receiver<Result<()>>> {
		let (tx, rx) = oneshot::channel();
		self.sync_tx
			.try_send(tx)
			.map_err(|_| Error::already_exists("a sync is already running for this repository"))?;
		Ok(rx)
	}

	async fn run(
		self: Arc<Self>,
		mut queue_rx: mpsc::UnboundedReceiver<QueuedEvent>,
		mut sync_rx: mpsc::Receiver<oneshot::Sender<Result<()>>>,
		mut last_index: Option<u64>,
	) {
		let mut sync_waiter: Option<(oneshot::Sender<Result<()>>, JoinHandle<Result<()>>)> = None;

		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,

				Some(waiter) = sync_rx.recv(), if sync_waiter.is_none() => {
					let _ = self.transition(HandlerState::Syncing);
					let this = self.clone();
					let barrier: Arc<dyn SyncBarrier> = this.clone();
					let dbs = this.dbs.clone();
					let handle = tokio::spawn(async move { this.runner.run_sync(&this.repository, barrier, dbs).await });
					sync_waiter = Some((waiter, handle));
				}

				Some(event) = queue_rx.recv() => {
					self.process_event(event, &mut last_index).await;
				}

				else => {
					if sync_waiter.is_none() {
						break;
					}
				}
			}

			if let Some((waiter, handle)) = sync_waiter.take() {
				if handle.is_finished() {
					let result = handle.await.unwrap_or_else(|e| Err(Error::internal(format!("sync task panicked: {e}"))));
					let _ = self.transition(HandlerState::Ready);
					if result.is_err() {
						self.sync_artifact_reset();
					}
					let _ = waiter.send(result);
				} else {
					sync_waiter = Some((waiter, handle));
				}
			}
		}

		self.cleanup().await;
	}

	async fn process_event(&self, event: QueuedEvent, last_index: &mut Option<u64>) {
		let QueuedEvent { seq, payload } = event;

		if let Some(name) = self.aliases.remove(&payload.digest).map(|(_, name)| name) {
			self.fire_barrier(&name, Ok(()));
		}

		if let Some(seq) = seq {
			if let Err(err) = self.dbs.status.remove_event(seq).await {
				log::error!("repo {}: failed to remove processed event {seq}: {err}", self.repository);
			}
			if Some(seq) == *last_index && self.mirror.load(Ordering::SeqCst) {
				if let Ok(waiter) = self.start_sync() {
					// resumption after restart (spec §4.9): arm automatically, no caller to answer.
					drop(waiter);
				}
				*last_index = None;
			}
		}

		log::debug!(
			"repo {}: processed {:?} for {}@{}",
			self.repository,
			action_label(payload.action),
			payload.repository,
			payload.digest
		);
	}

	async fn cleanup(&self) {
		self.sync_artifact_reset();
		let deleting = self.state() == HandlerState::Deleting;
		if deleting {
			if let Err(err) = self.dbs.remove_local() {
				log::error!("repo {}: failed to remove local databases during cleanup: {err}", self.repository);
			}
		}
		let _ = self.transition(HandlerState::Stopped);
		(self.on_remove)(&self.repository);
	}
}

fn action_label(action: Action) -> &'static str {
	action.as_str()
}

impl<R: SyncRunner + 'static> SyncBarrier for RepoHandler<R> {
	fn register_artifact_alias(&self, digest: &str, name: &str) {
		RepoHandler::register_artifact_alias(self, digest, name)
	}

	fn wait_artifact<'a>(&'a self, name: &'a str, timeout: Duration) -> futures::future::BoxFuture<'a, Result<()>> {
		Box::pin(self.sync_artifact(name, timeout))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use beskar_db::InMemoryBlobStore;
	use std::sync::atomic::AtomicUsize;

	struct NoopRunner;

	#[async_trait]
	impl SyncRunner for NoopRunner {
		async fn run_sync(&self, _repository: &str, _barrier: Arc<dyn SyncBarrier>, _dbs: Arc<RepoDatabases>) -> Result<()> {
			Ok(())
		}
	}

	struct NoopOci;

	#[async_trait]
	impl OciOperations for NoopOci {
		async fn delete_manifest(&self, _reference: &str) -> Result<()> {
			Ok(())
		}

		async fn manifest_digest(&self, _tag_reference: &str) -> Result<String> {
			Ok("sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string())
		}

		async fn download_blob(&self, _reference: &str, _dst: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
			Ok(())
		}
	}

	fn dbs(dir: &std::path::Path) -> Arc<RepoDatabases> {
		Arc::new(RepoDatabases::new(dir.to_path_buf(), "artifacts/yum/epel", Arc::new(InMemoryBlobStore::new())))
	}

	#[tokio::test]
	async fn start_transitions_to_ready_and_second_start_fails() {
		let dir = tempfile::tempdir().unwrap();
		let removed = Arc::new(AtomicUsize::new(0));
		let removed2 = removed.clone();
		let handler = RepoHandler::new(
			"artifacts/yum/epel".to_string(),
			false,
			dbs(dir.path()),
			Arc::new(NoopRunner),
			Arc::new(NoopOci),
			Arc::new(move |_: &str| {
				removed2.fetch_add(1, Ordering::SeqCst);
			}),
		);

		handler.start().await.unwrap();
		assert_eq!(handler.state(), HandlerState::Ready);
		assert!(handler.start().await.is_err());

		handler.stop().await;
		assert_eq!(removed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn queue_event_is_rejected_on_mirror_outside_sync() {
		let dir = tempfile::tempdir().unwrap();
		let handler = RepoHandler::new(
			"artifacts/yum/epel".to_string(),
			true,
			dbs(dir.path()),
			Arc::new(NoopRunner),
			Arc::new(NoopOci),
			Arc::new(|_: &str| {}),
		);
		handler.start().await.unwrap();

		let payload = EventPayload {
			digest: "sha256:a".to_string(),
			mediatype: "application/json".to_string(),
			repository: "artifacts/yum/epel".to_string(),
			action: Action::Put,
			payload: vec![],
		};
		let err = handler.queue_event(payload, true).await.unwrap_err();
		assert_eq!(err.kind(), beskar_common::error::ErrorKind::FailedPrecondition);
		handler.stop().await;
	}

	#[tokio::test]
	async fn sync_artifact_times_out_when_never_fired() {
		let dir = tempfile::tempdir().unwrap();
		let handler = RepoHandler::new(
			"artifacts/yum/epel".to_string(),
			false,
			dbs(dir.path()),
			Arc::new(NoopRunner),
			Arc::new(NoopOci),
			Arc::new(|_: &str| {}),
		);
		handler.start().await.unwrap();

		let err = handler.sync_artifact("a.rpm", Duration::from_millis(20)).await.unwrap_err();
		assert_eq!(err.kind(), beskar_common::error::ErrorKind::Unavailable);
		handler.stop().await;
	}

	#[tokio::test]
	async fn queueing_an_event_fires_its_registered_barrier() {
		let dir = tempfile::tempdir().unwrap();
		let handler = RepoHandler::new(
			"artifacts/yum/epel".to_string(),
			false,
			dbs(dir.path()),
			Arc::new(NoopRunner),
			Arc::new(NoopOci),
			Arc::new(|_: &str| {}),
		);
		handler.start().await.unwrap();
		handler.register_artifact_alias("sha256:a", "a.rpm");

		let wait = tokio::spawn({
			let handler = handler.clone();
			async move { handler.sync_artifact("a.rpm", Duration::from_secs(2)).await }
		});

		tokio::time::sleep(Duration::from_millis(20)).await;
		handler
			.queue_event(
				EventPayload {
					digest: "sha256:a".to_string(),
					mediatype: "application/json".to_string(),
					repository: "artifacts/yum/epel".to_string(),
					action: Action::Put,
					payload: vec![],
				},
				false,
			)
			.await
			.unwrap();

		wait.await.unwrap().unwrap();
		handler.stop().await;
	}
}
