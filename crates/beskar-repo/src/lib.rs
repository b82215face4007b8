// SPDX-License-Identifier: Apache-2.0

//! Per-plugin repository map (spec §4.8), the generic per-repository
//! handler (spec §4.9), and the generic mirror sync engine (spec §4.11).
//!
//! Grounded on `hipcheck/src/engine/mod.rs`'s shape (event-driven state held
//! behind a handle, queried and mutated through message passing rather than
//! shared locks) and `hipcheck/src/plugin/manager.rs`'s bounded-concurrency,
//! retrying push pattern — generalized here from "one plugin process" to
//! "one repository handler", and from "run one analysis" to "sync a mirror
//! repository to its upstream".

mod handler;
mod manager;
mod sync;

pub use handler::{OciOperations, RemoveCallback, RepoHandler, SyncBarrier, SyncRunner};
pub use manager::{RepoHandlerFactory, RepositoryManager};
pub use sync::{
	ArtifactTransport, MirrorSource, MirrorSyncConfig, MirrorSyncEngine, NoopPostSync, PostSyncHook, RemoteArtifact,
};
