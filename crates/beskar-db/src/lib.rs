// SPDX-License-Identifier: Apache-2.0

//! Embedded per-repository SQLite databases with LZ4-compressed blob-store
//! snapshots (spec §4.10).
//!
//! Grounded on `hipcheck/src/cache/repo.rs`'s shape — a lazily-populated,
//! locally-cached on-disk store fronting a slower remote source — but
//! generalized from whole-directory git-repo clones to individual SQLite
//! files, and from a `Drop`-triggered best-effort flush to an explicit,
//! reference-counted `Sync`/`Close` contract (spec §9: "replace
//! finalizer-driven cleanup ... with explicit scoped acquisition and
//! guaranteed release").

mod blob;
mod handle;
mod repo_db;
mod status;

pub use blob::{BlobStore, InMemoryBlobStore};
pub use handle::{DbHandle, Migration};
pub use repo_db::{ArtifactRecord, RepoDatabases};
pub use status::StatusDb;
