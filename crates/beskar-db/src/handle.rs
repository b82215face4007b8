// SPDX-License-Identifier: Apache-2.0

//! A single lazily-opened, reference-counted, blob-store-backed SQLite
//! database (spec §4.10).

use crate::blob::BlobStore;
use beskar_common::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An ordered, embedded set of SQL migrations applied at open time (spec
/// §4.10 "schema evolution uses an embedded, ordered set of SQL migrations
/// applied at open time").
pub type Migration = &'static str;

struct OpenConnection {
	conn: Connection,
}

/// One of a repository's four SQLite databases: opened lazily (pulling its
/// compressed snapshot from the blob store if the local file is missing),
/// reference-counted so concurrent users share a single open handle, and
/// synced explicitly to the blob store under a local upload mutex.
pub struct DbHandle {
	path: PathBuf,
	blob_key: String,
	migrations: &'static [Migration],
	blob_store: Arc<dyn BlobStore>,
	conn: Mutex<Option<OpenConnection>>,
	ref_count: AtomicUsize,
	sync_lock: tokio::sync::Mutex<()>,
}

impl DbHandle {
	pub fn new(path: PathBuf, blob_key: String, migrations: &'static [Migration], blob_store: Arc<dyn BlobStore>) -> Self {
		DbHandle {
			path,
			blob_key,
			migrations,
			blob_store,
			conn: Mutex::new(None),
			ref_count: AtomicUsize::new(0),
			sync_lock: tokio::sync::Mutex::new(()),
		}
	}

	/// Ensures the database is open, pulling its snapshot from the blob
	/// store on first use if no local file exists yet (spec §4.10 "opened
	/// lazily"), then runs `f` against the connection while holding the
	/// handle open.
	pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
	where
		F: FnOnce(&Connection) -> rusqlite::Result<T> + Send,
		T: Send + 'static,
	{
		self.ensure_open().await?;
		self.ref_count.fetch_add(1, Ordering::SeqCst);
		let result = {
			let guard = self.conn.lock();
			let open = guard.as_ref().expect("ensure_open just populated this");
			f(&open.conn)
		};
		self.ref_count.fetch_sub(1, Ordering::SeqCst);
		result.map_err(|e| Error::internal(format!("sqlite operation on {:?} failed: {e}", self.path)))
	}

	async fn ensure_open(&self) -> Result<()> {
		if self.conn.lock().is_some() {
			return Ok(());
		}

		if !self.path.exists() {
			if let Some(parent) = self.path.parent() {
				std::fs::create_dir_all(parent)?;
			}
			if let Some(compressed) = self.blob_store.get(&self.blob_key).await? {
				let decompressed = lz4_flex::block::decompress_size_prepended(&compressed)
					.map_err(|e| Error::internal(format!("corrupt snapshot for {}: {e}", self.blob_key)))?;
				std::fs::write(&self.path, decompressed)?;
			}
		}

		let conn = Connection::open(&self.path)
			.map_err(|e| Error::internal(format!("failed to open sqlite db {:?}: {e}", self.path)))?;
		self.apply_migrations(&conn)?;

		*self.conn.lock() = Some(OpenConnection { conn });
		Ok(())
	}

	fn apply_migrations(&self, conn: &Connection) -> Result<()> {
		let current: i64 = conn
			.query_row("PRAGMA user_version", [], |row| row.get(0))
			.map_err(|e| Error::internal(format!("failed to read schema version: {e}")))?;

		for (index, migration) in self.migrations.iter().enumerate() {
			let version = (index + 1) as i64;
			if version <= current {
				continue;
			}
			conn.execute_batch(migration)
				.map_err(|e| Error::internal(format!("migration {version} failed: {e}")))?;
			conn.pragma_update(None, "user_version", version)
				.map_err(|e| Error::internal(format!("failed to record schema version {version}: {e}")))?;
		}
		Ok(())
	}

	/// Compresses the current database file with LZ4 and uploads it to the
	/// blob store, serialized with a local async mutex (spec §4.10 "synced
	/// explicitly ... serialized with a local mutex").
	pub async fn sync(&self) -> Result<()> {
		let _guard = self.sync_lock.lock().await;

		{
			let guard = self.conn.lock();
			if let Some(open) = guard.as_ref() {
				open.conn
					.execute("PRAGMA wal_checkpoint(FULL)", [])
					.map_err(|e| Error::internal(format!("checkpoint before sync failed: {e}")))?;
			}
		}

		let raw = std::fs::read(&self.path)?;
		let compressed = lz4_flex::block::compress_prepend_size(&raw);
		self.blob_store.put(&self.blob_key, compressed).await
	}

	/// Closes the handle once the reference count reaches zero, optionally
	/// removing the local file (spec §4.10 "`Close(removeLocal)` only truly
	/// closes when the counter is zero").
	pub fn close(&self, remove_local: bool) -> Result<()> {
		if self.ref_count.load(Ordering::SeqCst) != 0 {
			return Err(Error::unavailable("cannot close db handle: still in use"));
		}
		*self.conn.lock() = None;
		if remove_local && self.path.exists() {
			std::fs::remove_file(&self.path)?;
		}
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn ref_count(&self) -> usize {
		self.ref_count.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blob::InMemoryBlobStore;

	const MIGRATIONS: &[Migration] = &["CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT NOT NULL);"];

	#[tokio::test]
	async fn lazily_opens_and_applies_migrations_once() {
		let dir = tempfile::tempdir().unwrap();
		let blobs = Arc::new(InMemoryBlobStore::new());
		let handle = DbHandle::new(dir.path().join("test.db"), "repo/test.db.lz4".to_string(), MIGRATIONS, blobs);

		handle
			.with_connection(|conn| conn.execute("INSERT INTO kv (key, value) VALUES ('a', '1')", []))
			.await
			.unwrap();

		let value: String = handle
			.with_connection(|conn| conn.query_row("SELECT value FROM kv WHERE key = 'a'", [], |row| row.get(0)))
			.await
			.unwrap();
		assert_eq!(value, "1");
	}

	#[tokio::test]
	async fn sync_then_reopen_from_blob_store_round_trips_data() {
		let dir = tempfile::tempdir().unwrap();
		let blobs = Arc::new(InMemoryBlobStore::new());
		let key = "repo/test.db.lz4".to_string();

		{
			let handle = DbHandle::new(dir.path().join("test.db"), key.clone(), MIGRATIONS, blobs.clone());
			handle
				.with_connection(|conn| conn.execute("INSERT INTO kv (key, value) VALUES ('a', 'persisted')", []))
				.await
				.unwrap();
			handle.sync().await.unwrap();
			handle.close(false).unwrap();
		}

		std::fs::remove_file(dir.path().join("test.db")).unwrap();

		let reopened = DbHandle::new(dir.path().join("test.db"), key, MIGRATIONS, blobs);
		let value: String = reopened
			.with_connection(|conn| conn.query_row("SELECT value FROM kv WHERE key = 'a'", [], |row| row.get(0)))
			.await
			.unwrap();
		assert_eq!(value, "persisted");
	}

	#[tokio::test]
	async fn close_fails_while_references_remain() {
		let dir = tempfile::tempdir().unwrap();
		let blobs = Arc::new(InMemoryBlobStore::new());
		let handle = Arc::new(DbHandle::new(dir.path().join("test.db"), "k".to_string(), MIGRATIONS, blobs));

		handle.ensure_open().await.unwrap();
		handle.ref_count.fetch_add(1, Ordering::SeqCst);
		assert!(handle.close(false).is_err());
		handle.ref_count.fetch_sub(1, Ordering::SeqCst);
		assert!(handle.close(false).is_ok());
	}
}
