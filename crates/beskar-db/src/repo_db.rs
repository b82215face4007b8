// SPDX-License-Identifier: Apache-2.0

//! The four embedded databases a repository owns, laid out exactly as spec
//! §6 describes (`<dataDir>/<repository>/{repository,metadata,status,log}.db`).

use crate::blob::BlobStore;
use crate::handle::{DbHandle, Migration};
use crate::status::StatusDb;
use beskar_common::error::Result;
use rusqlite::OptionalExtension;
use std::path::PathBuf;
use std::sync::Arc;

const REPOSITORY_MIGRATIONS: &[Migration] = &[
	"CREATE TABLE artifacts (name TEXT PRIMARY KEY, digest TEXT NOT NULL, size INTEGER NOT NULL, pushed_at INTEGER NOT NULL);",
];

/// A row of the `artifacts` table: the sync engine's view of "what's
/// locally known to be pushed" (spec §4.11 step 1 "enumerate local
/// artifacts (from repository DB)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
	pub name: String,
	pub digest: String,
	pub size: u64,
	pub pushed_at: i64,
}

const METADATA_MIGRATIONS: &[Migration] = &[
	"CREATE TABLE repository_metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
];

const LOG_MIGRATIONS: &[Migration] = &[
	"CREATE TABLE log_entries (seq INTEGER PRIMARY KEY, at INTEGER NOT NULL, level TEXT NOT NULL, message TEXT NOT NULL);",
];

/// A repository's four databases (spec §4.10, §6 "Persisted state layout").
pub struct RepoDatabases {
	pub repository: DbHandle,
	pub metadata: DbHandle,
	pub status: StatusDb,
	pub log: DbHandle,
	data_dir: PathBuf,
}

impl RepoDatabases {
	/// `data_dir` is `<dataDir>/<repository>`; `blob_prefix` is `<repository>`
	/// (spec §6: "Blob-store keys mirror `<repository>/<name>.db.lz4`").
	pub fn new(data_dir: PathBuf, blob_prefix: &str, blob_store: Arc<dyn BlobStore>) -> Self {
		let key = |name: &str| format!("{blob_prefix}/{name}.db.lz4");

		RepoDatabases {
			repository: DbHandle::new(
				data_dir.join("repository.db"),
				key("repository"),
				REPOSITORY_MIGRATIONS,
				blob_store.clone(),
			),
			metadata: DbHandle::new(data_dir.join("metadata.db"), key("metadata"), METADATA_MIGRATIONS, blob_store.clone()),
			status: StatusDb::new(data_dir.join("status.db"), key("status"), blob_store.clone()),
			log: DbHandle::new(data_dir.join("log.db"), key("log"), LOG_MIGRATIONS, blob_store),
			data_dir,
		}
	}

	pub fn downloads_dir(&self) -> PathBuf {
		self.data_dir.join("downloads")
	}

	/// Enumerates every artifact currently recorded as pushed (spec §4.11
	/// step 1 "enumerate local artifacts").
	pub async fn list_artifacts(&self) -> Result<Vec<ArtifactRecord>> {
		self.repository
			.with_connection(|conn| {
				let mut stmt = conn.prepare("SELECT name, digest, size, pushed_at FROM artifacts ORDER BY name ASC")?;
				let rows = stmt.query_map([], |row| {
					Ok(ArtifactRecord {
						name: row.get(0)?,
						digest: row.get(1)?,
						size: row.get::<_, i64>(2)? as u64,
						pushed_at: row.get(3)?,
					})
				})?;
				rows.collect::<rusqlite::Result<Vec<_>>>()
			})
			.await
	}

	/// Records a successfully pushed artifact (spec §4.11 step 2 "record in
	/// repository DB"), called only after the corresponding push succeeded.
	pub async fn record_artifact(&self, name: &str, digest: &str, size: u64, pushed_at: i64) -> Result<()> {
		let name = name.to_string();
		let digest = digest.to_string();
		self.repository
			.with_connection(move |conn| {
				conn.execute(
					"INSERT INTO artifacts (name, digest, size, pushed_at) VALUES (?1, ?2, ?3, ?4)
					 ON CONFLICT(name) DO UPDATE SET digest = excluded.digest, size = excluded.size, pushed_at = excluded.pushed_at",
					rusqlite::params![name, digest, size as i64, pushed_at],
				)?;
				Ok(())
			})
			.await
	}

	pub async fn remove_artifact(&self, name: &str) -> Result<()> {
		let name = name.to_string();
		self.repository
			.with_connection(move |conn| {
				conn.execute("DELETE FROM artifacts WHERE name = ?1", rusqlite::params![name])?;
				Ok(())
			})
			.await
	}

	pub async fn get_artifact(&self, name: &str) -> Result<Option<ArtifactRecord>> {
		let name = name.to_string();
		self.repository
			.with_connection(move |conn| {
				conn.query_row(
					"SELECT name, digest, size, pushed_at FROM artifacts WHERE name = ?1",
					rusqlite::params![name],
					|row| {
						Ok(ArtifactRecord {
							name: row.get(0)?,
							digest: row.get(1)?,
							size: row.get::<_, i64>(2)? as u64,
							pushed_at: row.get(3)?,
						})
					},
				)
				.optional()
			})
			.await
	}

	/// Appends a line to the append-only log DB (spec §4.11 "per-file
	/// errors are logged to the log DB").
	pub async fn append_log(&self, level: &str, message: &str) -> Result<()> {
		let level = level.to_string();
		let message = message.to_string();
		let at = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs() as i64;
		self.log
			.with_connection(move |conn| {
				conn.execute(
					"INSERT INTO log_entries (at, level, message) VALUES (?1, ?2, ?3)",
					rusqlite::params![at, level, message],
				)?;
				Ok(())
			})
			.await
	}

	/// Uploads all four databases' current state to the blob store (spec
	/// §4.10 `Sync()`).
	pub async fn sync_all(&self) -> Result<()> {
		self.repository.sync().await?;
		self.metadata.sync().await?;
		self.status.sync_to_blob_store().await?;
		self.log.sync().await?;
		Ok(())
	}

	/// Removes the on-disk databases; only valid once the repository's
	/// handler has reached its terminal `deleting` state (spec §4.10
	/// "deleted only when `deleting` is the handler's terminal state").
	pub fn remove_local(&self) -> Result<()> {
		self.repository.close(true)?;
		self.metadata.close(true)?;
		self.log.close(true)?;
		if self.data_dir.exists() {
			std::fs::remove_dir_all(&self.data_dir)?;
		}
		Ok(())
	}
}
