// SPDX-License-Identifier: Apache-2.0

//! The status database: event queue persistence and sync-status records
//! (spec §3 "Event", §4.9, §4.10).

use crate::blob::BlobStore;
use crate::handle::{DbHandle, Migration};
use beskar_common::error::{Error, Result};
use beskar_common::event::{Event, EventPayload};
use rusqlite::OptionalExtension;
use std::sync::Arc;

const MIGRATIONS: &[Migration] = &[
	r#"
	CREATE TABLE events (
		seq INTEGER PRIMARY KEY,
		digest TEXT NOT NULL,
		mediatype TEXT NOT NULL,
		repository TEXT NOT NULL,
		action TEXT NOT NULL,
		payload BLOB NOT NULL
	);
	CREATE TABLE properties (
		key TEXT PRIMARY KEY,
		value BLOB NOT NULL
	);
	CREATE TABLE sync_status (
		id INTEGER PRIMARY KEY CHECK (id = 0),
		synced INTEGER NOT NULL,
		total INTEGER NOT NULL,
		error TEXT
	);
	"#,
];

/// A repository's status database: the persisted event queue an
/// [`beskar_common::repository::HandlerState`]-driven main loop drains on
/// startup (spec §4.9 "the status DB is drained on `Start`").
pub struct StatusDb {
	handle: DbHandle,
}

impl StatusDb {
	pub fn new(path: std::path::PathBuf, blob_key: String, blob_store: Arc<dyn BlobStore>) -> Self {
		StatusDb {
			handle: DbHandle::new(path, blob_key, MIGRATIONS, blob_store),
		}
	}

	/// Appends an event, persisted before it is acknowledged to the sender
	/// (spec §3 "Events are persisted ... before being acknowledged
	/// downstream").
	pub async fn append_event(&self, payload: &EventPayload) -> Result<u64> {
		let encoded = payload.encode();
		let action = payload.action.as_str();
		let (digest, mediatype, repository) = (payload.digest.clone(), payload.mediatype.clone(), payload.repository.clone());

		self.handle
			.with_connection(move |conn| {
				conn.execute(
					"INSERT INTO events (digest, mediatype, repository, action, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
					rusqlite::params![digest, mediatype, repository, action, encoded],
				)?;
				Ok(conn.last_insert_rowid() as u64)
			})
			.await
	}

	/// Removes an event once it has been fully handled (spec §3 "removed
	/// only after successful handling").
	pub async fn remove_event(&self, seq: u64) -> Result<()> {
		self.handle
			.with_connection(move |conn| {
				conn.execute("DELETE FROM events WHERE seq = ?1", rusqlite::params![seq as i64])?;
				Ok(())
			})
			.await
	}

	/// Drains all currently-stored events in sequence order (spec §4.9
	/// "the status DB is drained on `Start`").
	pub async fn load_pending_events(&self) -> Result<Vec<Event>> {
		self.handle
			.with_connection(|conn| {
				let mut stmt = conn.prepare("SELECT seq, payload FROM events ORDER BY seq ASC")?;
				let rows = stmt.query_map([], |row| {
					let seq: i64 = row.get(0)?;
					let bytes: Vec<u8> = row.get(1)?;
					Ok((seq as u64, bytes))
				})?;

				let mut events = Vec::new();
				for row in rows {
					let (seq, bytes) = row?;
					events.push((seq, bytes));
				}
				Ok(events)
			})
			.await?
			.into_iter()
			.map(|(seq, bytes)| {
				EventPayload::decode(&bytes)
					.map(|payload| Event { seq, payload })
					.map_err(|e| Error::internal(format!("corrupt persisted event {seq}: {e}")))
			})
			.collect()
	}

	/// The highest persisted sequence number at startup, remembered as
	/// `lastIndex` (spec §4.9).
	pub async fn last_index(&self) -> Result<Option<u64>> {
		self.handle
			.with_connection(|conn| conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get::<_, Option<i64>>(0)))
			.await
			.map(|opt| opt.map(|v| v as u64))
	}

	pub async fn set_property(&self, key: &str, value: &[u8]) -> Result<()> {
		let key = key.to_string();
		let value = value.to_vec();
		self.handle
			.with_connection(move |conn| {
				conn.execute(
					"INSERT INTO properties (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
					rusqlite::params![key, value],
				)?;
				Ok(())
			})
			.await
	}

	pub async fn get_property(&self, key: &str) -> Result<Option<Vec<u8>>> {
		let key = key.to_string();
		self.handle
			.with_connection(move |conn| {
				conn.query_row("SELECT value FROM properties WHERE key = ?1", rusqlite::params![key], |row| row.get(0))
					.optional()
			})
			.await
	}

	/// Records the outcome of the most recent sync attempt (spec §4.11
	/// "Sync failures are recorded in the sync status record").
	pub async fn set_sync_status(&self, synced: u64, total: u64, error: Option<&str>) -> Result<()> {
		let error = error.map(|s| s.to_string());
		self.handle
			.with_connection(move |conn| {
				conn.execute(
					"INSERT INTO sync_status (id, synced, total, error) VALUES (0, ?1, ?2, ?3)
					 ON CONFLICT(id) DO UPDATE SET synced = excluded.synced, total = excluded.total, error = excluded.error",
					rusqlite::params![synced as i64, total as i64, error],
				)?;
				Ok(())
			})
			.await
	}

	pub async fn sync_status(&self) -> Result<Option<(u64, u64, Option<String>)>> {
		self.handle
			.with_connection(|conn| {
				conn.query_row("SELECT synced, total, error FROM sync_status WHERE id = 0", [], |row| {
					Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64, row.get(2)?))
				})
				.optional()
			})
			.await
	}

	pub async fn sync_to_blob_store(&self) -> Result<()> {
		self.handle.sync().await
	}
}
