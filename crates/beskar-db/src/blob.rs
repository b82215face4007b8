// SPDX-License-Identifier: Apache-2.0

//! The blob store collaborator DB snapshots are uploaded to and pulled from
//! (spec §4.10, §6 "Blob-store keys mirror `<repository>/<name>.db.lz4>`").
//! The registry's actual blob store is out of this crate's scope (spec §1);
//! this trait fixes only the narrow corner this crate needs.

use async_trait::async_trait;
use beskar_common::error::Result;

#[async_trait]
pub trait BlobStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
	async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
	async fn delete(&self, key: &str) -> Result<()>;
}

/// An in-memory stand-in, used by this crate's own tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
	objects: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
	pub fn new() -> Self {
		InMemoryBlobStore::default()
	}
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		Ok(self.objects.lock().get(key).cloned())
	}

	async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
		self.objects.lock().insert(key.to_string(), bytes);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<()> {
		self.objects.lock().remove(key);
		Ok(())
	}
}
