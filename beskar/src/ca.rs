// SPDX-License-Identifier: Apache-2.0

//! CA bootstrap (spec §3 "CA bundle", §4.3 `Start`'s `seedState` parameter,
//! §7 "failure to ... bootstrap the CA during cluster join causes the node
//! to exit with a non-zero code").

use beskar_common::error::{Error, Result};
use beskar_mtls::{Algorithm, CertKeyPair};
use serde::{Deserialize, Serialize};
use time::Duration as TimeDuration;

/// The CA bundle wire format carried as gossip remote state (spec §3: "CA
/// bundle ... replicated via gossip 'remote state'").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaBundle {
	pub cert_pem: String,
	pub key_pem: String,
}

impl From<CertKeyPair> for CaBundle {
	fn from(pair: CertKeyPair) -> Self {
		CaBundle {
			cert_pem: pair.cert_pem,
			key_pem: pair.key_pem,
		}
	}
}

impl CaBundle {
	pub fn as_cert_key_pair(&self) -> CertKeyPair {
		CertKeyPair {
			cert_pem: self.cert_pem.clone(),
			key_pem: self.key_pem.clone(),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		bincode::serialize(self).expect("CaBundle always encodes")
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		bincode::deserialize(bytes).map_err(|e| Error::internal(format!("malformed CA bundle: {e}")))
	}
}

/// Generates a fresh CA, to be used when this node is forming a new cluster
/// (spec §4.3: "if no peers respond within the timeout, the node becomes
/// the bootstrap node and publishes its own state").
pub fn generate_cluster_ca(validity_days: i64) -> Result<CaBundle> {
	let pair = beskar_mtls::generate_ca("beskar-cluster-ca", TimeDuration::days(validity_days), Algorithm::Ecdsa)?;
	Ok(pair.into())
}

/// Resolves this node's CA bundle at startup: either the bytes gossip
/// handed back from an existing peer, or a freshly generated one if this
/// node is seeding the cluster. Returns `Err` only when neither applies —
/// the fatal condition spec §7 describes.
pub fn resolve_ca(remote_state: Option<Vec<u8>>, seeded: Option<CaBundle>, validity_days: i64) -> Result<CaBundle> {
	if let Some(bytes) = remote_state {
		return CaBundle::decode(&bytes);
	}
	if let Some(bundle) = seeded {
		return Ok(bundle);
	}
	let _ = validity_days;
	Err(Error::internal(
		"no CA bundle available: no remote state received and this node was not seeding a new cluster",
	))
}
