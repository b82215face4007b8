// SPDX-License-Identifier: Apache-2.0

//! Access decisions for the registry's authentication hook (spec §4.12):
//! which requests require authentication, and whether a given request
//! satisfies it.
//!
//! Grounded on `beskar_mtls`'s mutual-TLS model for the peer-bypass path
//! (spec §4.2: every intra-cluster connection already carries a verified
//! client certificate) and on htpasswd/bcrypt, the standard shape for this
//! kind of static credential store — the teacher repo has no authentication
//! layer of its own to generalize from (spec §1 places the registry's HTTP
//! edge itself out of scope; this crate only answers the yes/no question the
//! edge asks it).

use beskar_common::error::{Error, Result};
use std::collections::HashMap;

/// The kind of resource an access record names (spec §4.12: "`registry`-typed
/// access ... always require auth").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
	/// Cluster-wide operations with no single repository scope (catalog
	/// listing, node administration).
	Registry,
	Repository,
}

/// The actions an OCI-style access record can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Pull,
	Push,
	Delete,
}

/// One access record attached to a request by the outer registry (spec
/// §4.12, §6 "Registry boundary").
#[derive(Debug, Clone)]
pub struct AccessRecord {
	pub resource_type: ResourceType,
	pub name: String,
	pub actions: Vec<Action>,
}

/// The reserved namespace that always requires authentication regardless of
/// action (spec §4.12: "the reserved `beskar` namespace always require[s]
/// auth").
const RESERVED_NAMESPACE: &str = "beskar";

/// `RequiresAuth(record)` (spec §4.12): `registry`-typed access, `push`/
/// `delete` actions, or the reserved namespace always require auth; plain
/// read access to any other repository does not.
pub fn requires_auth(record: &AccessRecord) -> bool {
	if record.resource_type == ResourceType::Registry {
		return true;
	}
	if record.name == RESERVED_NAMESPACE || record.name.starts_with("beskar/") {
		return true;
	}
	record.actions.iter().any(|a| matches!(a, Action::Push | Action::Delete))
}

/// What the request presented: a verified mTLS peer identity (the TLS layer
/// below already validated the certificate chain; this is just the SNI/CN it
/// carried), HTTP Basic credentials, or neither.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestCredentials<'a> {
	pub verified_peer_sni: Option<&'a str>,
	pub basic_auth: Option<(&'a str, &'a str)>,
}

/// The outcome of an authorization decision. `Denied` carries the
/// `WWW-Authenticate` challenge value the HTTP edge should echo back (spec
/// §4.12: "failure returns a WWW-Authenticate challenge").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
	Allowed,
	Denied { www_authenticate: String },
}

impl AccessDecision {
	pub fn is_allowed(&self) -> bool {
		matches!(self, AccessDecision::Allowed)
	}
}

fn challenge(realm: &str) -> String {
	format!("Basic realm=\"{realm}\"")
}

/// Authorizes requests against an htpasswd-style credential store, with an
/// mTLS bypass for traffic between a node's own intra-cluster plugins (spec
/// §4.12).
pub struct AccessController {
	realm: String,
	/// username -> bcrypt hash of password, parsed from an htpasswd file.
	htpasswd: HashMap<String, String>,
	/// bcrypt hashes of hostnames this node trusts unconditionally once the
	/// TLS layer has already verified the peer's certificate (spec §6:
	/// "A hashed hostname constant is configured per node; matching SNI
	/// bypasses auth for intra-cluster peers").
	trusted_peer_hashes: Vec<String>,
}

impl AccessController {
	pub fn new(realm: impl Into<String>, htpasswd: HashMap<String, String>, trusted_peer_hashes: Vec<String>) -> Self {
		AccessController {
			realm: realm.into(),
			htpasswd,
			trusted_peer_hashes,
		}
	}

	/// Parses an htpasswd file's contents: one `user:$2y$...` entry per line,
	/// blank lines and `#`-prefixed comments ignored.
	pub fn parse_htpasswd(contents: &str) -> Result<HashMap<String, String>> {
		let mut entries = HashMap::new();
		for (lineno, line) in contents.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let (user, hash) = line
				.split_once(':')
				.ok_or_else(|| Error::invalid_argument(format!("htpasswd line {}: missing ':' separator", lineno + 1)))?;
			if user.is_empty() || hash.is_empty() {
				return Err(Error::invalid_argument(format!("htpasswd line {}: empty username or hash", lineno + 1)));
			}
			entries.insert(user.to_string(), hash.to_string());
		}
		Ok(entries)
	}

	/// `RequiresAuth(record)` (spec §4.12).
	pub fn requires_auth(&self, record: &AccessRecord) -> bool {
		requires_auth(record)
	}

	/// Decides whether `credentials` satisfies the access `record` requires
	/// (spec §4.12). Requests for records that don't require auth are always
	/// allowed, even with no credentials at all.
	pub fn authorize(&self, record: &AccessRecord, credentials: &RequestCredentials<'_>) -> AccessDecision {
		if !self.requires_auth(record) {
			return AccessDecision::Allowed;
		}

		if let Some(sni) = credentials.verified_peer_sni {
			if self.is_trusted_peer(sni) {
				return AccessDecision::Allowed;
			}
		}

		if let Some((username, password)) = credentials.basic_auth {
			if self.verify_basic(username, password) {
				return AccessDecision::Allowed;
			}
		}

		AccessDecision::Denied {
			www_authenticate: challenge(&self.realm),
		}
	}

	/// Whether `sni`, already verified by the TLS layer as the peer's
	/// certificate identity, matches one of this node's configured
	/// intra-cluster peer hashes.
	fn is_trusted_peer(&self, sni: &str) -> bool {
		self.trusted_peer_hashes
			.iter()
			.any(|hash| bcrypt::verify(sni, hash).unwrap_or(false))
	}

	fn verify_basic(&self, username: &str, password: &str) -> bool {
		match self.htpasswd.get(username) {
			Some(hash) => bcrypt::verify(password, hash).unwrap_or(false),
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hash(value: &str) -> String {
		bcrypt::hash(value, 4).unwrap()
	}

	fn push_record(name: &str) -> AccessRecord {
		AccessRecord {
			resource_type: ResourceType::Repository,
			name: name.to_string(),
			actions: vec![Action::Push],
		}
	}

	fn pull_record(name: &str) -> AccessRecord {
		AccessRecord {
			resource_type: ResourceType::Repository,
			name: name.to_string(),
			actions: vec![Action::Pull],
		}
	}

	#[test]
	fn public_repository_pull_does_not_require_auth() {
		let record = pull_record("artifacts/yum/epel");
		assert!(!requires_auth(&record));
	}

	#[test]
	fn push_to_any_repository_requires_auth() {
		let record = push_record("artifacts/yum/epel");
		assert!(requires_auth(&record));
	}

	#[test]
	fn registry_scoped_access_always_requires_auth() {
		let record = AccessRecord {
			resource_type: ResourceType::Registry,
			name: "catalog".to_string(),
			actions: vec![Action::Pull],
		};
		assert!(requires_auth(&record));
	}

	#[test]
	fn reserved_namespace_requires_auth_even_for_reads() {
		let record = pull_record("beskar/internal-state");
		assert!(requires_auth(&record));
		let record = pull_record("beskar");
		assert!(requires_auth(&record));
	}

	#[test]
	fn parses_htpasswd_entries() {
		let contents = format!("# comment\nalice:{}\n\nbob:{}\n", hash("alice-pw"), hash("bob-pw"));
		let entries = AccessController::parse_htpasswd(&contents).unwrap();
		assert_eq!(entries.len(), 2);
		assert!(entries.contains_key("alice"));
		assert!(entries.contains_key("bob"));
	}

	#[test]
	fn rejects_malformed_htpasswd_line() {
		let err = AccessController::parse_htpasswd("not-a-valid-line").unwrap_err();
		assert_eq!(err.kind(), beskar_common::error::ErrorKind::InvalidArgument);
	}

	#[test]
	fn basic_auth_with_correct_password_is_allowed() {
		let mut htpasswd = HashMap::new();
		htpasswd.insert("alice".to_string(), hash("secret"));
		let controller = AccessController::new("beskar", htpasswd, vec![]);

		let decision = controller.authorize(
			&push_record("artifacts/yum/epel"),
			&RequestCredentials {
				verified_peer_sni: None,
				basic_auth: Some(("alice", "secret")),
			},
		);
		assert_eq!(decision, AccessDecision::Allowed);
	}

	#[test]
	fn basic_auth_with_wrong_password_is_denied_with_challenge() {
		let mut htpasswd = HashMap::new();
		htpasswd.insert("alice".to_string(), hash("secret"));
		let controller = AccessController::new("beskar", htpasswd, vec![]);

		let decision = controller.authorize(
			&push_record("artifacts/yum/epel"),
			&RequestCredentials {
				verified_peer_sni: None,
				basic_auth: Some(("alice", "wrong")),
			},
		);
		assert_eq!(
			decision,
			AccessDecision::Denied {
				www_authenticate: "Basic realm=\"beskar\"".to_string()
			}
		);
	}

	#[test]
	fn unknown_username_is_denied() {
		let controller = AccessController::new("beskar", HashMap::new(), vec![]);
		let decision = controller.authorize(
			&push_record("artifacts/yum/epel"),
			&RequestCredentials {
				verified_peer_sni: None,
				basic_auth: Some(("ghost", "anything")),
			},
		);
		assert!(!decision.is_allowed());
	}

	#[test]
	fn no_credentials_at_all_is_denied_when_auth_is_required() {
		let controller = AccessController::new("beskar", HashMap::new(), vec![]);
		let decision = controller.authorize(&push_record("artifacts/yum/epel"), &RequestCredentials::default());
		assert!(!decision.is_allowed());
	}

	#[test]
	fn no_credentials_is_allowed_when_auth_is_not_required() {
		let controller = AccessController::new("beskar", HashMap::new(), vec![]);
		let decision = controller.authorize(&pull_record("artifacts/yum/epel"), &RequestCredentials::default());
		assert!(decision.is_allowed());
	}

	#[test]
	fn matching_intra_cluster_sni_bypasses_basic_auth_entirely() {
		let trusted = vec![hash("node-b.beskar.internal")];
		let controller = AccessController::new("beskar", HashMap::new(), trusted);

		let decision = controller.authorize(
			&push_record("artifacts/yum/epel"),
			&RequestCredentials {
				verified_peer_sni: Some("node-b.beskar.internal"),
				basic_auth: None,
			},
		);
		assert_eq!(decision, AccessDecision::Allowed);
	}

	#[test]
	fn non_matching_sni_falls_back_to_basic_auth() {
		let trusted = vec![hash("node-b.beskar.internal")];
		let mut htpasswd = HashMap::new();
		htpasswd.insert("alice".to_string(), hash("secret"));
		let controller = AccessController::new("beskar", htpasswd, trusted);

		let decision = controller.authorize(
			&push_record("artifacts/yum/epel"),
			&RequestCredentials {
				verified_peer_sni: Some("some-other-host"),
				basic_auth: Some(("alice", "secret")),
			},
		);
		assert_eq!(decision, AccessDecision::Allowed);
	}
}
