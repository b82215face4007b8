// SPDX-License-Identifier: Apache-2.0

//! Repository naming and the `RepoHandler` state machine (spec §3, §4.9,
//! §8.4).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validates a repository name against a plugin-specific pattern.
///
/// Spec §3: "Identified by a string matching a plugin-specific pattern
/// (e.g. `artifacts/yum/<name>`)." The generic core only enforces the
/// structural shape common to every plugin kind — a `prefix/name` with
/// non-empty, slash-free segments after the prefix; plugin-specific
/// validation (RPM name charset, etc.) is the plugin's own concern.
pub fn validate_repository_name(prefix: &str, repository: &str) -> Result<()> {
	let Some(rest) = repository.strip_prefix(prefix) else {
		return Err(Error::invalid_argument(format!(
			"repository '{repository}' does not start with plugin prefix '{prefix}'"
		)));
	};
	let rest = rest.strip_prefix('/').unwrap_or(rest);
	if rest.is_empty() {
		return Err(Error::invalid_argument(format!(
			"repository '{repository}' has no name after prefix '{prefix}'"
		)));
	}
	if rest.split('/').any(|segment| segment.is_empty()) {
		return Err(Error::invalid_argument(format!(
			"repository '{repository}' contains an empty path segment"
		)));
	}
	Ok(())
}

/// The `RepoHandler` state machine (spec §4.9, invariant #4 in §8).
///
/// `Ready` is the only state another non-`Ready` state may be entered from;
/// `Deleting` is terminal, and is "sticky" — once set, further
/// state-change requests fail with `AlreadyExists` rather than being queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerState {
	Stopped,
	Ready,
	Provisioning,
	Syncing,
	Deleting,
}

impl HandlerState {
	/// Whether transitioning from `self` to `target` is legal per spec §4.9:
	/// "Only `ready ↔ X`. Concurrent transition requests fail with
	/// `Unavailable`. `deleting` is sticky."
	pub fn can_transition_to(self, target: HandlerState) -> bool {
		use HandlerState::*;
		match (self, target) {
			// Stopped -> Ready happens once, on Start().
			(Stopped, Ready) => true,
			// Ready -> any non-ready state, and the documented Ready -> Ready no-op.
			(Ready, Provisioning | Syncing | Deleting | Ready) => true,
			// Any non-ready state returns to Ready when its work completes.
			(Provisioning | Syncing, Ready) => true,
			// Deleting is terminal; it only ever resolves to Stopped via cleanup.
			(Deleting, Stopped) => true,
			_ => false,
		}
	}
}

impl fmt::Display for HandlerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			HandlerState::Stopped => "stopped",
			HandlerState::Ready => "ready",
			HandlerState::Provisioning => "provisioning",
			HandlerState::Syncing => "syncing",
			HandlerState::Deleting => "deleting",
		};
		f.write_str(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn validates_repository_names_under_prefix() {
		assert!(validate_repository_name("artifacts/yum", "artifacts/yum/epel").is_ok());
		assert!(validate_repository_name("artifacts/yum", "artifacts/yum/epel/8").is_ok());
		assert!(validate_repository_name("artifacts/yum", "artifacts/yum").is_err());
		assert!(validate_repository_name("artifacts/yum", "artifacts/yum/").is_err());
		assert!(validate_repository_name("artifacts/yum", "artifacts/rpm/epel").is_err());
		assert!(validate_repository_name("artifacts/yum", "artifacts/yum//8").is_err());
	}

	#[test]
	fn state_machine_rejects_non_ready_to_non_ready_transitions() {
		use HandlerState::*;
		assert!(Ready.can_transition_to(Syncing));
		assert!(Syncing.can_transition_to(Ready));
		assert!(!Syncing.can_transition_to(Provisioning));
		assert!(!Provisioning.can_transition_to(Deleting));
	}

	#[test]
	fn deleting_is_sticky_and_terminal() {
		use HandlerState::*;
		assert!(!Deleting.can_transition_to(Ready));
		assert!(!Deleting.can_transition_to(Syncing));
		assert!(Deleting.can_transition_to(Stopped));
	}

	#[test]
	fn ready_to_ready_is_a_documented_no_op() {
		// spec §9 open question: confirmed as intentional guard, not a bug.
		assert!(HandlerState::Ready.can_transition_to(HandlerState::Ready));
	}
}
