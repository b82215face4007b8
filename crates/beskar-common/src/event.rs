// SPDX-License-Identifier: Apache-2.0

//! The `EventPayload` wire schema (spec §6) and the in-memory `Event` record
//! derived from it (spec §3).
//!
//! `EventPayload` is what crosses the wire on `POST /event`; `Event` is what
//! a `RepoHandler` persists and replays. Keeping them as distinct types
//! (rather than reusing one struct for both) means the wire format can grow
//! fields without touching the status-DB schema, and vice versa.

use serde::{Deserialize, Serialize};

/// The action a manifest event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
	Put,
	Delete,
}

impl Action {
	pub fn as_str(self) -> &'static str {
		match self {
			Action::Put => "PUT",
			Action::Delete => "DELETE",
		}
	}
}

/// The body of `POST /event`, as specified in spec §6.
///
/// Encoded with `bincode` over the wire (`Content-Type:
/// application/octet-stream`) rather than JSON: events are on the hot path
/// of every manifest push, and a fixed binary encoding avoids re-deriving a
/// JSON schema for what is, field for field, already a flat record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
	pub digest: String,
	pub mediatype: String,
	pub repository: String,
	pub action: Action,
	pub payload: Vec<u8>,
}

impl EventPayload {
	pub fn encode(&self) -> Vec<u8> {
		bincode::serialize(self).expect("EventPayload always encodes")
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
		bincode::deserialize(bytes)
	}
}

/// An event as persisted in a handler's status DB (spec §3 "Event").
///
/// Distinct from `EventPayload` in that it carries a monotonically
/// increasing `seq`, assigned at enqueue time, used as `lastIndex` on
/// restart (spec §4.9) and as the natural processing order within a
/// repository (spec §5 "Per repository, events are processed in the order
/// they are enqueued").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	pub seq: u64,
	pub payload: EventPayload,
}

impl Event {
	pub fn new(seq: u64, payload: EventPayload) -> Self {
		Event { seq, payload }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_payload_round_trips_through_encoding() {
		let original = EventPayload {
			digest: "sha256:abc123".to_string(),
			mediatype: "application/vnd.oci.image.manifest.v1+json".to_string(),
			repository: "artifacts/yum/epel".to_string(),
			action: Action::Put,
			payload: vec![1, 2, 3, 4],
		};

		let encoded = original.encode();
		let decoded = EventPayload::decode(&encoded).expect("decode");
		assert_eq!(original, decoded);
	}

	#[test]
	fn action_str_matches_wire_convention() {
		assert_eq!(Action::Put.as_str(), "PUT");
		assert_eq!(Action::Delete.as_str(), "DELETE");
	}
}
