// SPDX-License-Identifier: Apache-2.0

//! Shared types for Beskar: the error taxonomy (spec §7), the `EventPayload`
//! wire schema (spec §6), node identity (spec §3), and the repository
//! naming/state-machine primitives every other crate in the workspace
//! builds on.

pub mod error;
pub mod event;
pub mod node;
pub mod repository;

pub use error::{Error, ErrorKind, Result};
pub use event::{Action, Event, EventPayload};
pub use node::{HostPort, Node, NodeMetadata};
pub use repository::{validate_repository_name, HandlerState};
