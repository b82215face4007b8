// SPDX-License-Identifier: Apache-2.0

//! Per-node plugin registration, rendezvous-hashed routing, and reverse
//! proxying (spec §4.6, §4.7).
//!
//! Grounded on `hipcheck/src/plugin/manager.rs`'s `PluginExecutor` — the
//! same backoff-and-retry shape used there to connect to a freshly spawned
//! gRPC plugin process is reused here to fetch `/info` over mTLS from a
//! plugin that announced itself over gossip. The transport itself changes:
//! the teacher spawns a child process and dials it over gRPC, while here
//! plugins are peer *nodes* reached over reverse-proxied HTTPS, since
//! nothing in this cluster ever spawns a subprocess.

mod descriptor;
mod manager;
mod plugin;
mod route;

pub use descriptor::PluginInfo;
pub use manager::PluginManager;
pub use plugin::Plugin;
pub use route::{PrefixRule, PrefixTable, RouteDecision, RoutePolicy, RouteRequest};
