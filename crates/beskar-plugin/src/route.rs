// SPDX-License-Identifier: Apache-2.0

//! The plugin routing policy boundary (spec §4.7, §9 redesign flag: "expose
//! a narrow `RouteDecision` interface; implementations ... are
//! interchangeable").
//!
//! Whatever engine a plugin kind uses to decide routing — an embedded
//! policy VM, compiled rules, a static table — it need only produce a
//! [`RouteDecision`] from a [`RouteRequest`]. This crate ships one
//! implementation, [`PrefixTable`], sufficient for path-prefix-to-repository
//! extraction; concrete plugin bodies are free to supply their own.

use std::fmt;

/// The subset of an incoming HTTP request a routing policy needs.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
	pub method: &'a str,
	pub path: &'a str,
	pub remote_addr: &'a str,
}

/// The outcome of evaluating a routing policy against a request (spec
/// §4.7 step 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
	/// No route matched; respond 404.
	NotFound,
	/// Respond 301 to this URL.
	Redirect(String),
	/// Route by this repository name.
	Repository(String),
	/// No repository could be extracted; route by the caller's remote
	/// address instead (spec §4.7: "otherwise -> route key = client remote
	/// address").
	RemoteAddr,
}

/// A routing policy: deterministic function from request to decision.
/// Implementations may hold arbitrary internal state (a compiled rule set,
/// an embedded VM); the trait only fixes the observable contract.
pub trait RoutePolicy: Send + Sync + fmt::Debug {
	fn decide(&self, request: &RouteRequest<'_>) -> RouteDecision;
}

/// A single ordered rule: requests whose path starts with `prefix` extract
/// the repository name from the next `depth` path segments after it.
#[derive(Debug, Clone)]
pub struct PrefixRule {
	pub prefix: String,
	pub segments: usize,
}

/// A static, ordered table of [`PrefixRule`]s — the simplest policy engine
/// satisfying spec §4.7's contract, and the default when a plugin doesn't
/// need anything smarter.
#[derive(Debug, Clone, Default)]
pub struct PrefixTable {
	rules: Vec<PrefixRule>,
}

impl PrefixTable {
	pub fn new(rules: Vec<PrefixRule>) -> Self {
		PrefixTable { rules }
	}
}

impl RoutePolicy for PrefixTable {
	fn decide(&self, request: &RouteRequest<'_>) -> RouteDecision {
		let trimmed = request.path.trim_start_matches('/');
		for rule in &self.rules {
			let rule_prefix = rule.prefix.trim_start_matches('/').trim_end_matches('/');
			let Some(rest) = trimmed.strip_prefix(rule_prefix) else {
				continue;
			};
			let rest = rest.trim_start_matches('/');
			if rest.is_empty() {
				return RouteDecision::RemoteAddr;
			}
			let segments: Vec<&str> = rest.split('/').take(rule.segments).collect();
			if segments.len() < rule.segments {
				return RouteDecision::RemoteAddr;
			}
			let repository = format!("{}/{}", rule_prefix, segments.join("/"));
			return RouteDecision::Repository(repository);
		}
		RouteDecision::NotFound
	}
}
