// SPDX-License-Identifier: Apache-2.0

//! Gates the plugin manager's `/artifacts/{plugin}/...` REST surface with
//! [`beskar_auth::AccessController`] (spec §4.6 "direct REST calls", §4.12).
//!
//! The OCI registry's own push/pull edge is a separate, out-of-scope process
//! and attaches its own access records from parsed OCI routes (spec §1); this
//! middleware only covers the direct REST surface this node agent itself
//! exposes, treating the `{plugin}` path segment as the resource name and the
//! HTTP method as the OCI-style action.

use crate::server::PeerIdentity;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use beskar_auth::{AccessController, AccessDecision, AccessRecord, Action, RequestCredentials, ResourceType};
use std::sync::Arc;

fn action_for(method: &Method) -> Action {
	match *method {
		Method::GET | Method::HEAD => Action::Pull,
		Method::DELETE => Action::Delete,
		_ => Action::Push,
	}
}

fn parse_basic_auth(header: &str) -> Option<(String, String)> {
	let encoded = header.strip_prefix("Basic ")?;
	let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
	let text = String::from_utf8(decoded).ok()?;
	let (user, pass) = text.split_once(':')?;
	Some((user.to_string(), pass.to_string()))
}

pub async fn require_access(
	State(controller): State<Arc<AccessController>>,
	Path((plugin, _rest)): Path<(String, String)>,
	request: Request<Body>,
	next: Next,
) -> Response {
	let record = AccessRecord {
		resource_type: ResourceType::Repository,
		name: plugin,
		actions: vec![action_for(request.method())],
	};

	let basic = request
		.headers()
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(parse_basic_auth);

	let peer_identity = request.extensions().get::<PeerIdentity>().map(|id| id.0.clone());

	let decision = controller.authorize(
		&record,
		&RequestCredentials {
			verified_peer_sni: peer_identity.as_deref(),
			basic_auth: basic.as_ref().map(|(u, p)| (u.as_str(), p.as_str())),
		},
	);

	match decision {
		AccessDecision::Allowed => next.run(request).await,
		AccessDecision::Denied { www_authenticate } => {
			(StatusCode::UNAUTHORIZED, [(axum::http::header::WWW_AUTHENTICATE, www_authenticate)]).into_response()
		}
	}
}
