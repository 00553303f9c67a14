//! Router endpoints: health and the registration API.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use super::auth::Caller;
use crate::registry::{HealthState, ModuleDescriptor, RegistrationOutcome};
use crate::trust::PeerIdentity;
use crate::{Error, Result};

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries = state.registry.entries();
    let healthy = entries
        .iter()
        .filter(|e| e.health() == HealthState::Healthy)
        .count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "modules": entries.len(),
        "healthy_modules": healthy,
    }))
}

/// GET /admin/v1/registry/modules
pub async fn list_modules(State(state): State<Arc<AppState>>, caller: Caller) -> Result<Response> {
    caller.require()?;
    let modules: Vec<_> = state.registry.entries().iter().map(|e| e.view()).collect();
    Ok(Json(json!({
        "modules": modules,
        "conflicts": state.registry.conflicts(),
    }))
    .into_response())
}

/// POST /admin/v1/registry/modules
pub async fn register_module(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(descriptor): Json<ModuleDescriptor>,
) -> Result<Response> {
    let peer = caller.require()?;
    authorize(&state, peer, &descriptor.cert_identity, &descriptor.id)?;

    // Replacing an entry or taking its prefix needs its owner's rights too.
    let outcome = state.registry.register_checked(&descriptor, |displaced| {
        authorize(&state, peer, &displaced.cert_identity, &displaced.id)
    })?;
    if matches!(outcome, RegistrationOutcome::Replaced { .. }) {
        state.upstreams.invalidate(&descriptor.id);
    }
    // Modules displaced by a prefix takeover lose their pools too.
    state.upstreams.prune(&state.registry);

    let status = match outcome {
        RegistrationOutcome::Created => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    let mut body = serde_json::to_value(&outcome)?;
    body["module"] = json!(state.registry.get(&descriptor.id).map(|e| e.view()));
    Ok((status, Json(body)).into_response())
}

/// Query of DELETE /admin/v1/registry/modules/{id}
#[derive(Debug, Default, Deserialize)]
pub struct DeregisterParams {
    /// Remove only this instance
    pub address: Option<String>,
}

/// DELETE /admin/v1/registry/modules/{id}
pub async fn deregister_module(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(module_id): Path<String>,
    Query(params): Query<DeregisterParams>,
) -> Result<Response> {
    let peer = caller.require()?;
    let entry = state
        .registry
        .get(&module_id)
        .ok_or_else(|| Error::NotFound(format!("module '{module_id}'")))?;
    authorize(&state, peer, &entry.cert_identity, &module_id)?;

    let module_removed = match params.address {
        Some(address) => state.registry.deregister_instance(&module_id, &address)?,
        None => {
            state.registry.deregister(&module_id)?;
            true
        }
    };
    if module_removed {
        state.upstreams.invalidate(&module_id);
    }
    Ok(Json(json!({ "module": module_id, "module_removed": module_removed })).into_response())
}

/// A module may manage its own entry; admin identities may manage any.
fn authorize(state: &AppState, peer: &PeerIdentity, cert_identity: &str, module_id: &str) -> Result<()> {
    let admin = state
        .admin_identities
        .iter()
        .any(|a| peer.matches(a));
    if admin || peer.matches(cert_identity) {
        info!(client = %peer.display_name, module = %module_id, admin, "Registry change authorized");
        return Ok(());
    }
    warn!(client = %peer.display_name, module = %module_id, "Registry change denied");
    Err(Error::Forbidden(format!(
        "'{}' may not manage module '{module_id}'",
        peer.identity()
    )))
}
