//! Background health probes.
//!
//! Every `interval` each instance of each module gets a `GET {path}` over
//! the module's mTLS pool. A 2xx within `timeout` counts as success; anything
//! else as failure. Probes bypass the pool semaphore so a saturated module is
//! not marked unhealthy for being busy.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::AppState;
use crate::config::HealthCheckConfig;
use crate::registry::{Instance, ModuleEntry};

/// Start the probe loop; it stops when `cancel` fires
pub fn spawn_health_probes(state: Arc<AppState>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = state.health_check.clone();
        if !config.enabled {
            debug!("Health probes disabled");
            return;
        }
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => probe_all(&state, &config).await,
            }
        }
        debug!("Health probes stopped");
    })
}

/// One probe round over every registered instance, then eviction
pub async fn probe_all(state: &AppState, config: &HealthCheckConfig) {
    let entries = state.registry.entries();
    let probes = entries.iter().flat_map(|entry| {
        entry
            .instances
            .iter()
            .map(move |instance| probe_once(state, entry, instance, config))
    });
    join_all(probes).await;

    let evicted = state.registry.evict_failed(state.evict_after);
    if !evicted.is_empty() {
        info!(modules = ?evicted, "Evicted modules after repeated probe failures");
        state.upstreams.prune(&state.registry);
    }
}

/// Probe one instance and record the outcome. Returns `true` on success.
pub async fn probe_once(
    state: &AppState,
    entry: &ModuleEntry,
    instance: &Instance,
    config: &HealthCheckConfig,
) -> bool {
    let started = Instant::now();
    let outcome = match state.upstreams.pool(entry) {
        Ok(pool) => {
            let url = format!("https://{}{}", instance.address, config.path);
            match pool.client.get(url).timeout(config.timeout).send().await {
                Ok(response) if response.status().is_success() => Ok(()),
                Ok(response) => Err(format!("status {}", response.status().as_u16())),
                Err(e) => Err(e.to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    match outcome {
        Ok(()) => {
            instance.health.record_success(started.elapsed());
            true
        }
        Err(reason) => {
            let failures = instance.health.record_failure();
            debug!(
                module = %entry.id,
                instance = %instance.address,
                failures,
                reason = %reason,
                "Health probe failed"
            );
            false
        }
    }
}
