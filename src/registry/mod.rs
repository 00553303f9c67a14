//! Module registry.
//!
//! Maps routing prefixes to live backend modules. Readers load an immutable
//! snapshot from an [`ArcSwap`] and never block; writers serialize on a mutex,
//! build the next snapshot and swap it in. Instance health lives in shared
//! [`HealthTracker`]s, so probes update it without touching the snapshot.

pub mod health;
pub mod prefix;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use health::{HealthMetrics, HealthState, HealthTracker};

use crate::config::RegistryConfig;
use crate::trust::{CertSubject, Role};
use crate::{Error, Result};

/// Registration payload: one instance of a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module id
    pub id: String,
    /// Routing prefix under the module root
    pub prefix: String,
    /// Backend `host:port`
    pub address: String,
    /// Identity the backend's server certificate must carry
    pub cert_identity: String,
}

impl ModuleDescriptor {
    /// Validate every field against the registry rules
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPrefix` or `Error::InvalidDescriptor`.
    pub fn validate(&self, module_root: &str) -> Result<()> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            return Err(Error::InvalidDescriptor(format!(
                "module id '{}' must be non-empty [A-Za-z0-9-_]",
                self.id
            )));
        }
        prefix::validate(&self.prefix, module_root)?;
        let valid_address = self
            .address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0));
        if !valid_address {
            return Err(Error::InvalidDescriptor(format!(
                "address '{}' must be host:port",
                self.address
            )));
        }
        CertSubject::new(&self.cert_identity, Role::Server)
            .validate()
            .map_err(|e| Error::InvalidDescriptor(e.to_string()))
    }
}

/// One backend instance of a module
#[derive(Debug, Clone)]
pub struct Instance {
    /// Backend `host:port`
    pub address: String,
    /// Shared health tracker
    pub health: Arc<HealthTracker>,
}

/// A registered module
#[derive(Debug, Clone)]
pub struct ModuleEntry {
    /// Module id
    pub id: String,
    /// Routing prefix
    pub prefix: String,
    /// Expected backend certificate identity
    pub cert_identity: String,
    /// Backend instances, in registration order
    pub instances: Vec<Instance>,
    /// First registration time
    pub registered_at: DateTime<Utc>,
    cursor: Arc<AtomicUsize>,
}

impl ModuleEntry {
    /// Unhealthy iff every instance is; healthy if any is; unknown otherwise
    #[must_use]
    pub fn health(&self) -> HealthState {
        let states: Vec<HealthState> = self.instances.iter().map(|i| i.health.state()).collect();
        if states.iter().any(|s| *s == HealthState::Healthy) {
            HealthState::Healthy
        } else if !states.is_empty() && states.iter().all(|s| *s == HealthState::Unhealthy) {
            HealthState::Unhealthy
        } else {
            HealthState::Unknown
        }
    }

    /// Round-robin over instances that are not unhealthy, skipping `exclude`
    #[must_use]
    pub fn pick(&self, exclude: Option<&str>) -> Option<&Instance> {
        let usable: Vec<&Instance> = self
            .instances
            .iter()
            .filter(|i| i.health.state() != HealthState::Unhealthy)
            .filter(|i| Some(i.address.as_str()) != exclude)
            .collect();
        if usable.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(usable[n % usable.len()])
    }

    /// Serializable view for the registry API
    #[must_use]
    pub fn view(&self) -> ModuleView {
        ModuleView {
            id: self.id.clone(),
            prefix: self.prefix.clone(),
            cert_identity: self.cert_identity.clone(),
            health: self.health(),
            registered_at: self.registered_at,
            instances: self
                .instances
                .iter()
                .map(|i| InstanceView {
                    address: i.address.clone(),
                    health: i.health.metrics(),
                })
                .collect(),
        }
    }
}

/// Registry API representation of a module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleView {
    /// Module id
    pub id: String,
    /// Routing prefix
    pub prefix: String,
    /// Expected backend identity
    pub cert_identity: String,
    /// Aggregate health
    pub health: HealthState,
    /// First registration time
    pub registered_at: DateTime<Utc>,
    /// Instances with their probe metrics
    pub instances: Vec<InstanceView>,
}

/// Registry API representation of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    /// Backend `host:port`
    pub address: String,
    /// Probe metrics
    pub health: HealthMetrics,
}

/// A last-writer-wins replacement at an exact prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixConflict {
    /// Contested prefix
    pub prefix: String,
    /// Module that lost the prefix
    pub previous: String,
    /// Module that now owns it
    pub current: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// What a registration changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RegistrationOutcome {
    /// New module
    Created,
    /// New instance merged into an existing module
    InstanceAdded,
    /// Identical registration, nothing changed
    Unchanged,
    /// Same id with a different prefix or identity
    Replaced {
        /// Prefix the module had before
        previous_prefix: String,
    },
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    by_id: HashMap<String, Arc<ModuleEntry>>,
    /// prefix -> module id
    by_prefix: HashMap<String, String>,
}

/// Registry of live modules
#[derive(Debug)]
pub struct ModuleRegistry {
    snapshot: ArcSwap<Snapshot>,
    write: Mutex<()>,
    conflicts: Mutex<VecDeque<PrefixConflict>>,
    module_root: String,
    conflict_history: usize,
    unhealthy_threshold: u32,
}

impl ModuleRegistry {
    /// Empty registry
    #[must_use]
    pub fn new(config: &RegistryConfig, unhealthy_threshold: u32) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            write: Mutex::new(()),
            conflicts: Mutex::new(VecDeque::new()),
            module_root: config.module_root.clone(),
            conflict_history: config.conflict_history.max(1),
            unhealthy_threshold,
        }
    }

    /// Module root every prefix lives under
    #[must_use]
    pub fn module_root(&self) -> &str {
        &self.module_root
    }

    /// Register one instance of a module.
    ///
    /// - exact prefix held by another module: last writer wins, conflict recorded
    /// - nested prefix held by another live module: `DuplicatePrefix`
    /// - same id, same prefix and identity: address merged into the instances
    /// - same id, different prefix or identity: entry replaced
    ///
    /// # Errors
    ///
    /// Returns a validation error or `Error::DuplicatePrefix`.
    pub fn register(&self, descriptor: &ModuleDescriptor) -> Result<RegistrationOutcome> {
        self.register_checked(descriptor, |_| Ok(()))
    }

    /// Like [`ModuleRegistry::register`], but `may_displace` is asked about
    /// every entry the registration would replace or take the prefix from:
    /// the existing entry with the same id and the module holding the exact
    /// prefix. It runs under the write lock, so the answer cannot go stale.
    ///
    /// # Errors
    ///
    /// Returns the error of `may_displace`, a validation error or
    /// `Error::DuplicatePrefix`. The table is unchanged on error.
    pub fn register_checked<F>(
        &self,
        descriptor: &ModuleDescriptor,
        may_displace: F,
    ) -> Result<RegistrationOutcome>
    where
        F: Fn(&ModuleEntry) -> Result<()>,
    {
        descriptor.validate(&self.module_root)?;
        let _write = self.write.lock();
        let current = self.snapshot.load_full();

        if let Some(existing) = current.by_id.get(&descriptor.id) {
            may_displace(existing)?;
        }
        if let Some(holder) = current
            .by_prefix
            .get(&descriptor.prefix)
            .filter(|owner| **owner != descriptor.id)
            .and_then(|owner| current.by_id.get(owner))
        {
            may_displace(holder)?;
        }

        for (owned_prefix, owner) in &current.by_prefix {
            if owner == &descriptor.id || !prefix::overlaps(owned_prefix, &descriptor.prefix) {
                continue;
            }
            let live = current
                .by_id
                .get(owner)
                .is_some_and(|e| e.health() != HealthState::Unhealthy);
            if live {
                return Err(Error::DuplicatePrefix {
                    prefix: descriptor.prefix.clone(),
                    existing: owner.clone(),
                    existing_prefix: owned_prefix.clone(),
                });
            }
        }

        let mut next = (*current).clone();
        let outcome = match current.by_id.get(&descriptor.id) {
            Some(existing)
                if existing.prefix == descriptor.prefix
                    && existing.cert_identity == descriptor.cert_identity =>
            {
                if existing
                    .instances
                    .iter()
                    .any(|i| i.address == descriptor.address)
                {
                    debug!(module = %descriptor.id, address = %descriptor.address, "Registration unchanged");
                    return Ok(RegistrationOutcome::Unchanged);
                }
                let mut entry = (**existing).clone();
                entry.instances.push(self.instance(descriptor));
                next.by_id.insert(entry.id.clone(), Arc::new(entry));
                RegistrationOutcome::InstanceAdded
            }
            Some(existing) => {
                next.by_prefix.remove(&existing.prefix);
                let previous_prefix = existing.prefix.clone();
                next.by_id
                    .insert(descriptor.id.clone(), Arc::new(self.entry(descriptor)));
                RegistrationOutcome::Replaced { previous_prefix }
            }
            None => {
                next.by_id
                    .insert(descriptor.id.clone(), Arc::new(self.entry(descriptor)));
                RegistrationOutcome::Created
            }
        };

        if let Some(previous) = next
            .by_prefix
            .get(&descriptor.prefix)
            .filter(|owner| **owner != descriptor.id)
            .cloned()
        {
            next.by_id.remove(&previous);
            warn!(
                prefix = %descriptor.prefix,
                previous = %previous,
                module = %descriptor.id,
                "Prefix taken over by newer registration"
            );
            self.record_conflict(PrefixConflict {
                prefix: descriptor.prefix.clone(),
                previous,
                current: descriptor.id.clone(),
                at: Utc::now(),
            });
        }
        next.by_prefix
            .insert(descriptor.prefix.clone(), descriptor.id.clone());
        self.snapshot.store(Arc::new(next));

        info!(
            module = %descriptor.id,
            prefix = %descriptor.prefix,
            address = %descriptor.address,
            outcome = ?outcome,
            "Module registered"
        );
        Ok(outcome)
    }

    /// Remove a module with all its instances
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the id is unknown.
    pub fn deregister(&self, module_id: &str) -> Result<Arc<ModuleEntry>> {
        let _write = self.write.lock();
        let current = self.snapshot.load_full();
        let Some(entry) = current.by_id.get(module_id).cloned() else {
            return Err(Error::NotFound(format!("module '{module_id}'")));
        };
        let mut next = (*current).clone();
        next.by_id.remove(module_id);
        next.by_prefix.remove(&entry.prefix);
        self.snapshot.store(Arc::new(next));
        info!(module = %module_id, prefix = %entry.prefix, "Module deregistered");
        Ok(entry)
    }

    /// Remove one instance; the module goes with its last instance.
    /// Returns `true` if the whole module was removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the module or address is unknown.
    pub fn deregister_instance(&self, module_id: &str, address: &str) -> Result<bool> {
        let _write = self.write.lock();
        let current = self.snapshot.load_full();
        let Some(existing) = current.by_id.get(module_id) else {
            return Err(Error::NotFound(format!("module '{module_id}'")));
        };
        if !existing.instances.iter().any(|i| i.address == address) {
            return Err(Error::NotFound(format!(
                "instance '{address}' of module '{module_id}'"
            )));
        }

        let mut next = (*current).clone();
        let mut entry = (**existing).clone();
        entry.instances.retain(|i| i.address != address);
        let removed = entry.instances.is_empty();
        if removed {
            next.by_id.remove(module_id);
            next.by_prefix.remove(&entry.prefix);
        } else {
            next.by_id.insert(module_id.to_string(), Arc::new(entry));
        }
        self.snapshot.store(Arc::new(next));
        info!(module = %module_id, address = %address, module_removed = removed, "Instance deregistered");
        Ok(removed)
    }

    /// Longest whole-segment prefix match
    ///
    /// # Errors
    ///
    /// Returns `Error::RouteNotFound` if no module claims the path.
    pub fn resolve(&self, path: &str) -> Result<Arc<ModuleEntry>> {
        let snapshot = self.snapshot.load();
        prefix::candidates(path)
            .find_map(|candidate| snapshot.by_prefix.get(candidate))
            .and_then(|id| snapshot.by_id.get(id))
            .cloned()
            .ok_or_else(|| Error::RouteNotFound(path.to_string()))
    }

    /// Resolve and refuse unhealthy modules; returns the entry and the
    /// path with the prefix stripped.
    ///
    /// # Errors
    ///
    /// `Error::RouteNotFound` or `Error::ServiceUnavailable`.
    pub fn route<'p>(&self, path: &'p str) -> Result<(Arc<ModuleEntry>, &'p str)> {
        let entry = self.resolve(path)?;
        if entry.health() == HealthState::Unhealthy {
            return Err(Error::ServiceUnavailable(entry.id.clone()));
        }
        let rest = prefix::strip(&entry.prefix, path);
        Ok((entry, rest))
    }

    /// Module by id
    #[must_use]
    pub fn get(&self, module_id: &str) -> Option<Arc<ModuleEntry>> {
        self.snapshot.load().by_id.get(module_id).cloned()
    }

    /// All modules, sorted by id
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<ModuleEntry>> {
        let mut all: Vec<_> = self.snapshot.load().by_id.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of registered modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().by_id.len()
    }

    /// Whether no module is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded prefix conflicts, oldest first
    #[must_use]
    pub fn conflicts(&self) -> Vec<PrefixConflict> {
        self.conflicts.lock().iter().cloned().collect()
    }

    /// Remove modules whose every instance failed at least `evict_after`
    /// probes in a row. Returns the removed ids. `0` disables eviction.
    pub fn evict_failed(&self, evict_after: u32) -> Vec<String> {
        if evict_after == 0 {
            return Vec::new();
        }
        let doomed: Vec<String> = self
            .entries()
            .into_iter()
            .filter(|e| {
                !e.instances.is_empty()
                    && e.instances
                        .iter()
                        .all(|i| i.health.consecutive_failures() >= evict_after)
            })
            .map(|e| e.id.clone())
            .collect();
        doomed
            .into_iter()
            .filter(|id| self.deregister(id).is_ok())
            .inspect(|id| warn!(module = %id, evict_after, "Evicted failing module"))
            .collect()
    }

    fn instance(&self, descriptor: &ModuleDescriptor) -> Instance {
        Instance {
            address: descriptor.address.clone(),
            health: Arc::new(HealthTracker::new(
                &format!("{}@{}", descriptor.id, descriptor.address),
                self.unhealthy_threshold,
            )),
        }
    }

    fn entry(&self, descriptor: &ModuleDescriptor) -> ModuleEntry {
        ModuleEntry {
            id: descriptor.id.clone(),
            prefix: descriptor.prefix.clone(),
            cert_identity: descriptor.cert_identity.clone(),
            instances: vec![self.instance(descriptor)],
            registered_at: Utc::now(),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record_conflict(&self, conflict: PrefixConflict) {
        let mut conflicts = self.conflicts.lock();
        if conflicts.len() >= self.conflict_history {
            conflicts.pop_front();
        }
        conflicts.push_back(conflict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new(&RegistryConfig::default(), 3)
    }

    fn descriptor(id: &str, prefix: &str, address: &str) -> ModuleDescriptor {
        ModuleDescriptor {
            id: id.into(),
            prefix: prefix.into(),
            address: address.into(),
            cert_identity: format!("{id}-service"),
        }
    }

    #[test]
    fn resolve_uses_longest_segment_prefix() {
        // GIVEN: nested prefixes owned by the same module family
        let reg = registry();
        reg.register(&descriptor("lcm", "/admin/v1/modules/lcm", "lcm:8443"))
            .unwrap();
        reg.register(&descriptor("ipam", "/admin/v1/modules/ipam", "ipam:8443"))
            .unwrap();

        // WHEN/THEN: resolution is segment-aligned
        assert_eq!(
            reg.resolve("/admin/v1/modules/ipam/v1/subnets/5").unwrap().id,
            "ipam"
        );
        assert!(matches!(
            reg.resolve("/admin/v1/modules/ipamx/v1"),
            Err(Error::RouteNotFound(_))
        ));
    }

    #[test]
    fn same_descriptor_twice_is_unchanged() {
        let reg = registry();
        let d = descriptor("ipam", "/admin/v1/modules/ipam", "ipam:8443");
        assert_eq!(reg.register(&d).unwrap(), RegistrationOutcome::Created);
        assert_eq!(reg.register(&d).unwrap(), RegistrationOutcome::Unchanged);
        assert_eq!(reg.get("ipam").unwrap().instances.len(), 1);
    }

    #[test]
    fn new_address_is_merged_as_instance() {
        let reg = registry();
        reg.register(&descriptor("ipam", "/admin/v1/modules/ipam", "ipam-a:8443"))
            .unwrap();
        let outcome = reg
            .register(&descriptor("ipam", "/admin/v1/modules/ipam", "ipam-b:8443"))
            .unwrap();
        assert_eq!(outcome, RegistrationOutcome::InstanceAdded);
        assert_eq!(reg.get("ipam").unwrap().instances.len(), 2);

        assert!(!reg.deregister_instance("ipam", "ipam-a:8443").unwrap());
        assert!(reg.deregister_instance("ipam", "ipam-b:8443").unwrap());
        assert!(reg.get("ipam").is_none());
    }

    #[test]
    fn changing_prefix_replaces_entry() {
        let reg = registry();
        reg.register(&descriptor("docs", "/admin/v1/modules/docs", "docs:8443"))
            .unwrap();
        let outcome = reg
            .register(&descriptor("docs", "/admin/v1/modules/documents", "docs:8443"))
            .unwrap();
        assert_eq!(
            outcome,
            RegistrationOutcome::Replaced {
                previous_prefix: "/admin/v1/modules/docs".into()
            }
        );
        assert!(reg.resolve("/admin/v1/modules/docs/x").is_err());
        assert_eq!(reg.resolve("/admin/v1/modules/documents/x").unwrap().id, "docs");
    }

    #[test]
    fn nested_prefix_of_live_module_is_rejected() {
        let reg = registry();
        reg.register(&descriptor("lcm", "/admin/v1/modules/lcm", "lcm:8443"))
            .unwrap();
        let err = reg
            .register(&descriptor("certs", "/admin/v1/modules/lcm/certs", "c:8443"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePrefix { ref existing, .. } if existing == "lcm"));
    }

    #[test]
    fn nested_prefix_of_unhealthy_module_is_allowed() {
        let reg = registry();
        reg.register(&descriptor("lcm", "/admin/v1/modules/lcm", "lcm:8443"))
            .unwrap();
        let tracker = reg.get("lcm").unwrap().instances[0].health.clone();
        for _ in 0..3 {
            tracker.record_failure();
        }
        reg.register(&descriptor("certs", "/admin/v1/modules/lcm/certs", "c:8443"))
            .unwrap();
        assert_eq!(reg.resolve("/admin/v1/modules/lcm/certs/1").unwrap().id, "certs");
    }

    #[test]
    fn route_refuses_unhealthy_and_strips_prefix() {
        let reg = registry();
        reg.register(&descriptor("vault", "/admin/v1/modules/vault", "vault:8443"))
            .unwrap();
        let (entry, rest) = reg.route("/admin/v1/modules/vault/v1/secrets").unwrap();
        assert_eq!(entry.id, "vault");
        assert_eq!(rest, "/v1/secrets");

        for _ in 0..3 {
            entry.instances[0].health.record_failure();
        }
        assert!(matches!(
            reg.route("/admin/v1/modules/vault/v1/secrets"),
            Err(Error::ServiceUnavailable(_))
        ));

        entry.instances[0].health.record_success(Duration::from_millis(1));
        assert!(reg.route("/admin/v1/modules/vault/v1/secrets").is_ok());
    }

    #[test]
    fn entry_health_aggregates_instances() {
        let reg = registry();
        reg.register(&descriptor("ipam", "/admin/v1/modules/ipam", "a:1"))
            .unwrap();
        reg.register(&descriptor("ipam", "/admin/v1/modules/ipam", "b:1"))
            .unwrap();
        let entry = reg.get("ipam").unwrap();
        assert_eq!(entry.health(), HealthState::Unknown);

        for _ in 0..3 {
            entry.instances[0].health.record_failure();
        }
        assert_eq!(entry.health(), HealthState::Unknown);
        assert_eq!(entry.pick(None).unwrap().address, "b:1");
        assert!(entry.pick(Some("b:1")).is_none());

        entry.instances[1].health.record_success(Duration::ZERO);
        assert_eq!(entry.health(), HealthState::Healthy);
    }

    #[test]
    fn eviction_removes_modules_failing_everywhere() {
        let reg = registry();
        reg.register(&descriptor("docs", "/admin/v1/modules/docs", "docs:8443"))
            .unwrap();
        let tracker = reg.get("docs").unwrap().instances[0].health.clone();
        for _ in 0..5 {
            tracker.record_failure();
        }
        assert!(reg.evict_failed(0).is_empty());
        assert!(reg.evict_failed(6).is_empty());
        assert_eq!(reg.evict_failed(5), vec!["docs".to_string()]);
        assert!(reg.is_empty());
    }

    #[test]
    fn descriptor_validation_rejects_bad_fields() {
        let root = "/admin/v1/modules";
        let mut d = descriptor("ipam", "/admin/v1/modules/ipam", "ipam:8443");
        d.validate(root).unwrap();

        d.address = "ipam".into();
        assert!(matches!(d.validate(root), Err(Error::InvalidDescriptor(_))));
        d.address = "ipam:8443".into();
        d.id = "ip am".into();
        assert!(matches!(d.validate(root), Err(Error::InvalidDescriptor(_))));
        d.id = "ipam".into();
        d.prefix = "/elsewhere/ipam".into();
        assert!(matches!(d.validate(root), Err(Error::InvalidPrefix { .. })));
    }
}
