// MCP Gateway - service registry
//! Authoritative in-memory index of configured services.
//!
//! Records are stored as `Arc<ServiceRecord>` and replaced wholesale on every
//! write, so readers always see either the old or the new record, never a
//! partially updated one. Listeners (adapter pool, session hub) are notified
//! synchronously after the write lock is released and before the mutating
//! call returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock, RwLock, Weak};

use regex::Regex;

use crate::error::GatewayError;
use crate::models::{HealthState, ServiceRecord};

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap_or_else(|e| panic!("slug regex: {e}"))
});

/// Derives a routing slug from a human name: lowercase ASCII alphanumerics,
/// runs of anything else collapsed to one `-`.
pub fn slugify(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            result.push(ch.to_ascii_lowercase());
        } else if !result.is_empty() && !result.ends_with('-') {
            result.push('-');
        }
    }
    let mut slug = result.trim_end_matches('-').to_string();
    slug.truncate(64);
    slug.trim_end_matches('-').to_string()
}

pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_RE.is_match(slug)
}

/// Reactions to registry writes. All methods run synchronously on the writer.
pub trait RegistryListener: Send + Sync {
    fn service_disabled(&self, _record: &ServiceRecord) {}
    fn service_enabled(&self, _record: &ServiceRecord) {}
    fn service_removed(&self, _record: &ServiceRecord) {}
    /// Transport configuration changed; live adapters are stale.
    fn service_reconfigured(&self, _record: &ServiceRecord) {}
}

#[derive(Default)]
struct Index {
    by_id: BTreeMap<i64, Arc<ServiceRecord>>,
    by_slug: HashMap<String, i64>,
}

enum Change {
    Disabled(Arc<ServiceRecord>),
    Enabled(Arc<ServiceRecord>),
    Removed(Arc<ServiceRecord>),
    Reconfigured(Arc<ServiceRecord>),
}

#[derive(Default)]
pub struct ServiceRegistry {
    index: RwLock<Index>,
    listeners: RwLock<Vec<Weak<dyn RegistryListener>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from an injected snapshot. Invalid records are
    /// logged and skipped.
    pub fn from_records(records: impl IntoIterator<Item = ServiceRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            let id = record.id;
            if let Err(e) = registry.upsert(record) {
                tracing::warn!(service_id = id, "registry: skipping service record: {}", e);
            }
        }
        registry
    }

    pub fn add_listener(&self, listener: Weak<dyn RegistryListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    pub fn get(&self, slug: &str) -> Result<Arc<ServiceRecord>, GatewayError> {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        index
            .by_slug
            .get(slug)
            .and_then(|id| index.by_id.get(id))
            .cloned()
            .ok_or_else(|| GatewayError::ServiceNotFound {
                service: slug.to_string(),
            })
    }

    pub fn get_by_id(&self, id: i64) -> Option<Arc<ServiceRecord>> {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        index.by_id.get(&id).cloned()
    }

    /// All records ordered by id.
    pub fn list(&self) -> Vec<Arc<ServiceRecord>> {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        index.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|p| p.into_inner()).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggles a service. Disabling sets health to `Stopped` and tears down
    /// live adapters and sessions before returning.
    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<Arc<ServiceRecord>, GatewayError> {
        let (record, change) = {
            let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
            let current = index.by_id.get(&id).ok_or_else(|| GatewayError::ServiceNotFound {
                service: id.to_string(),
            })?;
            if current.enabled == enabled {
                return Ok(current.clone());
            }
            let mut next = (**current).clone();
            next.enabled = enabled;
            next.health = if enabled {
                HealthState::Unknown
            } else {
                HealthState::Stopped
            };
            let next = Arc::new(next);
            index.by_id.insert(id, next.clone());
            let change = if enabled {
                Change::Enabled(next.clone())
            } else {
                Change::Disabled(next.clone())
            };
            (next, change)
        };

        tracing::info!(
            service = %record.slug,
            service_id = id,
            "registry: service {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.notify(change);
        Ok(record)
    }

    /// Writes the health field. Disabled services stay `Stopped`; returns
    /// whether the write was applied.
    pub fn set_health(&self, id: i64, health: HealthState) -> bool {
        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
        let Some(current) = index.by_id.get(&id) else {
            return false;
        };
        if current.health == health {
            return true;
        }
        if !current.enabled && health != HealthState::Stopped {
            return false;
        }
        let previous = current.health;
        let mut next = (**current).clone();
        next.health = health;
        index.by_id.insert(id, Arc::new(next));
        drop(index);

        tracing::debug!(service_id = id, "registry: health {} -> {}", previous, health);
        true
    }

    /// Inserts or replaces a record. The slug is derived from the name when
    /// empty and must be unique.
    pub fn upsert(&self, mut record: ServiceRecord) -> Result<Arc<ServiceRecord>, GatewayError> {
        if record.slug.is_empty() {
            record.slug = slugify(&record.name);
        }
        if !is_valid_slug(&record.slug) {
            return Err(GatewayError::BadRequest(format!(
                "invalid service slug '{}'",
                record.slug
            )));
        }

        let (stored, changes) = {
            let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
            if let Some(owner) = index.by_slug.get(&record.slug)
                && *owner != record.id
            {
                return Err(GatewayError::BadRequest(format!(
                    "slug '{}' is already used by service {}",
                    record.slug, owner
                )));
            }

            let previous = index.by_id.get(&record.id).cloned();
            if let Some(prev) = &previous {
                // Health is owned by the gateway, never by the config writer.
                record.health = if record.enabled {
                    prev.health
                } else {
                    HealthState::Stopped
                };
                if prev.slug != record.slug {
                    index.by_slug.remove(&prev.slug);
                }
            } else if !record.enabled {
                record.health = HealthState::Stopped;
            }

            let stored = Arc::new(record);
            index.by_slug.insert(stored.slug.clone(), stored.id);
            index.by_id.insert(stored.id, stored.clone());

            let mut changes = Vec::new();
            if let Some(prev) = previous {
                if prev.enabled && !stored.enabled {
                    changes.push(Change::Disabled(stored.clone()));
                } else if prev.transport != stored.transport {
                    changes.push(Change::Reconfigured(stored.clone()));
                } else if !prev.enabled && stored.enabled {
                    changes.push(Change::Enabled(stored.clone()));
                }
            }
            (stored, changes)
        };

        for change in changes {
            self.notify(change);
        }
        Ok(stored)
    }

    pub fn remove(&self, id: i64) -> Option<Arc<ServiceRecord>> {
        let removed = {
            let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
            let removed = index.by_id.remove(&id)?;
            index.by_slug.remove(&removed.slug);
            removed
        };
        tracing::info!(service = %removed.slug, service_id = id, "registry: service removed");
        self.notify(Change::Removed(removed.clone()));
        Some(removed)
    }

    fn notify(&self, change: Change) {
        let listeners: Vec<Arc<dyn RegistryListener>> = {
            let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner());
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            match &change {
                Change::Disabled(r) => listener.service_disabled(r),
                Change::Enabled(r) => listener.service_enabled(r),
                Change::Removed(r) => listener.service_removed(r),
                Change::Reconfigured(r) => listener.service_reconfigured(r),
            }
        }
    }
}
