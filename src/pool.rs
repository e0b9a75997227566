// MCP Gateway - adapter pool
//! Owns every live [`Connection`], one slot per service id.
//!
//! The first request to find a slot empty takes the slot's spawn lock and
//! launches; concurrent requests wait on the same lock and then reuse the
//! connection it produced, so a service never has two live adapters.
//! A watcher task per connection mirrors adapter state into the registry and
//! applies the restart policy when the upstream dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::adapter::launcher::Launcher;
use crate::adapter::restart::{CrashHistory, RestartDecision, RestartPolicy};
use crate::adapter::Connection;
use crate::error::GatewayError;
use crate::models::{AdapterState, HealthState, ServiceRecord};
use crate::registry::{RegistryListener, ServiceRegistry};

#[derive(Default)]
struct PoolSlot {
    spawn_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Connection>>>,
    crashes: Mutex<CrashHistory>,
    /// Restart ceiling reached; only an admin restart or re-enable clears it.
    stopped: AtomicBool,
}

impl PoolSlot {
    fn live(&self) -> Option<Arc<Connection>> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .filter(|c| c.is_alive())
    }

    fn take(&self) -> Option<Arc<Connection>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Clears the slot only if it still holds `conn`.
    fn clear_if(&self, conn: &Arc<Connection>) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            *current = None;
        }
    }
}

pub struct AdapterPool {
    registry: Arc<ServiceRegistry>,
    launcher: Arc<dyn Launcher>,
    policy: RestartPolicy,
    slots: Mutex<HashMap<i64, Arc<PoolSlot>>>,
    launches: AtomicU64,
    shutdown: CancellationToken,
}

impl AdapterPool {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        launcher: Arc<dyn Launcher>,
        policy: RestartPolicy,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            registry: registry.clone(),
            launcher,
            policy,
            slots: Mutex::new(HashMap::new()),
            launches: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        let listener: Arc<dyn RegistryListener> = pool.clone();
        registry.add_listener(Arc::downgrade(&listener));
        pool
    }

    fn slot(&self, id: i64) -> Arc<PoolSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(id).or_default().clone()
    }

    fn existing_slot(&self, id: i64) -> Option<Arc<PoolSlot>> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(&id).cloned()
    }

    /// Live connection for a service, if one is running.
    pub fn live(&self, id: i64) -> Option<Arc<Connection>> {
        self.existing_slot(id)?.live()
    }

    pub fn live_count(&self) -> usize {
        let slots: Vec<Arc<PoolSlot>> = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.values().cloned().collect()
        };
        slots.iter().filter(|s| s.live().is_some()).count()
    }

    /// Total launch attempts since startup.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Crashes (including failed launches) inside the restart window.
    pub fn crash_count(&self, id: i64) -> usize {
        self.existing_slot(id).map_or(0, |slot| {
            slot.crashes
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .count(&self.policy, Instant::now())
        })
    }

    pub fn is_stopped(&self, id: i64) -> bool {
        self.existing_slot(id)
            .is_some_and(|slot| slot.stopped.load(Ordering::Acquire))
    }

    /// Returns the live connection or launches one. Concurrent callers for
    /// the same service share a single launch.
    pub async fn get_or_spawn(
        self: &Arc<Self>,
        record: &ServiceRecord,
    ) -> Result<Arc<Connection>, GatewayError> {
        if !record.enabled {
            return Err(GatewayError::ServiceDisabled {
                service: record.slug.clone(),
            });
        }
        let slot = self.slot(record.id);
        if let Some(conn) = slot.live() {
            return Ok(conn);
        }
        self.ensure_not_stopped(&slot, record)?;

        let _guard = slot.spawn_lock.lock().await;
        if let Some(conn) = slot.live() {
            return Ok(conn);
        }
        let record = self.current_record(record)?;
        self.ensure_not_stopped(&slot, &record)?;
        self.spawn_locked(&slot, &record).await
    }

    fn ensure_not_stopped(&self, slot: &PoolSlot, record: &ServiceRecord) -> Result<(), GatewayError> {
        if slot.stopped.load(Ordering::Acquire) {
            return Err(GatewayError::ServiceUnavailable {
                service: record.slug.clone(),
                reason: "restart limit reached".into(),
            });
        }
        Ok(())
    }

    /// Fresh copy of the record, refusing if it was disabled or removed meanwhile.
    fn current_record(&self, record: &ServiceRecord) -> Result<Arc<ServiceRecord>, GatewayError> {
        let current = self
            .registry
            .get_by_id(record.id)
            .ok_or_else(|| GatewayError::ServiceNotFound {
                service: record.slug.clone(),
            })?;
        if !current.enabled {
            return Err(GatewayError::ServiceDisabled {
                service: current.slug.clone(),
            });
        }
        Ok(current)
    }

    /// Caller holds `slot.spawn_lock`.
    async fn spawn_locked(
        self: &Arc<Self>,
        slot: &Arc<PoolSlot>,
        record: &ServiceRecord,
    ) -> Result<Arc<Connection>, GatewayError> {
        let id = record.id;
        self.registry.set_health(id, HealthState::Starting);
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::info!(service = %record.slug, service_id = id, "pool: launching adapter");

        let conn = match self.launcher.launch(record).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(service = %record.slug, service_id = id, "pool: launch failed: {}", err);
                self.registry.set_health(id, HealthState::Unhealthy);
                self.record_crash(slot, record);
                return Err(err);
            }
        };

        *slot.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(conn.clone());

        // A disable that raced the launch may have missed this connection.
        let still_wanted = self
            .registry
            .get_by_id(id)
            .is_some_and(|r| r.enabled && r.transport == record.transport);
        if !still_wanted {
            slot.clear_if(&conn);
            let err = GatewayError::ServiceDisabled {
                service: record.slug.clone(),
            };
            conn.close(err.clone());
            return Err(err);
        }

        self.registry.set_health(id, HealthState::Healthy);
        tokio::spawn(self.clone().watch(slot.clone(), conn.clone()));
        Ok(conn)
    }

    async fn watch(self: Arc<Self>, slot: Arc<PoolSlot>, conn: Arc<Connection>) {
        let id = conn.service_id();
        let mut rx = conn.watch_state();
        let mut previous = AdapterState::Running;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                AdapterState::Degraded if previous != AdapterState::Degraded => {
                    // Probes may already have escalated past Degraded.
                    let escalated = self
                        .registry
                        .get_by_id(id)
                        .is_some_and(|r| r.health == HealthState::Unhealthy);
                    if !escalated {
                        self.registry.set_health(id, HealthState::Degraded);
                    }
                }
                AdapterState::Running if previous == AdapterState::Degraded => {
                    self.registry.set_health(id, HealthState::Healthy);
                }
                AdapterState::Crashed => {
                    slot.clear_if(&conn);
                    self.on_crash(&slot, &conn);
                    return;
                }
                AdapterState::Stopped => {
                    slot.clear_if(&conn);
                    return;
                }
                _ => {}
            }
            previous = state;
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Records a crash; gives up past the ceiling. Returns the decision.
    fn record_crash(&self, slot: &PoolSlot, record: &ServiceRecord) -> RestartDecision {
        let decision = slot
            .crashes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(&self.policy, Instant::now());
        if let RestartDecision::GiveUp { crashes } = decision {
            slot.stopped.store(true, Ordering::Release);
            self.registry.set_health(record.id, HealthState::Stopped);
            tracing::error!(
                service = %record.slug,
                service_id = record.id,
                "pool: {} crashes within {:?}, service stopped until restarted by an admin",
                crashes,
                self.policy.window
            );
        }
        decision
    }

    fn on_crash(self: &Arc<Self>, slot: &Arc<PoolSlot>, crashed: &Arc<Connection>) {
        let id = crashed.service_id();
        let Some(record) = self.registry.get_by_id(id) else {
            return;
        };
        if !record.enabled || self.shutdown.is_cancelled() {
            return;
        }
        // A retry already replaced the dead adapter; its health is current.
        if slot.live().is_some_and(|live| !Arc::ptr_eq(&live, crashed)) {
            tracing::debug!(service = %record.slug, service_id = id, "pool: crash already superseded");
            return;
        }
        self.registry.set_health(id, HealthState::Unhealthy);
        let RestartDecision::Respawn { attempt, delay } = self.record_crash(slot, &record) else {
            return;
        };

        tracing::info!(
            service = %record.slug,
            service_id = id,
            "pool: respawning in {}ms (attempt {})",
            delay.as_millis(),
            attempt
        );
        let pool = self.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = pool.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let _guard = slot.spawn_lock.lock().await;
            if slot.live().is_some() || slot.stopped.load(Ordering::Acquire) {
                return;
            }
            let Some(record) = pool.registry.get_by_id(id).filter(|r| r.enabled) else {
                return;
            };
            if let Err(e) = pool.spawn_locked(&slot, &record).await {
                tracing::warn!(service = %record.slug, service_id = id, "pool: respawn failed: {}", e);
            }
        });
    }

    /// Admin restart: forgets crash history, tears down the live adapter and
    /// launches a fresh one.
    pub async fn restart(self: &Arc<Self>, id: i64) -> Result<Arc<Connection>, GatewayError> {
        let record = self
            .registry
            .get_by_id(id)
            .ok_or_else(|| GatewayError::ServiceNotFound {
                service: id.to_string(),
            })?;
        let slot = self.slot(id);
        {
            let _guard = slot.spawn_lock.lock().await;
            slot.crashes.lock().unwrap_or_else(|p| p.into_inner()).reset();
            slot.stopped.store(false, Ordering::Release);
            if let Some(conn) = slot.take() {
                conn.close(GatewayError::ServiceUnavailable {
                    service: record.slug.clone(),
                    reason: "restarting".into(),
                });
            }
        }
        tracing::info!(service = %record.slug, service_id = id, "pool: admin restart");
        self.registry.set_health(id, HealthState::Unknown);
        self.get_or_spawn(&record).await
    }

    /// Closes a service's adapter without touching its crash accounting.
    pub fn teardown(&self, id: i64, reason: GatewayError) {
        if let Some(conn) = self.existing_slot(id).and_then(|slot| slot.take()) {
            conn.close(reason);
        }
    }

    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
        let slots: Vec<(i64, Arc<PoolSlot>)> = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.iter().map(|(id, s)| (*id, s.clone())).collect()
        };
        for (id, slot) in slots {
            if let Some(conn) = slot.take() {
                conn.close(GatewayError::ServiceUnavailable {
                    service: conn.service().to_string(),
                    reason: "gateway shutting down".into(),
                });
                tracing::debug!(service_id = id, "pool: adapter closed for shutdown");
            }
        }
    }

    fn forget_failures(&self, id: i64) {
        if let Some(slot) = self.existing_slot(id) {
            slot.crashes.lock().unwrap_or_else(|p| p.into_inner()).reset();
            slot.stopped.store(false, Ordering::Release);
        }
    }
}

impl RegistryListener for AdapterPool {
    fn service_disabled(&self, record: &ServiceRecord) {
        self.teardown(
            record.id,
            GatewayError::ServiceDisabled {
                service: record.slug.clone(),
            },
        );
    }

    fn service_enabled(&self, record: &ServiceRecord) {
        self.forget_failures(record.id);
    }

    fn service_removed(&self, record: &ServiceRecord) {
        self.teardown(
            record.id,
            GatewayError::ServiceDisabled {
                service: record.slug.clone(),
            },
        );
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&record.id);
    }

    fn service_reconfigured(&self, record: &ServiceRecord) {
        self.forget_failures(record.id);
        self.teardown(
            record.id,
            GatewayError::ServiceUnavailable {
                service: record.slug.clone(),
                reason: "service reconfigured".into(),
            },
        );
    }
}
