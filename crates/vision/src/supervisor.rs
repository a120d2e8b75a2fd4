//! Health monitoring and bounded recovery for registered components.
//!
//! The supervisor polls every registered health check on its own
//! [`PeriodicTask`]. Two consecutive failures trigger the component's recovery
//! handler; a component that keeps failing after `max_recovery_attempts`
//! recoveries is parked in [`ComponentStatus::Failed`] until it is reset or
//! registered again.

use std::{
    collections::{BTreeMap, HashMap},
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    periodic::{PeriodicTask, panic_message},
    retry::{RetryError, RetryPolicy},
};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Consecutive failures before recovery is attempted.
const RECOVERY_THRESHOLD: u32 = 2;

/// Health check or recovery handler. `Ok(true)` means healthy / recovered.
pub type Callback = Box<dyn Fn() -> anyhow::Result<bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Unknown,
    Initializing,
    Healthy,
    Degraded,
    Failed,
    Recovering,
}

impl ComponentStatus {
    pub fn label(self) -> &'static str {
        match self {
            ComponentStatus::Unknown => "unknown",
            ComponentStatus::Initializing => "initializing",
            ComponentStatus::Healthy => "healthy",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::Failed => "failed",
            ComponentStatus::Recovering => "recovering",
        }
    }

    /// Numeric level exported as a gauge; higher is worse.
    fn gauge_value(self) -> f64 {
        match self {
            ComponentStatus::Healthy => 0.0,
            ComponentStatus::Unknown | ComponentStatus::Initializing => 1.0,
            ComponentStatus::Recovering => 2.0,
            ComponentStatus::Degraded => 3.0,
            ComponentStatus::Failed => 4.0,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Health record of one supervised component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub recovery_attempts: u32,
}

impl ComponentHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: ComponentStatus::Unknown,
            last_check: None,
            consecutive_failures: 0,
            total_failures: 0,
            last_error: None,
            recovery_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Critical => "critical",
            OverallStatus::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: OverallStatus,
    pub total_components: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthSummary {
    fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let count = |status| components.values().filter(|c| c.status == status).count();
        let total_components = components.len();
        let healthy = count(ComponentStatus::Healthy);
        let degraded = count(ComponentStatus::Degraded);
        let failed = count(ComponentStatus::Failed);

        let status = if failed > 0 {
            OverallStatus::Critical
        } else if degraded > 0 {
            OverallStatus::Degraded
        } else if total_components > 0 && healthy == total_components {
            OverallStatus::Healthy
        } else {
            OverallStatus::Unknown
        };

        Self {
            status,
            total_components,
            healthy,
            degraded,
            failed,
            components,
        }
    }
}

struct Slot {
    health_check: Callback,
    recovery: Option<Callback>,
    health: Mutex<ComponentHealth>,
}

impl Slot {
    fn health(&self) -> std::sync::MutexGuard<'_, ComponentHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Registry {
    components: Mutex<HashMap<String, Arc<Slot>>>,
    max_recovery_attempts: u32,
    /// Retries inside one recovery attempt.
    recovery_policy: RetryPolicy,
}

impl Registry {
    /// Snapshot of the slots, sorted by name. The registry lock is released
    /// before any callback runs.
    fn slots(&self) -> Vec<(String, Arc<Slot>)> {
        let guard = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        let mut slots: Vec<_> = guard
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();
        drop(guard);
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    fn slot(&self, name: &str) -> Option<Arc<Slot>> {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn run_cycle(&self) {
        let span = info_span!("supervisor.cycle");
        let _guard = span.enter();
        for (name, slot) in self.slots() {
            let healthy = self.check(&name, &slot);
            metrics::counter!("supervisor_checks_total", "component" => name.clone()).increment(1);
            if !healthy && slot.health().consecutive_failures >= RECOVERY_THRESHOLD {
                self.recover(&name, &slot);
            }
            let status = slot.health().status;
            metrics::gauge!("component_status", "component" => name).set(status.gauge_value());
        }
    }

    fn check(&self, name: &str, slot: &Slot) -> bool {
        let outcome = invoke(&slot.health_check);
        let mut health = slot.health();
        health.last_check = Some(Utc::now());

        match outcome {
            Ok(true) => {
                if matches!(
                    health.status,
                    ComponentStatus::Failed | ComponentStatus::Recovering
                ) {
                    info!(component = name, "component recovered");
                }
                health.status = ComponentStatus::Healthy;
                health.consecutive_failures = 0;
                health.last_error = None;
                true
            }
            outcome => {
                if let Err(err) = outcome {
                    warn!(component = name, "health check errored: {err:#}");
                    health.last_error = Some(format!("{err:#}"));
                }
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.total_failures = health.total_failures.saturating_add(1);
                if health.status != ComponentStatus::Failed {
                    warn!(
                        component = name,
                        consecutive = health.consecutive_failures,
                        "health check failed"
                    );
                    health.status = ComponentStatus::Degraded;
                }
                false
            }
        }
    }

    fn recover(&self, name: &str, slot: &Slot) {
        let Some(handler) = slot.recovery.as_ref() else {
            warn!(component = name, "no recovery handler registered");
            return;
        };

        let attempt = {
            let mut health = slot.health();
            if health.recovery_attempts >= self.max_recovery_attempts {
                if health.status != ComponentStatus::Failed {
                    error!(
                        component = name,
                        max_attempts = self.max_recovery_attempts,
                        "recovery attempts exhausted"
                    );
                }
                health.status = ComponentStatus::Failed;
                return;
            }
            health.status = ComponentStatus::Recovering;
            health.recovery_attempts += 1;
            health.recovery_attempts
        };

        info!(component = name, attempt, "attempting recovery");
        metrics::counter!("supervisor_recoveries_total", "component" => name.to_owned())
            .increment(1);
        let operation = format!("{name} recovery");
        let outcome = self
            .recovery_policy
            .retry(&operation, || match invoke(handler)? {
                true => Ok(()),
                false => Err(anyhow!("recovery reported failure")),
            });

        let mut health = slot.health();
        match outcome {
            Ok(()) => {
                info!(component = name, attempt, "recovery succeeded");
                health.status = ComponentStatus::Healthy;
                health.consecutive_failures = 0;
                health.last_error = None;
            }
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                error!(component = name, attempt, tries = attempts, "recovery failed: {last:#}");
                health.status = ComponentStatus::Failed;
                health.last_error = Some(format!("{last:#}"));
            }
        }
    }
}

/// Run a callback, turning a panic into an error.
fn invoke(callback: &Callback) -> anyhow::Result<bool> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(&*payload))),
    }
}

/// Polls registered components and drives their recovery.
pub struct ComponentSupervisor {
    registry: Arc<Registry>,
    task: PeriodicTask,
}

impl Default for ComponentSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_RECOVERY_ATTEMPTS)
    }
}

impl ComponentSupervisor {
    /// Supervisor whose recovery handlers get a single try per attempt.
    pub fn new(check_interval: Duration, max_recovery_attempts: u32) -> Self {
        Self::with_recovery_policy(
            check_interval,
            max_recovery_attempts,
            RetryPolicy::immediate(1),
        )
    }

    /// Each recovery attempt runs the handler under `recovery_policy`.
    pub fn with_recovery_policy(
        check_interval: Duration,
        max_recovery_attempts: u32,
        recovery_policy: RetryPolicy,
    ) -> Self {
        let registry = Arc::new(Registry {
            components: Mutex::new(HashMap::new()),
            max_recovery_attempts,
            recovery_policy,
        });
        let cycle_registry = registry.clone();
        let task = PeriodicTask::new("supervisor", check_interval, move || {
            cycle_registry.run_cycle();
        });
        Self { registry, task }
    }

    /// Register a component without a recovery handler.
    ///
    /// Registering an existing name replaces it with a fresh record.
    pub fn register<C>(&self, name: &str, health_check: C)
    where
        C: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.insert(name, Box::new(health_check), None);
    }

    pub fn register_with_recovery<C, R>(&self, name: &str, health_check: C, recovery: R)
    where
        C: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
        R: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.insert(name, Box::new(health_check), Some(Box::new(recovery)));
    }

    fn insert(&self, name: &str, health_check: Callback, recovery: Option<Callback>) {
        let slot = Arc::new(Slot {
            health_check,
            recovery,
            health: Mutex::new(ComponentHealth::new(name)),
        });
        let replaced = self
            .registry
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), slot)
            .is_some();
        info!(component = name, replaced, "component registered");
    }

    /// Returns whether a component by that name was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .registry
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!(component = name, "component unregistered");
        }
        removed
    }

    /// Return a component to its freshly registered state.
    pub fn reset_component(&self, name: &str) -> bool {
        let Some(slot) = self.registry.slot(name) else {
            return false;
        };
        *slot.health() = ComponentHealth::new(name);
        info!(component = name, "component health reset");
        true
    }

    pub fn component_status(&self, name: &str) -> Option<ComponentHealth> {
        self.registry.slot(name).map(|slot| slot.health().clone())
    }

    pub fn statuses(&self) -> BTreeMap<String, ComponentHealth> {
        self.registry
            .slots()
            .into_iter()
            .map(|(name, slot)| {
                let health = slot.health().clone();
                (name, health)
            })
            .collect()
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary::from_components(self.statuses())
    }

    /// Run one monitoring pass on the calling thread.
    pub fn run_cycle(&self) {
        self.registry.run_cycle();
    }

    pub fn start(&self) -> io::Result<()> {
        if !self.task.is_running() {
            debug!(interval_ms = self.task.interval().as_millis() as u64, "starting supervisor");
        }
        self.task.start()
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}
