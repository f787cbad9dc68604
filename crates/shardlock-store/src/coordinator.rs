//! Process-local leader election for sweep timers.
//!
//! Every provider instance registers here. Within one session type at most
//! one registered timer is enabled; when the enabled instance leaves, the
//! timer is handed to the first remaining instance that asked for one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::{debug, info};

/// Start/stop handle for a periodic sweep.
pub trait TimerControl: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Whether the timer is currently running.
    fn is_enabled(&self) -> bool;
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

struct Registration {
    id: InstanceId,
    session_type: String,
    timer: Option<Arc<dyn TimerControl>>,
    enabled: bool,
}

impl Registration {
    fn attempted(&self) -> bool {
        self.timer.is_some()
    }
}

static GLOBAL: LazyLock<Arc<SweeperCoordinator>> =
    LazyLock::new(|| Arc::new(SweeperCoordinator::new()));

/// Registry of live provider instances, grouped by session type.
///
/// All registry reads and writes, including the timer start and stop they
/// trigger, happen under one lock.
pub struct SweeperCoordinator {
    instances: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for SweeperCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SweeperCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweeperCoordinator")
            .field("instances", &self.instances.lock().len())
            .finish()
    }
}

impl SweeperCoordinator {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide coordinator.
    pub fn global() -> Arc<SweeperCoordinator> {
        Arc::clone(&GLOBAL)
    }

    /// Register an instance. A `timer` marks it as wanting to sweep; the
    /// timer is started right away if no other instance of `session_type`
    /// already has an enabled one.
    pub fn register(
        &self,
        session_type: &str,
        timer: Option<Arc<dyn TimerControl>>,
    ) -> InstanceId {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut instances = self.instances.lock();

        let leader_exists = instances
            .iter()
            .any(|r| r.session_type == session_type && r.attempted() && r.enabled);

        let mut enabled = false;
        if let Some(timer) = &timer {
            if leader_exists {
                debug!(%id, session_type, "Sweep timer deferred to existing leader");
            } else {
                timer.start();
                enabled = true;
                info!(%id, session_type, "Instance elected sweep leader");
            }
        }

        instances.push(Registration {
            id,
            session_type: session_type.to_string(),
            timer,
            enabled,
        });
        id
    }

    /// Remove an instance, stopping its timer. If it was the leader, the
    /// first remaining same-type instance that asked for a timer takes over;
    /// its id is returned.
    pub fn unregister(&self, id: InstanceId) -> Option<InstanceId> {
        let mut instances = self.instances.lock();
        let position = instances.iter().position(|r| r.id == id)?;
        let leaving = instances.remove(position);

        if let Some(timer) = &leaving.timer {
            timer.stop();
        }
        if !leaving.enabled {
            debug!(%id, "Instance unregistered");
            return None;
        }

        let successor = instances.iter_mut().find(|r| {
            r.session_type == leaving.session_type && r.attempted() && !r.enabled
        })?;
        if let Some(timer) = &successor.timer {
            timer.start();
        }
        successor.enabled = true;
        info!(
            from = %id,
            to = %successor.id,
            session_type = %leaving.session_type,
            "Sweep leadership handed off"
        );
        Some(successor.id)
    }

    /// Whether `id` currently holds the enabled timer.
    pub fn is_enabled(&self, id: InstanceId) -> bool {
        self.instances
            .lock()
            .iter()
            .any(|r| r.id == id && r.enabled)
    }

    /// The instance running the sweep for `session_type`, if any.
    pub fn leader(&self, session_type: &str) -> Option<InstanceId> {
        self.instances
            .lock()
            .iter()
            .find(|r| r.session_type == session_type && r.enabled)
            .map(|r| r.id)
    }

    pub fn instance_count(&self, session_type: &str) -> usize {
        self.instances
            .lock()
            .iter()
            .filter(|r| r.session_type == session_type)
            .count()
    }
}
