//! Leadership controller. The election service is external; this side only
//! reacts to its callbacks, starting the engines and loops on gain and
//! stopping them in reverse order on loss. Both transitions are idempotent.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::{info, warn};

/// A component whose lifetime follows leadership.
pub trait LeaderLifecycle: Send + Sync {
    /// Starts the component; called on leadership gain.
    fn start(&self);
    /// Stops the component; called on leadership loss. Must be idempotent
    /// and bounded.
    fn stop(&self);
    fn name(&self) -> &'static str;
}

pub struct LeadershipController {
    id: String,
    lifecycles: Mutex<Vec<Arc<dyn LeaderLifecycle>>>,
    leading: AtomicBool,
}

impl LeadershipController {
    pub fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            lifecycles: Mutex::new(vec![]),
            leading: AtomicBool::new(false),
        })
    }

    /// Registers a lifecycle; components start in registration order and
    /// stop in reverse.
    pub fn register(&self, lifecycle: Arc<dyn LeaderLifecycle>) {
        self.lifecycles.lock().unwrap().push(lifecycle);
    }

    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    /// Election callback: this instance became the leader.
    pub fn gained_leadership(&self) {
        if self.leading.swap(true, Ordering::SeqCst) {
            warn!(id = %self.id, "already leading, ignoring gain callback");
            return;
        }
        info!(id = %self.id, "gained leadership");
        for lifecycle in self.lifecycles.lock().unwrap().iter() {
            info!(component = lifecycle.name(), "starting");
            lifecycle.start();
        }
    }

    /// Election callback: leadership moved elsewhere.
    pub fn lost_leadership(&self) {
        if !self.leading.swap(false, Ordering::SeqCst) {
            warn!(id = %self.id, "not leading, ignoring loss callback");
            return;
        }
        info!(id = %self.id, "lost leadership");
        for lifecycle in self.lifecycles.lock().unwrap().iter().rev() {
            info!(component = lifecycle.name(), "stopping");
            lifecycle.stop();
        }
    }

    /// Election callback: clean shutdown of this instance.
    pub fn shutdown(&self) {
        info!(id = %self.id, "resigning leadership");
        self.lost_leadership();
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}
