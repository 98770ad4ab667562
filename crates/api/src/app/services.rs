use std::sync::Arc;
use std::time::Duration;

use relayq_infra::jobs::StatusReconciler;
use relayq_infra::store::JobStore;
use relayq_observability::Metrics;

/// Deadline for one status callback.
pub const STATUS_CALLBACK_TIMEOUT: Duration = Duration::from_secs(25);

pub type DynJobStore = Arc<dyn JobStore>;

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub store: DynJobStore,
    pub reconciler: StatusReconciler<DynJobStore>,
    pub callback_timeout: Duration,
}

impl AppServices {
    pub fn new(store: DynJobStore, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            reconciler: StatusReconciler::new(store.clone(), metrics),
            store,
            callback_timeout: STATUS_CALLBACK_TIMEOUT,
        }
    }

    /// Replace the default reconciler (e.g. with the dispatcher's).
    pub fn with_reconciler(mut self, reconciler: StatusReconciler<DynJobStore>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }
}
