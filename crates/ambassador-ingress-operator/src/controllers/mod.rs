//! Controllers driving reconciliation

pub mod clusteringress;
pub mod retry;
pub mod sweep;

use std::sync::Arc;

use crate::config::OperatorConfig;
use crate::store::ObjectStore;

use retry::RetryTracker;

/// Shared state for the controller and the sweep
pub struct ControllerContext {
    /// Object store access
    pub store: Arc<dyn ObjectStore>,
    /// Operator configuration, fixed at startup
    pub config: Arc<OperatorConfig>,
    /// Per-object retry counters for backoff
    pub retry_tracker: Arc<RetryTracker>,
}
