//! Shared application state
//!
//! `AppState` hands every route handler the same set of orchestration
//! components: the session store, the signed event bus, the resource
//! arbiter, the model registry, and the three job queues (segmentation,
//! ROAST, the second simulator).

use std::sync::Arc;

use mri_core::{AppConfig, AuditSink, EventBus, ModelRegistry, ResourceArbiter, SessionStore, SharedState, StructuredLogger};
use mri_scheduler::{RoastRunner, SegmentationScheduler, SimNibsRunner, SimulationScheduler};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ModelRegistry>,
    pub events: Arc<EventBus>,
    pub arbiter: Arc<ResourceArbiter>,
    pub shared: Arc<dyn SharedState>,
    pub logger: Arc<StructuredLogger>,
    pub audit: Arc<AuditSink>,
    pub segmentation: Arc<SegmentationScheduler>,
    pub roast: Arc<SimulationScheduler<RoastRunner>>,
    pub simnibs: Arc<SimulationScheduler<SimNibsRunner>>,
}
