pub mod arbiter;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod logger;
pub mod registry;
pub mod session;
pub mod shared_state;

pub use arbiter::ResourceArbiter;
pub use clock::{Clock, SystemClock};
pub use config::AppConfig;
pub use error::{CoreError, CoreResult};
pub use event_bus::{EventBus, Envelope};
pub use logger::{AuditSink, StructuredLogger};
pub use registry::ModelRegistry;
pub use session::SessionStore;
pub use shared_state::{InMemorySharedState, SharedState};
