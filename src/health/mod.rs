pub mod breaker;
pub mod clock;
pub mod ewma;
pub mod monitor;
pub mod record;
pub mod report;
pub mod store;

pub use breaker::{Admission, HalfOpenProbe};
pub use clock::{Clock, ManualClock, SystemClock};
pub use monitor::{CallOutcome, HealthMonitor, HealthSettings};
pub use record::{BreakerState, ProviderHealth, ProviderTunables};
pub use report::{build_report, HealthReport, ProviderStatus, PublicProviderHealth};
pub use store::{HealthStore, MemoryHealthStore};
