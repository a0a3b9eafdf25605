//! Fragment ingestion engine.
//!
//! Decides, for every recording discovered by polling a surveillance server,
//! which time range to fetch next, when the recording is fully delivered and
//! how to recover from fetch and delivery failures. Progress is persisted to
//! a JSON state file after every change.
//!
//! The remote services are reached only through the traits in
//! [`collaborators`].

pub mod caption;
pub mod clock;
pub mod collaborators;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{DeliverySink, DurationProbe, FragmentFetcher, RecordingSource};
pub use error::{Error, Result};
pub use model::{FragmentProgress, LocalClip, Recording};
pub use reconcile::{CycleReport, ReconcileConfig, Reconciler};
pub use scheduler::{FragmentScheduler, SchedulerConfig, StepOutcome};
pub use store::{ProgressStore, StoreConfig, StoreStats};
