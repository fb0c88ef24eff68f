//! keel Scheduler Library
//!
//! The scheduler keeps a set of stateful pods running on a cluster whose
//! resource manager hands out offers. It evaluates offers against the pods
//! its plans want deployed, reserves what it needs under its own role,
//! creates persistent volumes, and launches tasks.
//!
//! ## Architecture
//!
//! ```text
//! transport ──events──▶ SchedulerWorker ──▶ Scheduler
//!                                             ├── PlanCoordinator (deploy, custom, recovery)
//!                                             ├── Evaluator       (offer -> operations)
//!                                             ├── ResourceCleaner (orphaned reservations)
//!                                             └── StateStore      (SQLite)
//! ```
//!
//! ## Modules
//!
//! - `evaluate`: Offer evaluation and operation construction
//! - `scheduler`: Offer cycle, status routing and operator commands
//! - `state`: Local SQLite state persistence
//! - `volume`: External volume drivers

pub mod cleaner;
pub mod config;
pub mod evaluate;
pub mod scheduler;
pub mod spec;
pub mod state;
pub mod transport;
pub mod volume;

// Re-export commonly used types
pub use evaluate::{EvaluationError, EvaluationOutcome, Evaluator, UnmetRequirement};
pub use scheduler::{Command, CycleStats, Scheduler, SchedulerError, SchedulerWorker};
pub use spec::{ServiceSpec, SpecError};
pub use state::StateStore;
pub use transport::{JsonLinesTransport, MockTransport, Transport};
