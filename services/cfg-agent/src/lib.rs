//! hdcfg Configuration Agent Library
//!
//! The configuration agent keeps virtual routers on hosting devices in sync
//! with the controller's router model. It pulls router specs, diffs them
//! against what it last pushed, and drives the device through an ordered
//! sequence of configuration changes.
//!
//! ## Architecture
//!
//! ```text
//! SyncScheduler
//! ├── incremental loop  (routers flagged by notifications)
//! ├── full-sync loop    (everything, plus backlog sweep)
//! └── DeviceRegistry
//!     ├── driver cache  (one RoutingDriver per hosting device)
//!     └── backlog       (unreachable devices, boot grace, dead reports)
//! ```
//!
//! ## Modules
//!
//! - `reconciler`: per-router convergence in a fixed step order
//! - `driver`: device family drivers and the management session
//! - `registry`: router bindings, driver cache and device backlog
//! - `scheduler`: batching, concurrency and deletion handling
//! - `client` / `notify`: controller API in both directions

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod heartbeat;
pub mod model;
pub mod notify;
pub mod probe;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod scheduler;

// Re-export commonly used types
pub use client::{AgentStateReport, Controller, HttpController};
pub use config::Config;
pub use driver::{DriverCatalog, DriverFactory, RoutingDriver};
pub use error::{AgentError, ControllerError, DriverError, ReconcileError, RegistryError};
pub use model::{HostingDevice, RouterSpec};
pub use reconciler::{process_router, PassSummary};
pub use registry::DeviceRegistry;
pub use router::RouterState;
pub use scheduler::{SchedulerSettings, SyncScheduler};
