//! Kiln Machine Agent Library
//!
//! The machine agent keeps the microVMs on one host converged on their
//! desired state, in the presence of partial failures and concurrent
//! requests.
//!
//! ## Architecture
//!
//! ```text
//! MachineService
//! └── MachineController(id)      (one per machine)
//!     ├── EventBus<MachineEvent> (serializes every change)
//!     ├── reconciliation task    (drives providers toward the desired state)
//!     └── monitor task           (polls health or listens to the guest)
//! ```
//!
//! ## Modules
//!
//! - `machine`: the machine aggregate and its resources
//! - `event`: events on a controller's bus
//! - `controller`: the per-machine controller, reconciliation and monitoring
//! - `providers`: collaborator traits and in-memory mocks
//! - `network`: TAP devices and link addressing
//! - `state`: local SQLite persistence
//! - `service`: the controller registry

pub mod config;
pub mod controller;
pub mod event;
pub mod machine;
pub mod network;
pub mod providers;
pub mod service;
pub mod state;

// Re-export commonly used types
pub use controller::{ControllerConfig, ControllerError, MachineController, MonitorStrategy};
pub use event::MachineEvent;
pub use machine::{ContainerSpec, Machine, MachineSpec};
pub use service::{MachineService, ServiceError, ServiceEvent};
