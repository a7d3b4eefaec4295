//! # kiln-id
//!
//! Typed identifiers for everything the agent manages.
//!
//! Every ID renders as `{prefix}_{ulid}`:
//!
//! - `mach_01HV4Z2WQXKJNM8GPQY6VBKC3D` (machine)
//! - `ctr_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (container)
//! - `vol_01HV4Z4NYPLTRS0JTUA8XDME5F` (volume)
//! - `nic_01HV4Z5PZQMVST1KVWB9YENF6G` (network interface)
//!
//! The prefix keeps a volume ID from ever being handed to something that
//! expects a machine ID, and the ULID keeps IDs sortable by creation time.
//! Machine IDs are assigned by whoever declares the machine; the agent never
//! rewrites them.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
