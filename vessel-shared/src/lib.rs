//! Shared types for the vessel runtime.
//!
//! Holds the error taxonomy and transport value types used by both the
//! host-side orchestrator and any shim binaries, so neither depends on the
//! other's internals.

pub mod errors;
pub mod vsock;

pub use errors::{VesselError, VesselResult};
pub use vsock::VsockAddress;
