//! Gadget lifecycle
//!
//! The engine drives the personalities and the writer; claims keep them off
//! each other's files and devices.

pub mod claims;
pub mod engine;
pub mod state;

pub use claims::{Claim, ClaimConflict, ClaimRole, ResourceClaims};
pub use engine::{describe_write, GadgetEngine};
pub use state::{EngineState, GadgetState, LabStatus};
