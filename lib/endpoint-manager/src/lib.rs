//! Registry and lifecycle coordination of locally running endpoints
//!
//! This library provides:
//! - The endpoint manager, indexing endpoints by ID and secondary identifiers
//! - Mark-and-sweep garbage collection of stray endpoints
//! - Bulk policy map updates, regeneration and policy revision waits

pub mod config;
pub mod controller;
pub mod gc;
pub mod manager;
pub mod sync;

pub use config::ManagerConfig;
pub use controller::{Controller, ControllerParams};
pub use gc::{EndpointChecker, EndpointGc};
pub use manager::{EndpointManager, PolicyEndpoints};
pub use sync::SyncHandle;
