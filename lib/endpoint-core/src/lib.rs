//! Shared endpoint vocabulary
//!
//! This library provides:
//! - Compound endpoint identifiers and the numeric ID pool
//! - The capability traits through which endpoints are registered and driven
//! - Proxy completion tracking and agent notifications

pub mod completion;
pub mod endpoint;
pub mod error;
pub mod id;
pub mod local;
pub mod notification;
pub mod pool;

pub use completion::{Completion, WaitGroup};
pub use endpoint::{
    Endpoint, EndpointRef, EndpointRegistry, Identifiers, PolicyEndpoint, RegenerationLevel,
    RegenerationMetadata, RevisionCallback,
};
pub use error::{Error, Result};
pub use id::PrefixType;
pub use local::{is_valid_container_id, EndpointSpec, LocalEndpoint};
pub use notification::{NotificationKind, Owner};
pub use pool::{IdAllocator, IdPool};
