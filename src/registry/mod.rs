//! Registry-side collaborators
//!
//! - [`copier`]: copies one image to the destination registry
//! - [`temp_registry`]: serves a temp-registry bundle's dataset locally
//! - [`store`]: reads layer lists from a registry's on-disk storage

pub mod copier;
pub mod store;
pub mod temp_registry;

pub use copier::{ImageCopier, SkopeoCopier};
pub use store::RegistryStore;
pub use temp_registry::{RegistryProcess, RunningRegistry, TempRegistry};
