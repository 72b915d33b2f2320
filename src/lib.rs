//! Airgap Image Pusher Library
//!
//! Pushes the container images carried by an airgap bundle into a private
//! registry, streaming structured progress while doing so.

pub mod archive;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod progress;
pub mod push;
pub mod registry;

pub use config::{AppConfig, PushImagesOptions, RegistryOptions};
pub use error::{AirgapError, Result};
pub use logging::Logger;
pub use push::AirgapPusher;
