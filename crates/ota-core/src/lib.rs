pub mod builder;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod extract;
pub mod hooks;

pub use builder::PackageBuilder;
pub use config::Config;
pub use engine::{ApplyOutcome, Engine, UpdateError};

/// User Agent string for update downloads
pub const USER_AGENT: &str = concat!("ota-core/", env!("CARGO_PKG_VERSION"));
