//! Site Snapshot Engine
//!
//! Point-in-time snapshots of a site database and content tree, and restores
//! that roll back to a safety snapshot when they fail.

pub mod archive;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod export;
pub mod fetch;
pub mod import;
pub mod lock;
pub mod paths;
pub mod replace;
pub mod services;
pub mod token;
pub mod transient;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Engine, EngineParts};
pub use utils::errors::{FailureOutcome, SnapshotError};
pub type Result<T> = std::result::Result<T, SnapshotError>;
