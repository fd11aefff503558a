// Stampede - large-scale push-notification dispatch pipeline
// Core library module

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod queue;
pub mod storage;
pub mod template;
pub mod worker;

pub use config::Config;
pub use error::{DispatchError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
