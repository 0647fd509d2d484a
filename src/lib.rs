#![forbid(unsafe_code)]

pub mod collaborators;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod policy;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
