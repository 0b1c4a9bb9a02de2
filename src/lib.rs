pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod orchestrator;

pub use config::AppConfig;
pub use error::{DispatchError, Result};
pub use orchestrator::OrchestratorContext;
