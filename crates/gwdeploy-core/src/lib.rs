pub mod cancel;
pub mod config;
pub mod error;
pub mod exec;
pub mod health;
pub mod io;
pub mod migrate;
pub mod orchestrator;
pub mod paths;
pub mod runtime;
pub mod secrets;
pub mod types;

pub use error::{DeployError, Result};
