#![warn(missing_docs)]

//! Tollgate node: configuration, component wiring, background jobs

pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod node;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use jobs::BackgroundJobs;
pub use node::{ConsistencyCheck, Node};
