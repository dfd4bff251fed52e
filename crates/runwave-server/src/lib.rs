//! # runwave-server
//!
//! HTTP front end for the RunWave warm-pool scheduler.
//!
//! Loads [`ServerConfig`] from the environment, syncs the pod pool through
//! kubectl and serves `POST /execute` and `GET /health`.

pub mod config;
pub mod http;
pub mod server;
pub mod types;

pub use config::{ConfigError, ServerConfig};
pub use server::RunwaveServer;
pub use types::{ExecuteRequest, ExecuteResponse};
