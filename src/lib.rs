//! Director - supervisor for long running controllers and agents
//!
//! This crate parses the director configuration into ordered records, loads
//! the controller behind each record, keeps them running from a polling
//! maintenance loop, and answers remote start/stop/reload commands over a
//! message bus.

pub mod agency;
pub mod bus;
pub mod config;
pub mod controllers;
pub mod error;
pub mod loader;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod testing;

pub use error::{DirectorError, FailurePolicy, Result};
