//! Shared vocabulary for the Reeve daemon: the pulse model, process
//! configuration, the time-string grammar, and the agent stream parser.

pub mod config;
pub mod error;
pub mod pulse;
pub mod stream;
pub mod timespec;

pub use error::{Error, Result};
