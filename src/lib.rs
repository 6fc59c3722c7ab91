pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod escalation;
pub mod feedback;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
