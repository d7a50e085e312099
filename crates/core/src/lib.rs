//! # tether-core
//!
//! Shared plumbing for the tether workspace: the error type, result
//! combinators, configuration file loading and tracing setup.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod result;
pub mod telemetry;

pub use error::Error;
pub use result::{Result, ResultExt};
