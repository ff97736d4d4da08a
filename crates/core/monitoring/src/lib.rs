//! Logging setup and error reporting helpers.

pub mod logging;
