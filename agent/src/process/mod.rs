//! Subprocess execution and cancellation

pub mod cancel;
pub mod runner;
