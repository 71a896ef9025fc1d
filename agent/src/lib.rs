//! deployd Library
//!
//! Core modules for the deployd host agent.

pub mod app;
pub mod client;
pub mod deploy;
pub mod diagnostic;
pub mod download;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod process;
pub mod reconcile;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod utils;
pub mod workers;
