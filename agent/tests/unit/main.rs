//! Integration tests for deployd

mod common;
mod test_download;
mod test_scenarios;
mod test_server;
