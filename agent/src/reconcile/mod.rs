//! Reconciliation of local deploy state against the control plane

pub mod controller;

pub use controller::{Controller, ControllerOptions, CycleEnd, CycleOutcome, CycleState};
