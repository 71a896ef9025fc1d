//! Ping protocol shared between the deploy agent and the control plane.
//!
//! Enumerations travel as symbolic names but older peers send their positional
//! integer codes, so every enum here decodes from either form and always
//! encodes as the name.

mod codes;
pub mod models;

pub use codes::{DeployType, OpCode, Stage, Status};
pub use models::{
    Build, DeployGoal, PingReport, PingRequest, PingResponse, ProtocolError, ScriptHook,
};
