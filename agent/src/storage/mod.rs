//! On-disk state and settings

pub mod layout;
pub mod settings;
pub mod status;
