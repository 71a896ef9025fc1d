//! Filesystem helpers

pub mod dir;
pub mod file;

use crate::errors::AgentError;

/// Reject names that cannot be used as a single path component. `kind` names
/// the value in the error message.
pub fn validate_component(kind: &str, value: &str) -> Result<(), AgentError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AgentError::ConfigError(format!("invalid {} '{}'", kind, value)))
    }
}
