//! Small helpers shared across the agent

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What this binary is and where it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

impl VersionInfo {
    /// `User-Agent` sent to the control plane and artifact hosts
    pub fn user_agent(&self) -> String {
        format!("{}/{} ({})", self.name, self.version, self.git_hash)
    }
}

/// Version stamped in by `build.rs`
pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Exponential backoff shape
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl CooldownOptions {
    /// Doubling delays from `base_delay`, capped at `max_delay`
    pub fn doubling(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: 2.0,
        }
    }
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self::doubling(Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Delay before retry number `attempt`, counting from zero
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(exponent);
    let max_secs = options.max_delay.as_secs_f64();
    if !delay_secs.is_finite() || delay_secs > max_secs {
        return options.max_delay;
    }
    Duration::from_secs_f64(delay_secs)
}

pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Keep at most the last `max` bytes of captured output, cut on a char boundary.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Lowercase hex for digests
pub mod hex {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        data.as_ref()
            .iter()
            .flat_map(|byte| [DIGITS[(byte >> 4) as usize], DIGITS[(byte & 0x0f) as usize]])
            .map(char::from)
            .collect()
    }

    pub fn is_hex(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
    }
}
