//! Code/name enumerations

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Declares an enum whose variants carry a positional wire code and a symbolic
/// name. Decoding accepts either (plus optional legacy aliases), encoding emits
/// the name.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = ($code:literal, $sym:literal $(, $alias:literal)*)
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(&self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $sym),+
                }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                $(
                    if code == $code {
                        return Some($name::$variant);
                    }
                )+
                None
            }

            pub fn from_name(name: &str) -> Option<Self> {
                let name = name.trim();
                $(
                    if name.eq_ignore_ascii_case($sym) $(|| name.eq_ignore_ascii_case($alias))* {
                        return Some($name::$variant);
                    }
                )+
                None
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if let Ok(code) = s.trim().parse::<i64>() {
                    return $name::from_code(code)
                        .ok_or_else(|| format!("unknown {} code: {}", stringify!($name), code));
                }
                $name::from_name(s)
                    .ok_or_else(|| format!("unknown {} name: {}", stringify!($name), s))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct CodeOrName;

                impl<'de> Visitor<'de> for CodeOrName {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                        write!(f, "a {} code or name", stringify!($name))
                    }

                    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                        $name::from_code(v).ok_or_else(|| {
                            E::custom(format!("unknown {} code: {}", stringify!($name), v))
                        })
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                        let code = i64::try_from(v).map_err(|_| {
                            E::custom(format!("{} code out of range: {}", stringify!($name), v))
                        })?;
                        self.visit_i64(code)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        v.parse().map_err(E::custom)
                    }
                }

                deserializer.deserialize_any(CodeOrName)
            }
        }
    };
}

wire_enum! {
    /// Position of an environment within the deploy pipeline.
    pub enum Stage {
        Unknown = (0, "UNKNOWN"),
        PreDownload = (1, "PRE_DOWNLOAD"),
        Downloading = (2, "DOWNLOADING"),
        PostDownload = (3, "POST_DOWNLOAD", "DOWNLOAD_COMPLETE"),
        Staging = (4, "STAGING"),
        PreRestart = (5, "PRE_RESTART"),
        Restarting = (6, "RESTARTING"),
        PostRestart = (7, "POST_RESTART"),
        ServingBuild = (8, "SERVING_BUILD"),
        Stopping = (9, "STOPPING"),
        Stopped = (10, "STOPPED"),
    }
}

wire_enum! {
    /// Outcome of the most recent stage attempt.
    pub enum Status {
        Succeeded = (0, "SUCCEEDED"),
        Unknown = (1, "UNKNOWN"),
        AgentFailed = (2, "AGENT_FAILED"),
        RetryableAgentFailed = (3, "RETRYABLE_AGENT_FAILED"),
        ScriptFailed = (4, "SCRIPT_FAILED"),
        AbortedByService = (5, "ABORTED_BY_SERVICE"),
        ScriptTimeout = (6, "SCRIPT_TIMEOUT"),
        TooManyRetry = (7, "TOO_MANY_RETRY"),
        RuntimeMismatch = (8, "RUNTIME_MISMATCH"),
        AbortedByServer = (9, "ABORTED_BY_SERVER"),
    }
}

wire_enum! {
    /// Instruction carried by a ping response.
    pub enum OpCode {
        Noop = (0, "NOOP"),
        Deploy = (1, "DEPLOY"),
        Update = (2, "UPDATE"),
        Restart = (3, "RESTART"),
        Delete = (4, "DELETE"),
        Terminate = (5, "TERMINATE"),
        Wait = (6, "WAIT"),
        Rollback = (7, "ROLLBACK"),
        Stop = (8, "STOP"),
    }
}

wire_enum! {
    /// Flavor of a deploy, which decides the stages that run.
    pub enum DeployType {
        Regular = (0, "REGULAR"),
        Hotfix = (1, "HOTFIX"),
        Rollback = (2, "ROLLBACK"),
        Restart = (3, "RESTART"),
        Stop = (4, "STOP"),
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Unknown
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

impl Default for OpCode {
    fn default() -> Self {
        OpCode::Noop
    }
}

impl Default for DeployType {
    fn default() -> Self {
        DeployType::Regular
    }
}

impl Stage {
    /// Stages that run before the build is staged onto the target. A missing
    /// script directory is expected here since nothing has been installed yet.
    pub fn is_pre_staging(&self) -> bool {
        matches!(
            self,
            Stage::PreDownload | Stage::Downloading | Stage::PostDownload | Stage::Staging
        )
    }
}

impl Status {
    /// Whether a stage attempt ended in failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Status::Succeeded | Status::Unknown)
    }
}

impl OpCode {
    /// Op codes that need a deploy goal to act on.
    pub fn requires_goal(&self) -> bool {
        !matches!(self, OpCode::Noop | OpCode::Wait)
    }
}
