//! Error types for echo-engine.
//!
//! Device errors are classified by how the session loop reacts to them:
//! - **Initialization**: the device never opened; the session ends before the loop.
//! - **Transient**: one block is skipped, the loop continues.
//! - **Fatal**: the loop ends and cleanup runs.
//!
//! None of these reach the caller of `start()`; they end up in the log and in
//! [`SessionExit`].

use std::fmt;

/// Which device an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Capture,
    Playback,
    EchoCanceller,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Capture => "capture",
            Self::Playback => "playback",
            Self::EchoCanceller => "echo canceller",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The device could not be opened or started.
    #[error("{role} device initialization failed: {reason}")]
    InitializationFailed { role: DeviceRole, reason: String },

    /// A single read or write failed; the next one may succeed.
    #[error("transient {role} error: {reason}")]
    Transient { role: DeviceRole, reason: String },

    /// The device is unusable for the rest of the session.
    #[error("fatal {role} error: {reason}")]
    Fatal { role: DeviceRole, reason: String },
}

impl DeviceError {
    pub fn init(role: DeviceRole, reason: impl Into<String>) -> Self {
        Self::InitializationFailed { role, reason: reason.into() }
    }

    pub fn transient(role: DeviceRole, reason: impl Into<String>) -> Self {
        Self::Transient { role, reason: reason.into() }
    }

    pub fn fatal(role: DeviceRole, reason: impl Into<String>) -> Self {
        Self::Fatal { role, reason: reason.into() }
    }

    pub fn role(&self) -> DeviceRole {
        match self {
            Self::InitializationFailed { role, .. } | Self::Transient { role, .. } | Self::Fatal { role, .. } => *role,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// True for errors that end a running session (initialization errors
    /// surfacing mid-session count as fatal).
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// `stop()` was observed at a block boundary.
    Stopped,
    /// A device could not be acquired; the loop never ran.
    DeviceInitialization(DeviceError),
    /// An unrecoverable device error ended the loop.
    FatalIo(DeviceError),
    /// A fault inside the loop (panic) was caught at the loop boundary.
    UnexpectedFault(String),
}

impl SessionExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::DeviceInitialization(e) => write!(f, "device initialization error: {e}"),
            Self::FatalIo(e) => write!(f, "fatal I/O error: {e}"),
            Self::UnexpectedFault(msg) => write!(f, "unexpected fault: {msg}"),
        }
    }
}
