// Error types for ODrive communication and axis orchestration

use std::time::Duration;

use super::device::{AxisErrors, AxisId};

#[derive(Debug, thiserror::Error)]
pub enum OdriveError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("No ODrive found within {timeout:?}")]
    NotFound { timeout: Duration },

    #[error("Axes already prerolled")]
    AlreadyPrerolled,

    #[error("No reply to `{command}`")]
    NoReply { command: String },

    #[error("Invalid reply to `{command}`: {reason}")]
    InvalidResponse { command: String, reason: String },

    #[error("Checksum mismatch in reply to `{command}`")]
    ChecksumMismatch { command: String },

    #[error("Device rejected `{command}`: {reply}")]
    Rejected { command: String, reply: String },

    #[error("{axis} fault: {errors}")]
    AxisFault { axis: AxisId, errors: AxisErrors },

    #[error("Timed out after {waited:?} waiting for {axis} to become idle")]
    Timeout { axis: AxisId, waited: Duration },
}

pub type Result<T> = std::result::Result<T, OdriveError>;
