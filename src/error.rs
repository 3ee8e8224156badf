use thiserror::Error;

use crate::sma::session::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the SMA protocol core.
///
/// `Transport`, `FrameOverflow`, `MalformedFrame` and `NetworkBuildup` end the
/// current session; the transport is always closed before they reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("frame of {length} bytes overflows the receive buffer")]
    FrameOverflow { length: usize },

    #[error("reply 0x{command:04X} too short: need {needed} bytes, got {actual}")]
    MalformedFrame {
        command: u16,
        needed: usize,
        actual: usize,
    },

    #[error("invalid device address '{0}'")]
    AddressFormat(String),

    #[error("network build-up failed: {0}")]
    NetworkBuildup(String),

    #[error("no inverter acknowledged logon after {rounds} rounds")]
    LogonFailed { rounds: usize },

    /// Consumed by the frame reader's retry loop, never returned to callers.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("unknown data point '{0}'")]
    UnknownDataPoint(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}
