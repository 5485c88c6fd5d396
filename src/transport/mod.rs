pub mod link;
pub mod monitor;
pub mod packet;
pub mod streamer;

use thiserror::Error;

/// Faults on the device link. All but `TooManyLeds` are transient and
/// recovered by reconnecting.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("incomplete write: {written}/{total} bytes sent")]
    ShortWrite { written: usize, total: usize },

    #[error("serial write timed out")]
    Timeout,

    #[error("{0} LEDs do not fit the packet's 16-bit count")]
    TooManyLeds(usize),

    #[error("serial I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(err),
        }
    }
}
