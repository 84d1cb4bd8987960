use thiserror::Error;

/// Errors produced by the offload manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToeError {
    #[error("no free offload entry available")]
    ResourceExhausted,

    #[error("drain timed out with {unacked} bytes still unacknowledged")]
    Timeout { unacked: u32 },

    #[error("peer exceeded the hardware retransmission limit")]
    MaxRetriesExceeded,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("hardware error: {0}")]
    Hardware(#[from] HwError),

    #[error("invalid entry handle {0}")]
    InvalidHandle(usize),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors reported by the offload hardware collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// The transmit ring is full. The caller keeps the segment and retries.
    #[error("transmit ring full")]
    WouldBlock,

    #[error("hardware refused the request: {0}")]
    Refused(String),

    #[error("channel {0} is not programmed")]
    NoSuchChannel(u32),
}

pub type Result<T> = std::result::Result<T, ToeError>;
