/// Boxed error coming from a collaborator outside this crate (transport, sink).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reasons a response frame is rejected by the decoder.
///
/// None of these are fatal: the dispatcher logs them and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame truncated - required={required} received={actual}")]
    Truncated { required: usize, actual: usize },
    #[error("Invalid checksum - calculated={calculated:04X} received={received:04X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    #[error("Byte count mismatch - declared={declared} actual={actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Unknown operation code {0}")]
    UnknownOperation(u8),
    #[error("Payload too short for field table - required={required} received={actual}")]
    PayloadTooShort { required: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Transport write failed: {0}")]
    TransportWriteFailed(#[source] BoxError),
    #[error("Poll session already stopped")]
    SessionStopped,
}
