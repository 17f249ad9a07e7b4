use thiserror::Error;

/// Failures of the device link.
///
/// `Clone` so a single transport fault can be reported both to the caller
/// that issued the command and to the connection manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No usable Bluetooth adapter. Ends the session.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Target address is not in the paired-device list.
    #[error("Device {0} is not paired. Pair it with the system Bluetooth settings and retry.")]
    NotPaired(String),

    /// Transport-level read/write/open fault.
    #[error("I/O failure on link: {0}")]
    IoFailure(String),

    /// Download reply did not start with the expected code.
    #[error("Protocol mismatch: expected reply 0x{expected:02X}, got 0x{actual:02X}")]
    ProtocolMismatch { expected: u8, actual: u8 },

    /// Downloaded position byte outside 0..=180.
    #[error("Device reported out-of-range position byte {0}")]
    InvalidPosition(u8),

    /// Angle value outside 0..=180 supplied by a caller.
    #[error("Angle {0} is outside 0..=180")]
    InvalidAngle(i64),

    /// Command submitted to, or still queued on, a torn-down link.
    #[error("Link closed")]
    LinkClosed,
}

impl LinkError {
    /// Faults after which the byte stream's framing can no longer be trusted.
    pub fn is_stream_fault(&self) -> bool {
        matches!(
            self,
            Self::IoFailure(_) | Self::ProtocolMismatch { .. } | Self::InvalidPosition(_)
        )
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}
