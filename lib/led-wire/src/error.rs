use std::fmt;

/// Failures produced while validating or decoding a datagram. All of these
/// are handled by dropping the datagram; only [`WireError::BadChecksum`]
/// increments the node's `bad_crc` counter (spec §7).
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum WireError {
    TooShort,
    BadMagic,
    BadVersion,
    BadChecksum,
    Truncated,
    UnknownOpcode(u16),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::TooShort => write!(f, "datagram shorter than the protocol header"),
            WireError::BadMagic => write!(f, "magic number mismatch"),
            WireError::BadVersion => write!(f, "unsupported protocol version"),
            WireError::BadChecksum => write!(f, "checksum verification failed"),
            WireError::Truncated => write!(f, "payload shorter than payload_length"),
            WireError::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
        }
    }
}

impl std::error::Error for WireError {}

pub type WireResult<T> = Result<T, WireError>;
