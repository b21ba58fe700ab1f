use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("cannot bind udp socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("no peer address bound")]
    NoPeer,
    #[error("connection not started")]
    NotStarted,
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("datagram was not fully sent")]
    SendFailed,
}

/// Reasons a NAT gateway message is rejected by a parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("request/response flag does not match the expected direction")]
    UnexpectedDirection,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("unknown result code {0}")]
    UnknownResultCode(u16),
    #[error("unknown transport protocol {0}")]
    UnknownProtocol(u8),
    #[error("buffer too small for encoded message")]
    BufferTooSmall,
}
