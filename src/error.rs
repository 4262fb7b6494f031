use thiserror::Error;

#[derive(Error, Debug)]
pub enum GearmanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown packet type code: {0}")]
    UnknownPacketType(u32),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet body of {0} bytes exceeds the configured limit")]
    PacketTooLarge(usize),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, GearmanError>;
