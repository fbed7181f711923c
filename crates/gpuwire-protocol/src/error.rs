use gpuwire_types::UnknownEnumValue;
use thiserror::Error;

/// Framing and layout errors found while reading a command stream.
///
/// Every variant means the stream can no longer be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer too small for a packet header")]
    BufferTooSmall,
    #[error("invalid packet size_bytes {found}")]
    BadSizeBytes { found: u32 },
    #[error("packet size_bytes {found} is not 4-byte aligned")]
    SizeNotAligned { found: u32 },
    #[error(
        "packet at offset {offset} with size {packet_size_bytes} overruns the {stream_size_bytes}-byte stream"
    )]
    PacketOverrunsStream {
        offset: usize,
        packet_size_bytes: u32,
        stream_size_bytes: usize,
    },
    #[error("unknown opcode {found:#x}")]
    UnknownOpcode { found: u32 },
    #[error("packet of {size_bytes} bytes is smaller than the {expected}-byte fixed layout")]
    PacketTooSmall { size_bytes: u32, expected: usize },
    #[error("declared trailing length {declared} exceeds the {available} bytes left in the packet")]
    TrailingDataOverrun { declared: u64, available: usize },
    #[error("packet of {size_bytes} bytes does not match its {expected}-byte encoding")]
    PacketSizeMismatch { size_bytes: usize, expected: usize },
    #[error("non-zero padding byte at packet offset {offset}")]
    NonZeroPadding { offset: usize },
    #[error("invalid object type {found}")]
    InvalidObjectType { found: u32 },
    #[error(transparent)]
    InvalidEnum(#[from] UnknownEnumValue),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("output buffer holds {available} bytes, packet needs {needed}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("packet of {size} bytes does not fit a u32 size_bytes")]
    PacketTooLarge { size: usize },
}
