use gpuwire_protocol::{DecodeError, EncodeError};
use gpuwire_types::{ObjectHandle, ObjectId, ObjectType};
use thiserror::Error;

/// Reasons a command stream is rejected or a command cannot be sent.
///
/// Any error returned while handling commands means the stream is dead.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WireError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("transport could not provide {size} bytes of command space")]
    OutOfCommandSpace { size: usize },

    #[error("chunked command of {total_size} bytes exceeds the {limit}-byte limit")]
    ChunkedCommandTooLarge { total_size: u64, limit: usize },

    #[error("chunk overruns the announced {total_size}-byte command")]
    ChunkOverrun { total_size: u64 },

    #[error("chunked command interrupted by opcode {opcode}")]
    ChunkInterrupted { opcode: u32 },

    #[error("reassembled command contains another chunk")]
    NestedChunk,

    #[error("unexpected opcode {opcode} for this direction")]
    UnexpectedCommand { opcode: u32 },

    #[error("{object_type} id {id} does not name a live object")]
    UnknownObject { object_type: ObjectType, id: ObjectId },

    #[error("cannot allocate {object_type} {handle}")]
    InvalidAllocation {
        object_type: ObjectType,
        handle: ObjectHandle,
    },

    #[error("cannot destroy {object_type} id {id}")]
    InvalidDestroy { object_type: ObjectType, id: ObjectId },

    #[error("mapped data of {found} bytes does not match the {expected}-byte request")]
    MappedDataMismatch { expected: u64, found: usize },
}
