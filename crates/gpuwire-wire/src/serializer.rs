//! Transport seam between the wire client/server and whatever carries bytes.

use gpuwire_protocol::{
    chunked_command_size_bytes, ChunkedCommand, CmdOpcode, CmdPacket, CmdStreamIter, Packet,
};
use tracing::trace;

use crate::WireError;

/// Outgoing side of a transport. Packets are built in place inside the space it
/// hands out.
pub trait CommandSerializer {
    /// Returns `size` writable bytes, or `None` if the transport cannot provide
    /// them. `size` never exceeds [`Self::maximum_allocation_size`].
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]>;

    /// Hands everything written so far to the other side.
    fn flush(&mut self) -> bool;

    fn maximum_allocation_size(&self) -> usize;
}

/// Incoming side of a transport.
pub trait CommandHandler {
    /// Processes a batch of packets. Returns the unconsumed remainder, which is
    /// empty when the whole batch was handled, or `None` if the stream is
    /// malformed and must be torn down.
    fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Option<&'a [u8]>;
}

/// Serializer that appends packets to an in-memory buffer, drained with
/// [`BufferSerializer::take`]. Used for loopback transports and tests.
#[derive(Debug, Clone)]
pub struct BufferSerializer {
    buf: Vec<u8>,
    max_allocation_size: usize,
    flushes: usize,
}

impl BufferSerializer {
    pub fn new(max_allocation_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_allocation_size,
            flushes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}

impl CommandSerializer for BufferSerializer {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if size > self.max_allocation_size {
            return None;
        }
        let start = self.buf.len();
        self.buf.resize(start + size, 0);
        Some(&mut self.buf[start..])
    }

    fn flush(&mut self) -> bool {
        self.flushes += 1;
        true
    }

    fn maximum_allocation_size(&self) -> usize {
        self.max_allocation_size
    }
}

impl<S: CommandSerializer + ?Sized> CommandSerializer for &mut S {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        (**self).get_cmd_space(size)
    }

    fn flush(&mut self) -> bool {
        (**self).flush()
    }

    fn maximum_allocation_size(&self) -> usize {
        (**self).maximum_allocation_size()
    }
}

/// Encodes `packet` into serializer space. Packets larger than the transport's
/// maximum allocation are encoded on the heap and sent as consecutive
/// `ChunkedCommand` packets.
pub fn serialize_command<S: CommandSerializer + ?Sized>(
    serializer: &mut S,
    packet: &impl Packet,
) -> Result<(), WireError> {
    let size = packet.size_bytes();
    let max = serializer.maximum_allocation_size();
    if size <= max {
        let space = serializer
            .get_cmd_space(size)
            .ok_or(WireError::OutOfCommandSpace { size })?;
        packet.encode_into(space)?;
        return Ok(());
    }

    let encoded = packet.encode_to_vec()?;
    let max_chunk = max.saturating_sub(chunked_command_size_bytes(0)) & !3;
    if max_chunk == 0 {
        return Err(WireError::OutOfCommandSpace { size });
    }
    trace!(size, chunks = encoded.len().div_ceil(max_chunk), "chunking command");
    for chunk in encoded.chunks(max_chunk) {
        let chunk = ChunkedCommand {
            total_size: encoded.len() as u64,
            chunk,
        };
        let chunk_size = chunk.size_bytes();
        let space = serializer
            .get_cmd_space(chunk_size)
            .ok_or(WireError::OutOfCommandSpace { size: chunk_size })?;
        chunk.encode_into(space)?;
    }
    Ok(())
}

/// Reassembles a command sent as consecutive chunks.
#[derive(Debug)]
pub struct ChunkAssembler {
    max_size: usize,
    total_size: u64,
    buf: Vec<u8>,
}

impl ChunkAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            total_size: 0,
            buf: Vec::new(),
        }
    }

    /// Whether a partially received command is pending.
    pub fn in_progress(&self) -> bool {
        self.total_size != 0
    }

    /// Adds one chunk. Returns the reassembled bytes once the last chunk arrives.
    pub fn push(&mut self, chunk: ChunkedCommand<'_>) -> Result<Option<Vec<u8>>, WireError> {
        if !self.in_progress() {
            let total = usize::try_from(chunk.total_size).ok().filter(|&t| t <= self.max_size);
            let Some(total) = total.filter(|&t| t > 0) else {
                return Err(WireError::ChunkedCommandTooLarge {
                    total_size: chunk.total_size,
                    limit: self.max_size,
                });
            };
            self.buf
                .try_reserve_exact(total)
                .map_err(|_| WireError::ChunkedCommandTooLarge {
                    total_size: chunk.total_size,
                    limit: self.max_size,
                })?;
            self.total_size = chunk.total_size;
        } else if chunk.total_size != self.total_size {
            return Err(WireError::ChunkOverrun {
                total_size: self.total_size,
            });
        }

        if (self.buf.len() + chunk.chunk.len()) as u64 > self.total_size {
            return Err(WireError::ChunkOverrun {
                total_size: self.total_size,
            });
        }
        self.buf.extend_from_slice(chunk.chunk);
        if self.buf.len() as u64 == self.total_size {
            self.total_size = 0;
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
        Ok(None)
    }
}

/// Walks a batch of packets, reassembling chunked commands and passing every
/// complete packet to `dispatch`.
pub(crate) fn process_stream(
    commands: &[u8],
    assembler: &mut ChunkAssembler,
    dispatch: &mut dyn FnMut(CmdPacket<'_>) -> Result<(), WireError>,
) -> Result<(), WireError> {
    for packet in CmdStreamIter::new(commands) {
        let packet = packet?;
        if packet.hdr.opcode == CmdOpcode::ChunkedCommand as u32 {
            let chunk = ChunkedCommand::decode(packet)?;
            if let Some(whole) = assembler.push(chunk)? {
                process_reassembled(&whole, dispatch)?;
            }
            continue;
        }
        if assembler.in_progress() {
            return Err(WireError::ChunkInterrupted {
                opcode: packet.hdr.opcode,
            });
        }
        dispatch(packet)?;
    }
    Ok(())
}

fn process_reassembled(
    commands: &[u8],
    dispatch: &mut dyn FnMut(CmdPacket<'_>) -> Result<(), WireError>,
) -> Result<(), WireError> {
    for packet in CmdStreamIter::new(commands) {
        let packet = packet?;
        if packet.hdr.opcode == CmdOpcode::ChunkedCommand as u32 {
            return Err(WireError::NestedChunk);
        }
        dispatch(packet)?;
    }
    Ok(())
}
