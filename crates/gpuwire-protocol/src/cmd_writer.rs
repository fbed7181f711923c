//! Packet encoding.
//!
//! Encoders write into caller-provided space so that a transport can hand out
//! its own memory (`get_cmd_space`) and have the packet built in place.
//! [`CmdStreamWriter`] concatenates packets into a `Vec` for tests, fixtures and
//! the chunked-command path.

use crate::cmd::{ChunkedCommand, CmdHdr, CmdOpcode, Command, ReturnCmdOpcode, ReturnCommand};
use crate::EncodeError;

pub fn align_up(v: usize, a: usize) -> usize {
    debug_assert!(a.is_power_of_two());
    (v + (a - 1)) & !(a - 1)
}

/// Something that can be framed as one packet.
pub trait Packet {
    /// Encoded size including header and padding.
    fn size_bytes(&self) -> usize;

    /// Writes the packet to the front of `out` and returns the number of bytes written.
    fn encode_into(&self, out: &mut [u8]) -> Result<usize, EncodeError>;

    fn encode_to_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = vec![0u8; self.size_bytes()];
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

fn label_len(label: Option<&str>) -> usize {
    label.map_or(0, str::len)
}

fn len_u32(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::PacketTooLarge { size: len })
}

struct PacketWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PacketWriter<'a> {
    fn begin(out: &'a mut [u8], opcode: u32, size: usize) -> Result<Self, EncodeError> {
        let size_bytes = len_u32(size)?;
        if out.len() < size {
            return Err(EncodeError::BufferTooSmall {
                needed: size,
                available: out.len(),
            });
        }
        let buf = &mut out[..size];
        buf.fill(0);
        let mut w = Self { buf, pos: 0 };
        w.u32(opcode);
        w.u32(size_bytes);
        Ok(w)
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn handle(&mut self, h: gpuwire_types::ObjectHandle) {
        self.u32(h.id);
        self.u32(h.generation);
    }

    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    fn label(&mut self, label: Option<&str>) {
        if let Some(label) = label {
            self.bytes(label.as_bytes());
        }
    }

    fn finish(self) -> usize {
        self.buf.len()
    }
}

fn encode_chunk(
    out: &mut [u8],
    opcode: u32,
    size: usize,
    chunk: &ChunkedCommand<'_>,
) -> Result<usize, EncodeError> {
    let mut w = PacketWriter::begin(out, opcode, size)?;
    w.u64(chunk.total_size);
    w.u32(len_u32(chunk.chunk.len())?);
    w.u32(0);
    w.bytes(chunk.chunk);
    Ok(w.finish())
}

impl Command<'_> {
    fn trailing_len(&self) -> usize {
        match self {
            Command::Chunked(c) => c.chunk.len(),
            Command::DeviceCreateBuffer { desc, .. } => label_len(desc.label),
            Command::DeviceCreateTexture { desc, .. } => label_len(desc.label),
            Command::TextureCreateView { desc, .. } => label_len(desc.label),
            Command::DeviceCreateShaderModule { label, code, .. } => label_len(*label) + code.len(),
            Command::DeviceCreateCommandEncoder { label, .. }
            | Command::CommandEncoderFinish { label, .. } => label_len(*label),
            Command::QueueSubmit {
                command_buffers, ..
            } => command_buffers.as_bytes().len(),
            Command::QueueWriteBuffer { data, .. } | Command::BufferUnmap { data, .. } => {
                data.len()
            }
            Command::DeviceInjectError { message, .. } => message.len(),
            Command::DestroyObject { .. }
            | Command::CommandEncoderCopyBufferToBuffer { .. }
            | Command::DeviceGetQueue { .. }
            | Command::QueueOnSubmittedWorkDone { .. }
            | Command::DevicePushErrorScope { .. }
            | Command::DevicePopErrorScope { .. }
            | Command::BufferMapAsync { .. }
            | Command::BufferDestroy { .. } => 0,
        }
    }
}

impl Packet for Command<'_> {
    fn size_bytes(&self) -> usize {
        align_up(self.opcode().fixed_size_bytes() + self.trailing_len(), 4)
    }

    fn encode_into(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        let size = self.size_bytes();
        let opcode = self.opcode() as u32;
        if let Command::Chunked(chunk) = self {
            return encode_chunk(out, opcode, size, chunk);
        }

        let mut w = PacketWriter::begin(out, opcode, size)?;
        match *self {
            Command::Chunked(_) => {}
            Command::DestroyObject {
                object_type,
                object_id,
            } => {
                w.u32(object_type as u32);
                w.u32(object_id);
            }
            Command::DeviceCreateBuffer {
                device_id,
                result,
                desc,
            } => {
                w.u32(device_id);
                w.handle(result);
                w.u32(desc.usage.bits());
                w.u64(desc.size);
                w.u32(desc.mapped_at_creation.into());
                w.u32(len_u32(label_len(desc.label))?);
                w.label(desc.label);
            }
            Command::DeviceCreateTexture {
                device_id,
                result,
                desc,
            } => {
                w.u32(device_id);
                w.handle(result);
                w.u32(desc.width);
                w.u32(desc.height);
                w.u32(desc.depth_or_array_layers);
                w.u32(desc.mip_level_count);
                w.u32(desc.format.into());
                w.u32(desc.usage.bits());
                w.u32(len_u32(label_len(desc.label))?);
                w.label(desc.label);
            }
            Command::TextureCreateView {
                texture_id,
                result,
                desc,
            } => {
                w.u32(texture_id);
                w.handle(result);
                w.u32(desc.format.map_or(0, u32::from));
                w.u32(desc.base_mip_level);
                w.u32(desc.mip_level_count);
                w.u32(len_u32(label_len(desc.label))?);
                w.label(desc.label);
            }
            Command::DeviceCreateShaderModule {
                device_id,
                result,
                label,
                code,
            } => {
                w.u32(device_id);
                w.handle(result);
                w.u32(len_u32(label_len(label))?);
                w.u32(len_u32(code.len())?);
                w.label(label);
                w.bytes(code.as_bytes());
            }
            Command::DeviceCreateCommandEncoder {
                device_id,
                result,
                label,
            } => {
                w.u32(device_id);
                w.handle(result);
                w.u32(len_u32(label_len(label))?);
                w.label(label);
            }
            Command::CommandEncoderCopyBufferToBuffer {
                encoder_id,
                source_id,
                source_offset,
                destination_id,
                destination_offset,
                size,
            } => {
                w.u32(encoder_id);
                w.u32(source_id);
                w.u64(source_offset);
                w.u32(destination_id);
                w.u32(0);
                w.u64(destination_offset);
                w.u64(size);
            }
            Command::CommandEncoderFinish {
                encoder_id,
                result,
                label,
            } => {
                w.u32(encoder_id);
                w.handle(result);
                w.u32(len_u32(label_len(label))?);
                w.label(label);
            }
            Command::DeviceGetQueue { device_id, result } => {
                w.u32(device_id);
                w.handle(result);
                w.u32(0);
            }
            Command::QueueSubmit {
                queue_id,
                command_buffers,
            } => {
                w.u32(queue_id);
                w.u32(len_u32(command_buffers.len())?);
                w.bytes(command_buffers.as_bytes());
            }
            Command::QueueWriteBuffer {
                queue_id,
                buffer_id,
                offset,
                data,
            } => {
                w.u32(queue_id);
                w.u32(buffer_id);
                w.u64(offset);
                w.u64(data.len() as u64);
                w.bytes(data);
            }
            Command::QueueOnSubmittedWorkDone {
                queue_id,
                request_serial,
            } => {
                w.u32(queue_id);
                w.u32(0);
                w.u64(request_serial);
            }
            Command::DevicePushErrorScope { device_id, filter } => {
                w.u32(device_id);
                w.u32(filter.into());
            }
            Command::DevicePopErrorScope {
                device_id,
                request_serial,
            } => {
                w.u32(device_id);
                w.u32(0);
                w.u64(request_serial);
            }
            Command::DeviceInjectError {
                device_id,
                ty,
                message,
            } => {
                w.u32(device_id);
                w.u32(ty.into());
                w.u32(len_u32(message.len())?);
                w.u32(0);
                w.bytes(message.as_bytes());
            }
            Command::BufferMapAsync {
                buffer_id,
                mode,
                request_serial,
                offset,
                size,
            } => {
                w.u32(buffer_id);
                w.u32(mode.bits());
                w.u64(request_serial);
                w.u64(offset);
                w.u64(size);
            }
            Command::BufferUnmap {
                buffer_id,
                write_offset,
                data,
            } => {
                w.u32(buffer_id);
                w.u32(0);
                w.u64(write_offset);
                w.u64(data.len() as u64);
                w.bytes(data);
            }
            Command::BufferDestroy { buffer_id } => {
                w.u32(buffer_id);
                w.u32(0);
            }
        }
        Ok(w.finish())
    }
}

impl ReturnCommand<'_> {
    fn trailing_len(&self) -> usize {
        match self {
            ReturnCommand::Chunked(c) => c.chunk.len(),
            ReturnCommand::DeviceUncapturedErrorCallback { message, .. }
            | ReturnCommand::DeviceLostCallback { message, .. }
            | ReturnCommand::DevicePopErrorScopeCallback { message, .. } => message.len(),
            ReturnCommand::QueueWorkDoneCallback { .. } => 0,
            ReturnCommand::BufferMapAsyncCallback { data, .. } => data.len(),
        }
    }
}

impl Packet for ReturnCommand<'_> {
    fn size_bytes(&self) -> usize {
        align_up(self.opcode().fixed_size_bytes() + self.trailing_len(), 4)
    }

    fn encode_into(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        let size = self.size_bytes();
        let opcode = self.opcode() as u32;
        if let ReturnCommand::Chunked(chunk) = self {
            return encode_chunk(out, opcode, size, chunk);
        }

        let mut w = PacketWriter::begin(out, opcode, size)?;
        match *self {
            ReturnCommand::Chunked(_) => {}
            ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                ty,
                message,
            } => {
                w.handle(device);
                w.u32(ty.into());
                w.u32(len_u32(message.len())?);
                w.bytes(message.as_bytes());
            }
            ReturnCommand::DeviceLostCallback {
                device,
                reason,
                message,
            } => {
                w.handle(device);
                w.u32(reason.into());
                w.u32(len_u32(message.len())?);
                w.bytes(message.as_bytes());
            }
            ReturnCommand::DevicePopErrorScopeCallback {
                device,
                request_serial,
                ty,
                message,
            } => {
                w.handle(device);
                w.u64(request_serial);
                w.u32(ty.into());
                w.u32(len_u32(message.len())?);
                w.bytes(message.as_bytes());
            }
            ReturnCommand::QueueWorkDoneCallback {
                queue,
                request_serial,
                status,
            } => {
                w.handle(queue);
                w.u64(request_serial);
                w.u32(status.into());
                w.u32(0);
            }
            ReturnCommand::BufferMapAsyncCallback {
                buffer,
                request_serial,
                status,
                data,
            } => {
                w.handle(buffer);
                w.u64(request_serial);
                w.u32(status.into());
                w.u32(0);
                w.u64(data.len() as u64);
                w.bytes(data);
            }
        }
        Ok(w.finish())
    }
}

/// Size of a `ChunkedCommand` packet carrying `chunk_len` bytes.
pub fn chunked_command_size_bytes(chunk_len: usize) -> usize {
    align_up(CmdOpcode::ChunkedCommand.fixed_size_bytes() + chunk_len, 4)
}

/// Chunk packets share opcode and layout in both directions, so they can be
/// framed without knowing which stream they belong to.
impl Packet for ChunkedCommand<'_> {
    fn size_bytes(&self) -> usize {
        chunked_command_size_bytes(self.chunk.len())
    }

    fn encode_into(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        encode_chunk(
            out,
            CmdOpcode::ChunkedCommand as u32,
            self.size_bytes(),
            self,
        )
    }
}

const _: () = assert!(
    CmdOpcode::ChunkedCommand.fixed_size_bytes()
        == ReturnCmdOpcode::ChunkedCommand.fixed_size_bytes()
);

/// Growable packet stream.
#[derive(Debug, Default, Clone)]
pub struct CmdStreamWriter {
    buf: Vec<u8>,
}

impl CmdStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &impl Packet) -> Result<(), EncodeError> {
        let offset = self.buf.len();
        self.buf.resize(offset + packet.size_bytes(), 0);
        match packet.encode_into(&mut self.buf[offset..]) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.buf.truncate(offset);
                Err(err)
            }
        }
    }

    /// Appends a raw header with no body. Useful for building malformed streams.
    pub fn push_raw_hdr(&mut self, hdr: CmdHdr) {
        self.buf.extend_from_slice(&hdr.opcode.to_le_bytes());
        self.buf.extend_from_slice(&hdr.size_bytes.to_le_bytes());
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

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
