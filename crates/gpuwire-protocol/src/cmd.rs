//! Packet layouts and decoding.

use gpuwire_types::{
    BufferDescriptor, BufferUsage, DeviceLostReason, ErrorFilter, ErrorType, MapAsyncStatus,
    MapMode, ObjectHandle, ObjectId, ObjectType, QueueWorkDoneStatus, TextureDescriptor,
    TextureFormat, TextureUsage, TextureViewDescriptor,
};

use crate::{align_up, DecodeError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHdr {
    pub opcode: u32,
    pub size_bytes: u32,
}

impl CmdHdr {
    pub const SIZE_BYTES: usize = 8;
}

/// Opcodes of client-to-server packets.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdOpcode {
    ChunkedCommand = 0,
    DestroyObject = 1,
    DeviceCreateBuffer = 2,
    DeviceCreateTexture = 3,
    TextureCreateView = 4,
    DeviceCreateShaderModule = 5,
    DeviceCreateCommandEncoder = 6,
    CommandEncoderCopyBufferToBuffer = 7,
    CommandEncoderFinish = 8,
    DeviceGetQueue = 9,
    QueueSubmit = 10,
    QueueWriteBuffer = 11,
    QueueOnSubmittedWorkDone = 12,
    DevicePushErrorScope = 13,
    DevicePopErrorScope = 14,
    DeviceInjectError = 15,
    BufferMapAsync = 16,
    BufferUnmap = 17,
    BufferDestroy = 18,
}

impl CmdOpcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::ChunkedCommand),
            1 => Some(Self::DestroyObject),
            2 => Some(Self::DeviceCreateBuffer),
            3 => Some(Self::DeviceCreateTexture),
            4 => Some(Self::TextureCreateView),
            5 => Some(Self::DeviceCreateShaderModule),
            6 => Some(Self::DeviceCreateCommandEncoder),
            7 => Some(Self::CommandEncoderCopyBufferToBuffer),
            8 => Some(Self::CommandEncoderFinish),
            9 => Some(Self::DeviceGetQueue),
            10 => Some(Self::QueueSubmit),
            11 => Some(Self::QueueWriteBuffer),
            12 => Some(Self::QueueOnSubmittedWorkDone),
            13 => Some(Self::DevicePushErrorScope),
            14 => Some(Self::DevicePopErrorScope),
            15 => Some(Self::DeviceInjectError),
            16 => Some(Self::BufferMapAsync),
            17 => Some(Self::BufferUnmap),
            18 => Some(Self::BufferDestroy),
            _ => None,
        }
    }

    /// Size of the header plus fixed fields, before any trailing data.
    pub const fn fixed_size_bytes(self) -> usize {
        match self {
            Self::ChunkedCommand => 24,
            Self::DestroyObject => 16,
            Self::DeviceCreateBuffer => 40,
            Self::DeviceCreateTexture => 48,
            Self::TextureCreateView => 36,
            Self::DeviceCreateShaderModule => 28,
            Self::DeviceCreateCommandEncoder => 24,
            Self::CommandEncoderCopyBufferToBuffer => 48,
            Self::CommandEncoderFinish => 24,
            Self::DeviceGetQueue => 24,
            Self::QueueSubmit => 16,
            Self::QueueWriteBuffer => 32,
            Self::QueueOnSubmittedWorkDone => 24,
            Self::DevicePushErrorScope => 16,
            Self::DevicePopErrorScope => 24,
            Self::DeviceInjectError => 24,
            Self::BufferMapAsync => 40,
            Self::BufferUnmap => 32,
            Self::BufferDestroy => 16,
        }
    }
}

/// Opcodes of server-to-client packets.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCmdOpcode {
    ChunkedCommand = 0,
    DeviceUncapturedErrorCallback = 1,
    DeviceLostCallback = 2,
    DevicePopErrorScopeCallback = 3,
    QueueWorkDoneCallback = 4,
    BufferMapAsyncCallback = 5,
}

impl ReturnCmdOpcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::ChunkedCommand),
            1 => Some(Self::DeviceUncapturedErrorCallback),
            2 => Some(Self::DeviceLostCallback),
            3 => Some(Self::DevicePopErrorScopeCallback),
            4 => Some(Self::QueueWorkDoneCallback),
            5 => Some(Self::BufferMapAsyncCallback),
            _ => None,
        }
    }

    pub const fn fixed_size_bytes(self) -> usize {
        match self {
            Self::ChunkedCommand => 24,
            Self::DeviceUncapturedErrorCallback => 24,
            Self::DeviceLostCallback => 24,
            Self::DevicePopErrorScopeCallback => 32,
            Self::QueueWorkDoneCallback => 32,
            Self::BufferMapAsyncCallback => 40,
        }
    }
}

/// One slice of a command too large to be sent in a single packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkedCommand<'a> {
    /// Size of the reassembled packet stream.
    pub total_size: u64,
    pub chunk: &'a [u8],
}

impl<'a> ChunkedCommand<'a> {
    /// Decodes a chunk packet. The layout is the same in both directions.
    pub fn decode(packet: CmdPacket<'a>) -> Result<Self, DecodeError> {
        if packet.hdr.opcode != CmdOpcode::ChunkedCommand as u32 {
            return Err(DecodeError::UnknownOpcode {
                found: packet.hdr.opcode,
            });
        }
        let mut r = FieldReader::new(packet, CmdOpcode::ChunkedCommand.fixed_size_bytes())?;
        let total_size = r.u64()?;
        let chunk_len = r.u32()?;
        r.padding_u32()?;
        let chunk = r.trailing(chunk_len.into())?;
        r.finish()?;
        Ok(Self { total_size, chunk })
    }
}

/// Little-endian `u32` object ids carried as trailing data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectIdList<'a> {
    raw: &'a [u8],
}

impl<'a> ObjectIdList<'a> {
    /// `raw.len()` must be a multiple of 4; trailing bytes are ignored otherwise.
    pub fn from_raw(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    pub fn len(&self) -> usize {
        self.raw.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        &self.raw[..self.len() * 4]
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + 'a {
        self.raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

/// A client-to-server command, borrowing its trailing data from the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Chunked(ChunkedCommand<'a>),
    DestroyObject {
        object_type: ObjectType,
        object_id: ObjectId,
    },
    DeviceCreateBuffer {
        device_id: ObjectId,
        result: ObjectHandle,
        desc: BufferDescriptor<'a>,
    },
    DeviceCreateTexture {
        device_id: ObjectId,
        result: ObjectHandle,
        desc: TextureDescriptor<'a>,
    },
    TextureCreateView {
        texture_id: ObjectId,
        result: ObjectHandle,
        desc: TextureViewDescriptor<'a>,
    },
    DeviceCreateShaderModule {
        device_id: ObjectId,
        result: ObjectHandle,
        label: Option<&'a str>,
        code: &'a str,
    },
    DeviceCreateCommandEncoder {
        device_id: ObjectId,
        result: ObjectHandle,
        label: Option<&'a str>,
    },
    CommandEncoderCopyBufferToBuffer {
        encoder_id: ObjectId,
        source_id: ObjectId,
        source_offset: u64,
        destination_id: ObjectId,
        destination_offset: u64,
        size: u64,
    },
    CommandEncoderFinish {
        encoder_id: ObjectId,
        result: ObjectHandle,
        label: Option<&'a str>,
    },
    DeviceGetQueue {
        device_id: ObjectId,
        result: ObjectHandle,
    },
    QueueSubmit {
        queue_id: ObjectId,
        command_buffers: ObjectIdList<'a>,
    },
    QueueWriteBuffer {
        queue_id: ObjectId,
        buffer_id: ObjectId,
        offset: u64,
        data: &'a [u8],
    },
    QueueOnSubmittedWorkDone {
        queue_id: ObjectId,
        request_serial: u64,
    },
    DevicePushErrorScope {
        device_id: ObjectId,
        filter: ErrorFilter,
    },
    DevicePopErrorScope {
        device_id: ObjectId,
        request_serial: u64,
    },
    DeviceInjectError {
        device_id: ObjectId,
        ty: ErrorType,
        message: &'a str,
    },
    BufferMapAsync {
        buffer_id: ObjectId,
        mode: MapMode,
        request_serial: u64,
        offset: u64,
        size: u64,
    },
    /// `data` holds the bytes the client wrote while the buffer was mapped for
    /// writing, starting at `write_offset`. Empty for read mappings.
    BufferUnmap {
        buffer_id: ObjectId,
        write_offset: u64,
        data: &'a [u8],
    },
    BufferDestroy {
        buffer_id: ObjectId,
    },
}

impl<'a> Command<'a> {
    pub fn opcode(&self) -> CmdOpcode {
        match self {
            Command::Chunked(_) => CmdOpcode::ChunkedCommand,
            Command::DestroyObject { .. } => CmdOpcode::DestroyObject,
            Command::DeviceCreateBuffer { .. } => CmdOpcode::DeviceCreateBuffer,
            Command::DeviceCreateTexture { .. } => CmdOpcode::DeviceCreateTexture,
            Command::TextureCreateView { .. } => CmdOpcode::TextureCreateView,
            Command::DeviceCreateShaderModule { .. } => CmdOpcode::DeviceCreateShaderModule,
            Command::DeviceCreateCommandEncoder { .. } => CmdOpcode::DeviceCreateCommandEncoder,
            Command::CommandEncoderCopyBufferToBuffer { .. } => {
                CmdOpcode::CommandEncoderCopyBufferToBuffer
            }
            Command::CommandEncoderFinish { .. } => CmdOpcode::CommandEncoderFinish,
            Command::DeviceGetQueue { .. } => CmdOpcode::DeviceGetQueue,
            Command::QueueSubmit { .. } => CmdOpcode::QueueSubmit,
            Command::QueueWriteBuffer { .. } => CmdOpcode::QueueWriteBuffer,
            Command::QueueOnSubmittedWorkDone { .. } => CmdOpcode::QueueOnSubmittedWorkDone,
            Command::DevicePushErrorScope { .. } => CmdOpcode::DevicePushErrorScope,
            Command::DevicePopErrorScope { .. } => CmdOpcode::DevicePopErrorScope,
            Command::DeviceInjectError { .. } => CmdOpcode::DeviceInjectError,
            Command::BufferMapAsync { .. } => CmdOpcode::BufferMapAsync,
            Command::BufferUnmap { .. } => CmdOpcode::BufferUnmap,
            Command::BufferDestroy { .. } => CmdOpcode::BufferDestroy,
        }
    }

    /// Decodes one packet. `packet.bytes` must span exactly `hdr.size_bytes`.
    pub fn decode(packet: CmdPacket<'a>) -> Result<Self, DecodeError> {
        let opcode = CmdOpcode::from_u32(packet.hdr.opcode).ok_or(DecodeError::UnknownOpcode {
            found: packet.hdr.opcode,
        })?;
        let mut r = FieldReader::new(packet, opcode.fixed_size_bytes())?;

        let cmd = match opcode {
            CmdOpcode::ChunkedCommand => return ChunkedCommand::decode(packet).map(Command::Chunked),
            CmdOpcode::DestroyObject => {
                let raw_type = r.u32()?;
                let object_type = ObjectType::from_u32(raw_type)
                    .ok_or(DecodeError::InvalidObjectType { found: raw_type })?;
                Command::DestroyObject {
                    object_type,
                    object_id: r.u32()?,
                }
            }
            CmdOpcode::DeviceCreateBuffer => {
                let device_id = r.u32()?;
                let result = r.handle()?;
                let usage = BufferUsage::from_bits_retain(r.u32()?);
                let size = r.u64()?;
                let mapped_at_creation = r.u32()? != 0;
                let label_len = r.u32()?;
                Command::DeviceCreateBuffer {
                    device_id,
                    result,
                    desc: BufferDescriptor {
                        label: r.label(label_len)?,
                        usage,
                        size,
                        mapped_at_creation,
                    },
                }
            }
            CmdOpcode::DeviceCreateTexture => {
                let device_id = r.u32()?;
                let result = r.handle()?;
                let width = r.u32()?;
                let height = r.u32()?;
                let depth_or_array_layers = r.u32()?;
                let mip_level_count = r.u32()?;
                let format = TextureFormat::try_from(r.u32()?)?;
                let usage = TextureUsage::from_bits_retain(r.u32()?);
                let label_len = r.u32()?;
                Command::DeviceCreateTexture {
                    device_id,
                    result,
                    desc: TextureDescriptor {
                        label: r.label(label_len)?,
                        width,
                        height,
                        depth_or_array_layers,
                        mip_level_count,
                        format,
                        usage,
                    },
                }
            }
            CmdOpcode::TextureCreateView => {
                let texture_id = r.u32()?;
                let result = r.handle()?;
                let format = match r.u32()? {
                    0 => None,
                    v => Some(TextureFormat::try_from(v)?),
                };
                let base_mip_level = r.u32()?;
                let mip_level_count = r.u32()?;
                let label_len = r.u32()?;
                Command::TextureCreateView {
                    texture_id,
                    result,
                    desc: TextureViewDescriptor {
                        label: r.label(label_len)?,
                        format,
                        base_mip_level,
                        mip_level_count,
                    },
                }
            }
            CmdOpcode::DeviceCreateShaderModule => {
                let device_id = r.u32()?;
                let result = r.handle()?;
                let label_len = r.u32()?;
                let code_len = r.u32()?;
                let label = r.label(label_len)?;
                let code = r.str(code_len.into())?;
                Command::DeviceCreateShaderModule {
                    device_id,
                    result,
                    label,
                    code,
                }
            }
            CmdOpcode::DeviceCreateCommandEncoder => {
                let device_id = r.u32()?;
                let result = r.handle()?;
                let label_len = r.u32()?;
                Command::DeviceCreateCommandEncoder {
                    device_id,
                    result,
                    label: r.label(label_len)?,
                }
            }
            CmdOpcode::CommandEncoderCopyBufferToBuffer => {
                let encoder_id = r.u32()?;
                let source_id = r.u32()?;
                let source_offset = r.u64()?;
                let destination_id = r.u32()?;
                r.padding_u32()?;
                Command::CommandEncoderCopyBufferToBuffer {
                    encoder_id,
                    source_id,
                    source_offset,
                    destination_id,
                    destination_offset: r.u64()?,
                    size: r.u64()?,
                }
            }
            CmdOpcode::CommandEncoderFinish => {
                let encoder_id = r.u32()?;
                let result = r.handle()?;
                let label_len = r.u32()?;
                Command::CommandEncoderFinish {
                    encoder_id,
                    result,
                    label: r.label(label_len)?,
                }
            }
            CmdOpcode::DeviceGetQueue => {
                let device_id = r.u32()?;
                let result = r.handle()?;
                Command::DeviceGetQueue { device_id, result }
            }
            CmdOpcode::QueueSubmit => {
                let queue_id = r.u32()?;
                let count = r.u32()?;
                let raw = r.trailing(u64::from(count) * 4)?;
                Command::QueueSubmit {
                    queue_id,
                    command_buffers: ObjectIdList::from_raw(raw),
                }
            }
            CmdOpcode::QueueWriteBuffer => {
                let queue_id = r.u32()?;
                let buffer_id = r.u32()?;
                let offset = r.u64()?;
                let data_len = r.u64()?;
                Command::QueueWriteBuffer {
                    queue_id,
                    buffer_id,
                    offset,
                    data: r.trailing(data_len)?,
                }
            }
            CmdOpcode::QueueOnSubmittedWorkDone => {
                let queue_id = r.u32()?;
                r.padding_u32()?;
                Command::QueueOnSubmittedWorkDone {
                    queue_id,
                    request_serial: r.u64()?,
                }
            }
            CmdOpcode::DevicePushErrorScope => Command::DevicePushErrorScope {
                device_id: r.u32()?,
                filter: ErrorFilter::try_from(r.u32()?)?,
            },
            CmdOpcode::DevicePopErrorScope => {
                let device_id = r.u32()?;
                r.padding_u32()?;
                Command::DevicePopErrorScope {
                    device_id,
                    request_serial: r.u64()?,
                }
            }
            CmdOpcode::DeviceInjectError => {
                let device_id = r.u32()?;
                let ty = ErrorType::try_from(r.u32()?)?;
                let message_len = r.u32()?;
                r.padding_u32()?;
                Command::DeviceInjectError {
                    device_id,
                    ty,
                    message: r.str(message_len.into())?,
                }
            }
            CmdOpcode::BufferMapAsync => Command::BufferMapAsync {
                buffer_id: r.u32()?,
                mode: MapMode::from_bits_retain(r.u32()?),
                request_serial: r.u64()?,
                offset: r.u64()?,
                size: r.u64()?,
            },
            CmdOpcode::BufferUnmap => {
                let buffer_id = r.u32()?;
                r.padding_u32()?;
                let write_offset = r.u64()?;
                let data_len = r.u64()?;
                Command::BufferUnmap {
                    buffer_id,
                    write_offset,
                    data: r.trailing(data_len)?,
                }
            }
            CmdOpcode::BufferDestroy => Command::BufferDestroy {
                buffer_id: r.u32()?,
            },
        };
        r.finish()?;
        Ok(cmd)
    }
}

/// A server-to-client command. Objects are addressed by full handle so that
/// replies for objects the client already released can be recognized and dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCommand<'a> {
    Chunked(ChunkedCommand<'a>),
    DeviceUncapturedErrorCallback {
        device: ObjectHandle,
        ty: ErrorType,
        message: &'a str,
    },
    DeviceLostCallback {
        device: ObjectHandle,
        reason: DeviceLostReason,
        message: &'a str,
    },
    DevicePopErrorScopeCallback {
        device: ObjectHandle,
        request_serial: u64,
        ty: ErrorType,
        message: &'a str,
    },
    QueueWorkDoneCallback {
        queue: ObjectHandle,
        request_serial: u64,
        status: QueueWorkDoneStatus,
    },
    /// `data` is the mapped range for successful mappings, empty otherwise.
    BufferMapAsyncCallback {
        buffer: ObjectHandle,
        request_serial: u64,
        status: MapAsyncStatus,
        data: &'a [u8],
    },
}

impl<'a> ReturnCommand<'a> {
    pub fn opcode(&self) -> ReturnCmdOpcode {
        match self {
            ReturnCommand::Chunked(_) => ReturnCmdOpcode::ChunkedCommand,
            ReturnCommand::DeviceUncapturedErrorCallback { .. } => {
                ReturnCmdOpcode::DeviceUncapturedErrorCallback
            }
            ReturnCommand::DeviceLostCallback { .. } => ReturnCmdOpcode::DeviceLostCallback,
            ReturnCommand::DevicePopErrorScopeCallback { .. } => {
                ReturnCmdOpcode::DevicePopErrorScopeCallback
            }
            ReturnCommand::QueueWorkDoneCallback { .. } => ReturnCmdOpcode::QueueWorkDoneCallback,
            ReturnCommand::BufferMapAsyncCallback { .. } => ReturnCmdOpcode::BufferMapAsyncCallback,
        }
    }

    pub fn decode(packet: CmdPacket<'a>) -> Result<Self, DecodeError> {
        let opcode =
            ReturnCmdOpcode::from_u32(packet.hdr.opcode).ok_or(DecodeError::UnknownOpcode {
                found: packet.hdr.opcode,
            })?;
        let mut r = FieldReader::new(packet, opcode.fixed_size_bytes())?;

        let cmd = match opcode {
            ReturnCmdOpcode::ChunkedCommand => {
                return ChunkedCommand::decode(packet).map(ReturnCommand::Chunked)
            }
            ReturnCmdOpcode::DeviceUncapturedErrorCallback => {
                let device = r.handle()?;
                let ty = ErrorType::try_from(r.u32()?)?;
                let message_len = r.u32()?;
                ReturnCommand::DeviceUncapturedErrorCallback {
                    device,
                    ty,
                    message: r.str(message_len.into())?,
                }
            }
            ReturnCmdOpcode::DeviceLostCallback => {
                let device = r.handle()?;
                let reason = DeviceLostReason::try_from(r.u32()?)?;
                let message_len = r.u32()?;
                ReturnCommand::DeviceLostCallback {
                    device,
                    reason,
                    message: r.str(message_len.into())?,
                }
            }
            ReturnCmdOpcode::DevicePopErrorScopeCallback => {
                let device = r.handle()?;
                let request_serial = r.u64()?;
                let ty = ErrorType::try_from(r.u32()?)?;
                let message_len = r.u32()?;
                ReturnCommand::DevicePopErrorScopeCallback {
                    device,
                    request_serial,
                    ty,
                    message: r.str(message_len.into())?,
                }
            }
            ReturnCmdOpcode::QueueWorkDoneCallback => {
                let queue = r.handle()?;
                let request_serial = r.u64()?;
                let status = QueueWorkDoneStatus::try_from(r.u32()?)?;
                ReturnCommand::QueueWorkDoneCallback {
                    queue,
                    request_serial,
                    status,
                }
            }
            ReturnCmdOpcode::BufferMapAsyncCallback => {
                let buffer = r.handle()?;
                let request_serial = r.u64()?;
                let status = MapAsyncStatus::try_from(r.u32()?)?;
                r.padding_u32()?;
                let data_len = r.u64()?;
                ReturnCommand::BufferMapAsyncCallback {
                    buffer,
                    request_serial,
                    status,
                    data: r.trailing(data_len)?,
                }
            }
        };
        r.finish()?;
        Ok(cmd)
    }
}

pub fn decode_cmd_hdr_le(buf: &[u8]) -> Result<CmdHdr, DecodeError> {
    if buf.len() < CmdHdr::SIZE_BYTES {
        return Err(DecodeError::BufferTooSmall);
    }

    let opcode = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let size_bytes = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if size_bytes < CmdHdr::SIZE_BYTES as u32 {
        return Err(DecodeError::BadSizeBytes { found: size_bytes });
    }
    if size_bytes % 4 != 0 {
        return Err(DecodeError::SizeNotAligned { found: size_bytes });
    }

    Ok(CmdHdr { opcode, size_bytes })
}

/// A framed packet whose opcode has not been interpreted yet.
#[derive(Clone, Copy, Debug)]
pub struct CmdPacket<'a> {
    pub hdr: CmdHdr,
    /// The whole packet, header included.
    pub bytes: &'a [u8],
}

/// Splits a byte stream into packets. Stops after the first error.
pub struct CmdStreamIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CmdStreamIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }

    /// Bytes consumed by the packets yielded so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for CmdStreamIter<'a> {
    type Item = Result<CmdPacket<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }

        let hdr = match decode_cmd_hdr_le(&self.buf[self.offset..]) {
            Ok(hdr) => hdr,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        let packet_end = self.offset + hdr.size_bytes as usize;
        if packet_end > self.buf.len() {
            self.done = true;
            return Some(Err(DecodeError::PacketOverrunsStream {
                offset: self.offset,
                packet_size_bytes: hdr.size_bytes,
                stream_size_bytes: self.buf.len(),
            }));
        }

        let bytes = &self.buf[self.offset..packet_end];
        self.offset = packet_end;
        Some(Ok(CmdPacket { hdr, bytes }))
    }
}

/// Sequential little-endian field reader over one packet.
struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    fixed_size: usize,
}

impl<'a> FieldReader<'a> {
    fn new(packet: CmdPacket<'a>, fixed_size: usize) -> Result<Self, DecodeError> {
        if packet.bytes.len() < fixed_size {
            return Err(DecodeError::PacketTooSmall {
                size_bytes: packet.hdr.size_bytes,
                expected: fixed_size,
            });
        }
        Ok(Self {
            bytes: packet.bytes,
            pos: CmdHdr::SIZE_BYTES,
            fixed_size,
        })
    }

    /// The packet must end at the first 4-byte boundary after the fixed fields
    /// and the trailing data, and every byte not read as a field must be zero.
    fn finish(self) -> Result<(), DecodeError> {
        let expected = align_up(self.pos.max(self.fixed_size), 4);
        if self.bytes.len() != expected {
            return Err(DecodeError::PacketSizeMismatch {
                size_bytes: self.bytes.len(),
                expected,
            });
        }
        match self.bytes[self.pos..].iter().position(|b| *b != 0) {
            Some(at) => Err(DecodeError::NonZeroPadding {
                offset: self.pos + at,
            }),
            None => Ok(()),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.bytes.len() - self.pos;
        if len > available {
            return Err(DecodeError::TrailingDataOverrun {
                declared: len as u64,
                available,
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn padding_u32(&mut self) -> Result<(), DecodeError> {
        let offset = self.pos;
        match self.u32()? {
            0 => Ok(()),
            _ => Err(DecodeError::NonZeroPadding { offset }),
        }
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn handle(&mut self) -> Result<ObjectHandle, DecodeError> {
        let id = self.u32()?;
        let generation = self.u32()?;
        Ok(ObjectHandle::new(id, generation))
    }

    fn trailing(&mut self, declared: u64) -> Result<&'a [u8], DecodeError> {
        let available = self.bytes.len() - self.pos;
        match usize::try_from(declared) {
            Ok(len) if len <= available => self.take(len),
            _ => Err(DecodeError::TrailingDataOverrun {
                declared,
                available,
            }),
        }
    }

    fn str(&mut self, declared: u64) -> Result<&'a str, DecodeError> {
        let raw = self.trailing(declared)?;
        core::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// A zero length encodes "no label".
    fn label(&mut self, declared: u32) -> Result<Option<&'a str>, DecodeError> {
        if declared == 0 {
            return Ok(None);
        }
        self.str(declared.into()).map(Some)
    }
}
