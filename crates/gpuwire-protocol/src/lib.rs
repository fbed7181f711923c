//! Byte layouts of the gpuwire command streams.
//!
//! Both directions share the same framing: a packet is an 8-byte header
//! (`opcode: u32`, `size_bytes: u32`, little-endian) followed by fixed fields and
//! then trailing data whose length is declared in the fixed fields. `size_bytes`
//! covers the whole packet and is always a multiple of 4.
//!
//! - [`Command`] flows from client to server.
//! - [`ReturnCommand`] flows from server to client.

pub mod cmd;
pub mod cmd_writer;
mod error;

pub use cmd::{
    decode_cmd_hdr_le, ChunkedCommand, CmdHdr, CmdOpcode, CmdPacket, CmdStreamIter, Command,
    ObjectIdList, ReturnCmdOpcode, ReturnCommand,
};
pub use cmd_writer::{align_up, chunked_command_size_bytes, CmdStreamWriter, Packet};
pub use error::{DecodeError, EncodeError};
