//! Client and server ends of the gpuwire command stream.
//!
//! A [`Client`] turns API calls into [`gpuwire_protocol::Command`] packets and
//! hands out object handles without waiting for the other side. A [`Server`]
//! replays those packets against a [`gpuwire_types::Procs`] implementation and
//! sends asynchronous results back as return commands. Bytes move through a
//! [`CommandSerializer`] on the sending side and a [`CommandHandler`] on the
//! receiving side; [`ring_transport`] provides one backed by a shared ring.

pub mod client;
mod descriptor;
mod error;
pub mod known_objects;
pub mod object_store;
pub mod ring_transport;
mod serializer;
pub mod server;

pub use client::{
    Buffer, Client, CommandBuffer, CommandEncoder, Device, Queue, ShaderModule, Texture,
    TextureView, WireObject,
};
pub use descriptor::{WireClientDescriptor, WireServerDescriptor, MIN_ALLOCATION_SIZE};
pub use error::WireError;
pub use known_objects::{KnownEntry, KnownObjects, ObjectIdTable, Resolution};
pub use object_store::ObjectStore;
pub use ring_transport::{CommandRing, PopError, PushError, RingSerializer};
pub use serializer::{
    serialize_command, BufferSerializer, ChunkAssembler, CommandHandler, CommandSerializer,
};
pub use server::Server;
