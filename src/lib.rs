//! gpuwire: a WebGPU-style API split into a client and a server connected by a
//! byte stream of commands.
//!
//! - [`types`]: object handles, enums, descriptors and the [`types::Procs`] table
//! - [`protocol`]: packet layouts and the command stream codec
//! - [`native`]: the backend-independent core plus a null backend
//! - [`wire`]: the client and server ends of the stream

pub use gpuwire_native as native;
pub use gpuwire_protocol as protocol;
pub use gpuwire_types as types;
pub use gpuwire_wire as wire;
