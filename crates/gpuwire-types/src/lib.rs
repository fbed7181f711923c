//! Shared vocabulary for the gpuwire client, server and native implementation.
//!
//! Nothing in this crate knows about byte layouts or backends; it only names
//! things both sides of the wire have to agree on:
//! - object identity ([`ObjectType`], [`ObjectId`], [`ObjectHandle`])
//! - error / status enums delivered through callbacks
//! - creation descriptors
//! - the [`Procs`] table a server dispatches into

mod descriptors;
mod enums;
mod object;
mod procs;

pub use descriptors::{BufferDescriptor, TextureDescriptor, TextureViewDescriptor};
pub use enums::{
    BufferUsage, DeviceLostReason, ErrorFilter, ErrorType, MapAsyncStatus, MapMode,
    QueueWorkDoneStatus, TextureFormat, TextureUsage, UnknownEnumValue,
};
pub use object::{ObjectHandle, ObjectId, ObjectType, NULL_OBJECT_ID};
pub use procs::{
    BufferMapCallback, DeviceLostCallback, PopErrorScopeCallback, Procs, QueueWorkDoneCallback,
    UncapturedErrorCallback,
};
