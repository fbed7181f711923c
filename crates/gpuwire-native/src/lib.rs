//! Backend-independent core of the gpuwire implementation, plus a null backend.
//!
//! The null backend keeps every resource in host memory and "executes"
//! submissions synchronously, while still going through the same serial
//! tracking, staging ring and callback machinery a real backend would.

mod blob;
mod blob_cache;
mod buffer;
mod cache_key;
mod callback_queue;
mod command_encoder;
mod device;
mod error;
mod error_scope;
mod instance;
mod object_list;
mod procs;
mod queue;
mod ring_buffer;
mod serial;
mod shader_module;
mod sync;
mod texture;

pub use blob::Blob;
pub use blob_cache::{BlobCache, BlobCacheStats};
pub use buffer::Buffer;
pub use cache_key::{CacheKey, CacheKeySerializer};
pub use callback_queue::{run_callbacks, CallbackQueue, CallbackStatus, CallbackTask};
pub use command_encoder::{CommandBuffer, CommandEncoder};
pub use device::{Device, DeviceDescriptor, DeviceLimits};
pub use error::{NativeError, Result};
pub use error_scope::{ErrorScope, ErrorScopeStack};
pub use instance::Instance;
pub use object_list::{ApiObject, ApiObjectBase, ApiObjectList};
pub use procs::{NativeHandle, NativeProcs};
pub use queue::Queue;
pub use ring_buffer::RingBuffer;
pub use serial::{ExecutionQueue, ExecutionSerial, QueueBackend};
pub use shader_module::ShaderModule;
pub use texture::{Texture, TextureView};
