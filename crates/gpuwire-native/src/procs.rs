//! Handle-based front end over the null backend, as consumed by the wire server.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gpuwire_types::{
    BufferDescriptor, BufferMapCallback, DeviceLostCallback, ErrorFilter, ErrorType,
    MapAsyncStatus, MapMode, PopErrorScopeCallback, Procs, QueueWorkDoneCallback,
    QueueWorkDoneStatus, TextureDescriptor, TextureViewDescriptor, UncapturedErrorCallback,
};
use tracing::{trace, warn};

use crate::{
    Buffer, CommandBuffer, CommandEncoder, Device, DeviceDescriptor, Instance, Queue, Result,
    ShaderModule, Texture, TextureView,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native#{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum NativeObject {
    Device(Arc<Device>),
    Queue(Arc<Queue>),
    Buffer(Arc<Buffer>),
    Texture(Arc<Texture>),
    TextureView(Arc<TextureView>),
    ShaderModule(Arc<ShaderModule>),
    CommandEncoder(Arc<CommandEncoder>),
    CommandBuffer(Arc<CommandBuffer>),
}

impl NativeObject {
    fn kind(&self) -> &'static str {
        match self {
            NativeObject::Device(_) => "Device",
            NativeObject::Queue(_) => "Queue",
            NativeObject::Buffer(_) => "Buffer",
            NativeObject::Texture(_) => "Texture",
            NativeObject::TextureView(_) => "TextureView",
            NativeObject::ShaderModule(_) => "ShaderModule",
            NativeObject::CommandEncoder(_) => "CommandEncoder",
            NativeObject::CommandBuffer(_) => "CommandBuffer",
        }
    }
}

#[derive(Debug)]
struct Entry {
    object: NativeObject,
    refcount: u32,
}

/// Maps opaque [`NativeHandle`]s to null-backend objects, with one external
/// reference count per handle. Releasing the last reference of a device, buffer
/// or texture destroys it.
#[derive(Debug)]
pub struct NativeProcs {
    instance: Instance,
    objects: HashMap<NativeHandle, Entry>,
    next_handle: u64,
}

impl Default for NativeProcs {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, handle: NativeHandle) -> Option<&Arc<$ty>> {
            match self.objects.get(&handle).map(|entry| &entry.object) {
                Some(NativeObject::$variant(object)) => Some(object),
                _ => None,
            }
        }
    };
}

impl NativeProcs {
    pub fn new() -> Self {
        Self::with_instance(Instance::new())
    }

    pub fn with_instance(instance: Instance) -> Self {
        Self {
            instance,
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Creates a device owned by the caller with one reference.
    pub fn create_device(&mut self, desc: &DeviceDescriptor<'_>) -> Result<NativeHandle> {
        let device = self.instance.create_device(desc)?;
        Ok(self.insert(NativeObject::Device(device)))
    }

    accessor!(device, Device, Device);
    accessor!(queue, Queue, Queue);
    accessor!(buffer, Buffer, Buffer);
    accessor!(texture, Texture, Texture);
    accessor!(texture_view, TextureView, TextureView);
    accessor!(shader_module, ShaderModule, ShaderModule);
    accessor!(command_encoder, CommandEncoder, CommandEncoder);
    accessor!(command_buffer, CommandBuffer, CommandBuffer);

    /// Number of handles with at least one reference.
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn refcount(&self, handle: NativeHandle) -> u32 {
        self.objects.get(&handle).map_or(0, |entry| entry.refcount)
    }

    fn insert(&mut self, object: NativeObject) -> NativeHandle {
        let handle = NativeHandle(self.next_handle);
        self.next_handle += 1;
        trace!(%handle, kind = object.kind(), "native object created");
        self.objects.insert(handle, Entry { object, refcount: 1 });
        handle
    }

    fn require<T>(&self, handle: NativeHandle, kind: &str, found: Option<T>) -> Option<T> {
        if found.is_none() {
            warn!(%handle, kind, "handle does not name a live object of this kind");
        }
        found
    }

    fn device_of(&self, handle: NativeHandle) -> Option<Arc<Device>> {
        self.require(handle, "Device", self.device(handle).cloned())
    }

    fn buffer_of(&self, handle: NativeHandle) -> Option<Arc<Buffer>> {
        self.require(handle, "Buffer", self.buffer(handle).cloned())
    }
}

impl Procs for NativeProcs {
    type Handle = NativeHandle;

    fn reference(&mut self, handle: NativeHandle) {
        match self.objects.get_mut(&handle) {
            Some(entry) => entry.refcount += 1,
            None => warn!(%handle, "reference of an unknown handle"),
        }
    }

    fn release(&mut self, handle: NativeHandle) {
        let Some(entry) = self.objects.get_mut(&handle) else {
            warn!(%handle, "release of an unknown handle");
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        let Some(entry) = self.objects.remove(&handle) else {
            return;
        };
        trace!(%handle, kind = entry.object.kind(), "native object released");
        match entry.object {
            NativeObject::Device(device) => device.destroy(),
            NativeObject::Buffer(buffer) => buffer.destroy(),
            NativeObject::Texture(texture) => texture.destroy(),
            _ => {}
        }
    }

    fn device_create_buffer(
        &mut self,
        device: NativeHandle,
        desc: &BufferDescriptor<'_>,
    ) -> Option<NativeHandle> {
        let buffer = self.device_of(device)?.create_buffer(desc);
        Some(self.insert(NativeObject::Buffer(buffer)))
    }

    fn device_create_texture(
        &mut self,
        device: NativeHandle,
        desc: &TextureDescriptor<'_>,
    ) -> Option<NativeHandle> {
        let texture = self.device_of(device)?.create_texture(desc);
        Some(self.insert(NativeObject::Texture(texture)))
    }

    fn device_create_shader_module(
        &mut self,
        device: NativeHandle,
        label: Option<&str>,
        code: &str,
    ) -> Option<NativeHandle> {
        let module = self.device_of(device)?.create_shader_module(label, code);
        Some(self.insert(NativeObject::ShaderModule(module)))
    }

    fn device_create_command_encoder(
        &mut self,
        device: NativeHandle,
        label: Option<&str>,
    ) -> Option<NativeHandle> {
        let encoder = self.device_of(device)?.create_command_encoder(label);
        Some(self.insert(NativeObject::CommandEncoder(encoder)))
    }

    fn device_get_queue(&mut self, device: NativeHandle) -> Option<NativeHandle> {
        let queue = self.device_of(device)?.get_queue();
        Some(self.insert(NativeObject::Queue(queue)))
    }

    fn device_push_error_scope(&mut self, device: NativeHandle, filter: ErrorFilter) {
        if let Some(device) = self.device_of(device) {
            device.push_error_scope(filter);
        }
    }

    fn device_pop_error_scope(&mut self, device: NativeHandle, callback: PopErrorScopeCallback) {
        match self.device_of(device) {
            Some(device) => device.pop_error_scope(callback),
            None => callback(ErrorType::Unknown, "Unknown device"),
        }
    }

    fn device_inject_error(&mut self, device: NativeHandle, ty: ErrorType, message: &str) {
        if let Some(device) = self.device_of(device) {
            device.inject_error(ty, message);
        }
    }

    fn device_set_uncaptured_error_callback(
        &mut self,
        device: NativeHandle,
        callback: Option<UncapturedErrorCallback>,
    ) {
        if let Some(device) = self.device_of(device) {
            device.set_uncaptured_error_callback(callback);
        }
    }

    fn device_set_device_lost_callback(
        &mut self,
        device: NativeHandle,
        callback: Option<DeviceLostCallback>,
    ) {
        if let Some(device) = self.device_of(device) {
            device.set_device_lost_callback(callback);
        }
    }

    fn device_tick(&mut self, device: NativeHandle) {
        if let Some(device) = self.device_of(device) {
            device.tick();
        }
    }

    fn texture_create_view(
        &mut self,
        texture: NativeHandle,
        desc: &TextureViewDescriptor<'_>,
    ) -> Option<NativeHandle> {
        let texture = self.require(texture, "Texture", self.texture(texture).cloned())?;
        let view = texture.create_view(desc);
        Some(self.insert(NativeObject::TextureView(view)))
    }

    fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: NativeHandle,
        source: NativeHandle,
        source_offset: u64,
        destination: NativeHandle,
        destination_offset: u64,
        size: u64,
    ) {
        let encoder = self.require(encoder, "CommandEncoder", self.command_encoder(encoder).cloned());
        let (Some(encoder), Some(source), Some(destination)) =
            (encoder, self.buffer_of(source), self.buffer_of(destination))
        else {
            return;
        };
        encoder.copy_buffer_to_buffer(&source, source_offset, &destination, destination_offset, size);
    }

    fn command_encoder_finish(
        &mut self,
        encoder: NativeHandle,
        label: Option<&str>,
    ) -> Option<NativeHandle> {
        let encoder = self.require(encoder, "CommandEncoder", self.command_encoder(encoder).cloned())?;
        let command_buffer = encoder.finish(label);
        Some(self.insert(NativeObject::CommandBuffer(command_buffer)))
    }

    fn queue_submit(&mut self, queue: NativeHandle, command_buffers: &[NativeHandle]) {
        let Some(queue) = self.require(queue, "Queue", self.queue(queue).cloned()) else {
            return;
        };
        let resolved: Option<Vec<_>> = command_buffers
            .iter()
            .map(|&handle| self.require(handle, "CommandBuffer", self.command_buffer(handle).cloned()))
            .collect();
        if let Some(resolved) = resolved {
            queue.submit(&resolved);
        }
    }

    fn queue_write_buffer(&mut self, queue: NativeHandle, buffer: NativeHandle, offset: u64, data: &[u8]) {
        let queue = self.require(queue, "Queue", self.queue(queue).cloned());
        if let (Some(queue), Some(buffer)) = (queue, self.buffer_of(buffer)) {
            queue.write_buffer(&buffer, offset, data);
        }
    }

    fn queue_on_submitted_work_done(&mut self, queue: NativeHandle, callback: QueueWorkDoneCallback) {
        match self.require(queue, "Queue", self.queue(queue).cloned()) {
            Some(queue) => queue.on_submitted_work_done(callback),
            None => callback(QueueWorkDoneStatus::Unknown),
        }
    }

    fn buffer_map_async(
        &mut self,
        buffer: NativeHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: BufferMapCallback,
    ) {
        match self.buffer_of(buffer) {
            Some(buffer) => buffer.map_async(mode, offset, size, callback),
            None => callback(MapAsyncStatus::Unknown),
        }
    }

    fn buffer_read_mapped_range(&mut self, buffer: NativeHandle, offset: u64, size: u64) -> Option<Vec<u8>> {
        self.buffer_of(buffer)?.read_mapped_range(offset, size)
    }

    fn buffer_write_mapped_range(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> bool {
        self.buffer_of(buffer)
            .is_some_and(|buffer| buffer.write_mapped_range(offset, data))
    }

    fn buffer_unmap(&mut self, buffer: NativeHandle) {
        if let Some(buffer) = self.buffer_of(buffer) {
            buffer.unmap();
        }
    }

    fn buffer_destroy(&mut self, buffer: NativeHandle) {
        if let Some(buffer) = self.buffer_of(buffer) {
            buffer.destroy();
        }
    }
}
