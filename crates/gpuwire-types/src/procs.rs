use core::fmt::Debug;
use core::hash::Hash;

use crate::{
    BufferDescriptor, DeviceLostReason, ErrorFilter, ErrorType, MapAsyncStatus, MapMode,
    QueueWorkDoneStatus, TextureDescriptor, TextureViewDescriptor,
};

pub type UncapturedErrorCallback = Box<dyn FnMut(ErrorType, &str) + Send>;
pub type DeviceLostCallback = Box<dyn FnOnce(DeviceLostReason, &str) + Send>;
pub type PopErrorScopeCallback = Box<dyn FnOnce(ErrorType, &str) + Send>;
pub type QueueWorkDoneCallback = Box<dyn FnOnce(QueueWorkDoneStatus) + Send>;
pub type BufferMapCallback = Box<dyn FnOnce(MapAsyncStatus) + Send>;

/// Entry points of a real implementation, called by the wire server once every
/// argument has been resolved against its object tables.
///
/// Creation calls return `None` when the implementation could not produce any
/// object at all; the server then records an error object under the client's id.
/// Validation failures are expected to come back as `Some(handle)` of an
/// implementation-side error object instead.
pub trait Procs {
    type Handle: Copy + Eq + Hash + Debug;

    fn reference(&mut self, handle: Self::Handle);
    fn release(&mut self, handle: Self::Handle);

    fn device_create_buffer(
        &mut self,
        device: Self::Handle,
        desc: &BufferDescriptor<'_>,
    ) -> Option<Self::Handle>;
    fn device_create_texture(
        &mut self,
        device: Self::Handle,
        desc: &TextureDescriptor<'_>,
    ) -> Option<Self::Handle>;
    fn device_create_shader_module(
        &mut self,
        device: Self::Handle,
        label: Option<&str>,
        code: &str,
    ) -> Option<Self::Handle>;
    fn device_create_command_encoder(
        &mut self,
        device: Self::Handle,
        label: Option<&str>,
    ) -> Option<Self::Handle>;
    fn device_get_queue(&mut self, device: Self::Handle) -> Option<Self::Handle>;
    fn device_push_error_scope(&mut self, device: Self::Handle, filter: ErrorFilter);
    fn device_pop_error_scope(&mut self, device: Self::Handle, callback: PopErrorScopeCallback);
    fn device_inject_error(&mut self, device: Self::Handle, ty: ErrorType, message: &str);
    fn device_set_uncaptured_error_callback(
        &mut self,
        device: Self::Handle,
        callback: Option<UncapturedErrorCallback>,
    );
    fn device_set_device_lost_callback(
        &mut self,
        device: Self::Handle,
        callback: Option<DeviceLostCallback>,
    );
    /// Advances completion tracking and fires every callback that became due.
    fn device_tick(&mut self, device: Self::Handle);

    fn texture_create_view(
        &mut self,
        texture: Self::Handle,
        desc: &TextureViewDescriptor<'_>,
    ) -> Option<Self::Handle>;

    fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: Self::Handle,
        source: Self::Handle,
        source_offset: u64,
        destination: Self::Handle,
        destination_offset: u64,
        size: u64,
    );
    fn command_encoder_finish(
        &mut self,
        encoder: Self::Handle,
        label: Option<&str>,
    ) -> Option<Self::Handle>;

    fn queue_submit(&mut self, queue: Self::Handle, command_buffers: &[Self::Handle]);
    fn queue_write_buffer(
        &mut self,
        queue: Self::Handle,
        buffer: Self::Handle,
        offset: u64,
        data: &[u8],
    );
    fn queue_on_submitted_work_done(
        &mut self,
        queue: Self::Handle,
        callback: QueueWorkDoneCallback,
    );

    fn buffer_map_async(
        &mut self,
        buffer: Self::Handle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: BufferMapCallback,
    );
    /// Copy of a currently mapped range, `None` if the range is not mapped.
    fn buffer_read_mapped_range(
        &mut self,
        buffer: Self::Handle,
        offset: u64,
        size: u64,
    ) -> Option<Vec<u8>>;
    /// Writes into a currently mapped range. Returns `false` if the range is not
    /// mapped for writing.
    fn buffer_write_mapped_range(
        &mut self,
        buffer: Self::Handle,
        offset: u64,
        data: &[u8],
    ) -> bool;
    fn buffer_unmap(&mut self, buffer: Self::Handle);
    fn buffer_destroy(&mut self, buffer: Self::Handle);
}
