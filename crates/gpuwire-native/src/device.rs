use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use gpuwire_types::{
    BufferDescriptor, DeviceLostCallback, DeviceLostReason, ErrorFilter, ErrorType,
    PopErrorScopeCallback, TextureDescriptor, UncapturedErrorCallback,
};
use tracing::{debug, trace};

use crate::callback_queue::run_callbacks;
use crate::error::ensure;
use crate::sync::lock;
use crate::{
    ApiObject, ApiObjectList, BlobCache, Buffer, CallbackQueue, CallbackStatus, CallbackTask,
    CommandEncoder, ErrorScopeStack, ExecutionQueue, ExecutionSerial, NativeError, Queue,
    QueueBackend, Result, RingBuffer, ShaderModule, Texture,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor<'a> {
    pub label: Option<&'a str>,
    /// Size of the staging ring used by `Queue::write_buffer`.
    pub upload_ring_size: u64,
    pub max_buffer_size: u64,
    pub max_texture_dimension: u32,
}

impl Default for DeviceDescriptor<'_> {
    fn default() -> Self {
        Self {
            label: None,
            upload_ring_size: 1024 * 1024,
            max_buffer_size: 256 * 1024 * 1024,
            max_texture_dimension: 8192,
        }
    }
}

impl DeviceDescriptor<'_> {
    pub fn validate(&self) -> Result<()> {
        if self.upload_ring_size == 0 || self.upload_ring_size % 4 != 0 {
            return Err(NativeError::InvalidDescriptor(
                "upload_ring_size must be a non-zero multiple of 4",
            ));
        }
        if usize::try_from(self.upload_ring_size).is_err() {
            return Err(NativeError::InvalidDescriptor(
                "upload_ring_size does not fit in host memory",
            ));
        }
        if self.max_buffer_size == 0 {
            return Err(NativeError::InvalidDescriptor("max_buffer_size must be non-zero"));
        }
        if self.max_texture_dimension == 0 {
            return Err(NativeError::InvalidDescriptor(
                "max_texture_dimension must be non-zero",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_texture_dimension: u32,
}

/// Completion source of the null backend. Submitted work finishes on the next
/// poll unless the "GPU" is paused.
#[derive(Debug, Default)]
struct NullBackend {
    pending_commands: AtomicBool,
    paused: AtomicBool,
    gpu_completed: AtomicU64,
}

impl QueueBackend for Arc<NullBackend> {
    fn completed_serial(&self, last_submitted: ExecutionSerial) -> ExecutionSerial {
        if !self.paused.load(Ordering::Acquire) {
            self.gpu_completed
                .fetch_max(last_submitted.get(), Ordering::AcqRel);
        }
        ExecutionSerial(self.gpu_completed.load(Ordering::Acquire))
    }

    fn has_pending_commands(&self) -> bool {
        self.pending_commands.load(Ordering::Acquire)
    }
}

/// Where the bytes of a pending `write_buffer` live until submission.
#[derive(Debug)]
enum StagedData {
    Ring { offset: usize, len: usize },
    Owned(Vec<u8>),
}

#[derive(Debug)]
struct PendingWrite {
    buffer: Arc<Buffer>,
    offset: u64,
    data: StagedData,
}

/// Staging ring plus the writes waiting on it. Both sit behind one lock so a
/// write is always tracked under the serial of the submit that applies it.
#[derive(Debug)]
struct UploadRing {
    ring: RingBuffer,
    memory: Vec<u8>,
    pending: Vec<PendingWrite>,
}

pub struct Device {
    label: String,
    limits: DeviceLimits,
    blob_cache: Arc<BlobCache>,
    backend: Arc<NullBackend>,
    execution: ExecutionQueue,
    callbacks: CallbackQueue,
    objects: ApiObjectList,
    error_scopes: Mutex<HashMap<ThreadId, ErrorScopeStack>>,
    upload: Mutex<UploadRing>,
    uncaptured_error_callback: Mutex<Option<UncapturedErrorCallback>>,
    device_lost_callback: Mutex<Option<DeviceLostCallback>>,
    lost: AtomicBool,
}

impl Device {
    pub(crate) fn new(blob_cache: Arc<BlobCache>, desc: &DeviceDescriptor<'_>) -> Result<Arc<Self>> {
        desc.validate()?;
        let backend = Arc::new(NullBackend::default());
        let ring_size = usize::try_from(desc.upload_ring_size)
            .map_err(|_| NativeError::InvalidDescriptor("upload_ring_size does not fit in host memory"))?;

        let device = Arc::new(Self {
            label: desc.label.unwrap_or_default().to_owned(),
            limits: DeviceLimits {
                max_buffer_size: desc.max_buffer_size,
                max_texture_dimension: desc.max_texture_dimension,
            },
            blob_cache,
            execution: ExecutionQueue::new(Box::new(Arc::clone(&backend))),
            backend,
            callbacks: CallbackQueue::new(),
            objects: ApiObjectList::new(),
            error_scopes: Mutex::new(HashMap::new()),
            upload: Mutex::new(UploadRing {
                ring: RingBuffer::new(desc.upload_ring_size),
                memory: vec![0; ring_size],
                pending: Vec::new(),
            }),
            uncaptured_error_callback: Mutex::new(None),
            device_lost_callback: Mutex::new(None),
            lost: AtomicBool::new(false),
        });
        debug!(label = %device.label, "device created");
        Ok(device)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn execution_queue(&self) -> &ExecutionQueue {
        &self.execution
    }

    pub(crate) fn blob_cache(&self) -> &BlobCache {
        &self.blob_cache
    }

    pub(crate) fn objects(&self) -> &ApiObjectList {
        &self.objects
    }

    /// Stops the null GPU from completing work until resumed.
    pub fn set_gpu_paused(&self, paused: bool) {
        self.backend.paused.store(paused, Ordering::Release);
    }

    pub fn get_queue(self: &Arc<Self>) -> Arc<Queue> {
        Arc::new(Queue::new(Arc::clone(self)))
    }

    pub fn create_buffer(self: &Arc<Self>, desc: &BufferDescriptor<'_>) -> Arc<Buffer> {
        let buffer = match Buffer::create(self, desc) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.consume_error(err);
                Buffer::error(self, desc)
            }
        };
        self.track(&buffer);
        buffer
    }

    pub fn create_texture(self: &Arc<Self>, desc: &TextureDescriptor<'_>) -> Arc<Texture> {
        let texture = match Texture::create(self, desc) {
            Ok(texture) => texture,
            Err(err) => {
                self.consume_error(err);
                Texture::error(self, desc)
            }
        };
        self.track(&texture);
        texture
    }

    pub fn create_shader_module(
        self: &Arc<Self>,
        label: Option<&str>,
        code: &str,
    ) -> Arc<ShaderModule> {
        match ShaderModule::create(self, label, code) {
            Ok(module) => module,
            Err(err) => {
                self.consume_error(err);
                ShaderModule::error(self, label)
            }
        }
    }

    pub fn create_command_encoder(self: &Arc<Self>, label: Option<&str>) -> Arc<CommandEncoder> {
        Arc::new(CommandEncoder::new(self, label))
    }

    fn track<T: ApiObject + 'static>(&self, object: &Arc<T>) {
        let weak = Arc::downgrade(object);
        self.objects.track(weak);
    }

    pub fn push_error_scope(&self, filter: ErrorFilter) {
        lock(&self.error_scopes)
            .entry(thread::current().id())
            .or_default()
            .push(filter);
    }

    /// Pops the calling thread's innermost scope. The result is delivered once
    /// all work recorded so far has completed.
    pub fn pop_error_scope(&self, callback: PopErrorScopeCallback) {
        let scope = lock(&self.error_scopes)
            .get_mut(&thread::current().id())
            .and_then(ErrorScopeStack::pop);
        let (ty, message) = match scope {
            Some(scope) => scope.into_result(),
            None => (ErrorType::Validation, "No error scopes to pop".to_owned()),
        };

        self.enqueue_callback(Box::new(move |status| match status {
            CallbackStatus::Success => callback(ty, &message),
            CallbackStatus::DeviceLost => callback(ErrorType::DeviceLost, "Device lost"),
            CallbackStatus::Shutdown => {
                callback(ErrorType::Unknown, "Device destroyed before callback")
            }
        }));
    }

    /// Only validation and out-of-memory errors may be injected.
    pub fn inject_error(&self, ty: ErrorType, message: &str) {
        if !matches!(ty, ErrorType::Validation | ErrorType::OutOfMemory) {
            self.consume_error(NativeError::Validation(format!(
                "Invalid injected error type {ty:?}, must be Validation or OutOfMemory"
            )));
            return;
        }
        self.handle_error(ty, message);
    }

    pub fn set_uncaptured_error_callback(&self, callback: Option<UncapturedErrorCallback>) {
        *lock(&self.uncaptured_error_callback) = callback;
    }

    pub fn set_device_lost_callback(&self, callback: Option<DeviceLostCallback>) {
        *lock(&self.device_lost_callback) = callback;
    }

    pub(crate) fn consume_error(&self, err: NativeError) {
        let ty = err.error_type();
        self.handle_error(ty, &err.to_string());
    }

    /// Routes an error through the calling thread's scopes. Internal errors and
    /// device loss are fatal to the device.
    pub fn handle_error(&self, ty: ErrorType, message: &str) {
        if ty == ErrorType::DeviceLost {
            self.lose(DeviceLostReason::Unknown, message);
            return;
        }
        if self.is_lost() || ty == ErrorType::NoError {
            return;
        }
        trace!(?ty, message, "device error");

        let reaches_root = lock(&self.error_scopes)
            .entry(thread::current().id())
            .or_default()
            .handle_error(ty, message);

        if ty == ErrorType::Internal {
            self.lose(DeviceLostReason::Unknown, message);
        } else if reaches_root {
            self.report_uncaptured_error(ty, message);
        }
    }

    fn report_uncaptured_error(&self, ty: ErrorType, message: &str) {
        // Run outside the lock so the callback may call back into the device.
        let callback = lock(&self.uncaptured_error_callback).take();
        if let Some(mut callback) = callback {
            callback(ty, message);
            let mut slot = lock(&self.uncaptured_error_callback);
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    /// Marks the device lost. Every scope on every thread records the loss, the
    /// device-lost callback runs once, and all queued callbacks are flushed.
    pub fn lose(&self, reason: DeviceLostReason, message: &str) {
        self.lose_with(reason, message, CallbackStatus::DeviceLost);
    }

    fn lose_with(&self, reason: DeviceLostReason, message: &str, flush_status: CallbackStatus) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(label = %self.label, ?reason, message, "device lost");

        for stack in lock(&self.error_scopes).values_mut() {
            stack.handle_error(ErrorType::DeviceLost, message);
        }
        lock(&self.upload).pending.clear();
        self.backend.pending_commands.store(false, Ordering::Release);
        self.execution.assume_commands_complete();

        let callback = lock(&self.device_lost_callback).take();
        if let Some(callback) = callback {
            callback(reason, message);
        }
        run_callbacks(self.callbacks.acquire_all_callbacks(), flush_status);
    }

    /// Loses the device, drains queued callbacks with a shutdown status and
    /// destroys every tracked object.
    pub fn destroy(&self) {
        self.lose_with(
            DeviceLostReason::Destroyed,
            "Device was destroyed.",
            CallbackStatus::Shutdown,
        );
        self.objects.destroy_all();
    }

    /// Runs `task` once all work recorded so far has completed. Runs it right away
    /// if that is already the case, or if the device is lost.
    pub(crate) fn enqueue_callback(&self, task: CallbackTask) {
        if self.is_lost() {
            task(CallbackStatus::DeviceLost);
            return;
        }
        let serial = self.execution.scheduled_work_done_serial();
        if serial <= self.execution.completed_command_serial() {
            task(CallbackStatus::Success);
        } else {
            self.callbacks.enqueue(serial, task);
        }
    }

    /// Submits staged work, polls for completion, reclaims staging space and runs
    /// due callbacks.
    pub fn tick(&self) {
        if self.is_lost() {
            return;
        }
        if self.execution.has_pending_commands() {
            self.submit(|| {});
        }
        let completed = self.execution.check_passed_serials();
        lock(&self.upload)
            .ring
            .tick(completed, self.execution.pending_command_serial());
        run_callbacks(
            self.callbacks.acquire_callbacks_with_finished_serial(completed),
            CallbackStatus::Success,
        );
    }

    /// Applies staged writes, then `work`, as one submission.
    pub(crate) fn submit(&self, work: impl FnOnce()) -> ExecutionSerial {
        let mut upload = lock(&self.upload);
        let writes = std::mem::take(&mut upload.pending);
        self.backend.pending_commands.store(false, Ordering::Release);
        for write in &writes {
            let data = match &write.data {
                StagedData::Ring { offset, len } => &upload.memory[*offset..*offset + *len],
                StagedData::Owned(data) => data.as_slice(),
            };
            write.buffer.write_contents(write.offset, data);
        }
        work();

        // Everything sub-allocated so far was applied above, and nothing new can
        // be staged until the lock is released.
        let serial = self.execution.increment_last_submitted_command_serial();
        upload.ring.track(serial);
        drop(upload);
        trace!(%serial, writes = writes.len(), "submitted");
        serial
    }

    /// Copies `data` into the staging ring, or a heap copy if the ring is full,
    /// and records it for the next submission.
    pub(crate) fn stage_write(&self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) {
        let mut upload = lock(&self.upload);
        let staged = match upload.ring.sub_allocate(data.len() as u64) {
            Some(ring_offset) => {
                // Ring offsets are bounded by the ring size, which fits in usize.
                let start = ring_offset as usize;
                upload.memory[start..start + data.len()].copy_from_slice(data);
                StagedData::Ring {
                    offset: start,
                    len: data.len(),
                }
            }
            None => {
                trace!(len = data.len(), "upload ring full, staging on the heap");
                StagedData::Owned(data.to_vec())
            }
        };
        upload.pending.push(PendingWrite {
            buffer: Arc::clone(buffer),
            offset,
            data: staged,
        });
        self.backend.pending_commands.store(true, Ordering::Release);
    }

    pub(crate) fn validate_not_lost(&self) -> Result<()> {
        ensure!(!self.is_lost(), "Device is lost");
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.label)
            .field("lost", &self.is_lost())
            .field("execution", &self.execution)
            .finish()
    }
}
