//! Client end of a wire connection: hands out object handles synchronously and
//! turns calls into commands.

use std::collections::HashMap;

use gpuwire_protocol::{CmdPacket, Command, ObjectIdList, ReturnCommand};
use gpuwire_types::{
    BufferDescriptor, BufferMapCallback, DeviceLostCallback, DeviceLostReason, ErrorFilter,
    ErrorType, MapAsyncStatus, MapMode, ObjectHandle, ObjectType, PopErrorScopeCallback,
    QueueWorkDoneCallback, QueueWorkDoneStatus, TextureDescriptor, TextureViewDescriptor,
    UncapturedErrorCallback,
};
use tracing::{debug, trace, warn};

use crate::object_store::ObjectStore;
use crate::serializer::{process_stream, serialize_command, ChunkAssembler};
use crate::{CommandHandler, CommandSerializer, WireClientDescriptor, WireError};

/// Typed handle of a client object.
pub trait WireObject: Copy {
    const TYPE: ObjectType;

    fn from_handle(handle: ObjectHandle) -> Self;
    fn handle(self) -> ObjectHandle;
}

macro_rules! wire_objects {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
            pub struct $name(ObjectHandle);

            impl WireObject for $name {
                const TYPE: ObjectType = ObjectType::$name;

                fn from_handle(handle: ObjectHandle) -> Self {
                    Self(handle)
                }

                fn handle(self) -> ObjectHandle {
                    self.0
                }
            }
        )*
    };
}

wire_objects!(
    Device,
    Queue,
    Buffer,
    Texture,
    TextureView,
    ShaderModule,
    CommandEncoder,
    CommandBuffer,
);

trait Tracked {
    fn refcount(&mut self) -> &mut u32;
}

/// Every object remembers the device it was created from, so that misuse can
/// be reported there.
#[derive(Debug)]
struct ObjectState {
    refcount: u32,
    device: ObjectHandle,
}

impl ObjectState {
    fn new(device: ObjectHandle) -> Self {
        Self {
            refcount: 1,
            device,
        }
    }
}

impl Tracked for ObjectState {
    fn refcount(&mut self) -> &mut u32 {
        &mut self.refcount
    }
}

struct DeviceState {
    refcount: u32,
    lost: bool,
    uncaptured_error: Option<UncapturedErrorCallback>,
    device_lost: Option<DeviceLostCallback>,
    pop_requests: HashMap<u64, PopErrorScopeCallback>,
}

impl Tracked for DeviceState {
    fn refcount(&mut self) -> &mut u32 {
        &mut self.refcount
    }
}

struct QueueState {
    refcount: u32,
    device: ObjectHandle,
    work_done_requests: HashMap<u64, QueueWorkDoneCallback>,
}

impl Tracked for QueueState {
    fn refcount(&mut self) -> &mut u32 {
        &mut self.refcount
    }
}

enum MapState {
    Unmapped,
    MappedAtCreation {
        data: Vec<u8>,
    },
    Pending {
        request_serial: u64,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: BufferMapCallback,
    },
    Mapped {
        mode: MapMode,
        offset: u64,
        data: Vec<u8>,
    },
}

struct BufferState {
    refcount: u32,
    device: ObjectHandle,
    map: MapState,
}

impl Tracked for BufferState {
    fn refcount(&mut self) -> &mut u32 {
        &mut self.refcount
    }
}

fn add_ref<T: Tracked>(store: &mut ObjectStore<T>, handle: ObjectHandle) -> bool {
    match store.get_mut(handle) {
        Some(state) => {
            *state.refcount() += 1;
            true
        }
        None => false,
    }
}

/// Drops one reference. Returns the state once the last one is gone.
fn drop_ref<T: Tracked>(store: &mut ObjectStore<T>, handle: ObjectHandle) -> Option<T> {
    let state = store.get_mut(handle)?;
    *state.refcount() -= 1;
    if *state.refcount() > 0 {
        return None;
    }
    store.free(handle)
}

/// Client end of a wire connection.
///
/// Object-creating calls pick the id locally and return immediately; the
/// server mirrors the id when it replays the command. Asynchronous results come
/// back through [`CommandHandler::handle_commands`].
pub struct Client<S: CommandSerializer> {
    serializer: S,
    descriptor: WireClientDescriptor,
    assembler: ChunkAssembler,
    disconnected: bool,
    next_request_serial: u64,
    devices: ObjectStore<DeviceState>,
    queues: ObjectStore<QueueState>,
    buffers: ObjectStore<BufferState>,
    textures: ObjectStore<ObjectState>,
    texture_views: ObjectStore<ObjectState>,
    shader_modules: ObjectStore<ObjectState>,
    command_encoders: ObjectStore<ObjectState>,
    command_buffers: ObjectStore<ObjectState>,
}

impl<S: CommandSerializer> Client<S> {
    pub fn new(serializer: S, descriptor: WireClientDescriptor) -> Result<Self, WireError> {
        descriptor.validate()?;
        if serializer.maximum_allocation_size() < descriptor.max_allocation_size {
            return Err(WireError::InvalidDescriptor(
                "max_allocation_size exceeds what the serializer can provide",
            ));
        }
        Ok(Self {
            serializer,
            descriptor,
            assembler: ChunkAssembler::new(descriptor.max_chunked_command_size),
            disconnected: false,
            next_request_serial: 1,
            devices: ObjectStore::new(),
            queues: ObjectStore::new(),
            buffers: ObjectStore::new(),
            textures: ObjectStore::new(),
            texture_views: ObjectStore::new(),
            shader_modules: ObjectStore::new(),
            command_encoders: ObjectStore::new(),
            command_buffers: ObjectStore::new(),
        })
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    pub fn serializer_mut(&mut self) -> &mut S {
        &mut self.serializer
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn flush(&mut self) -> bool {
        self.serializer.flush()
    }

    fn send(&mut self, cmd: &Command<'_>) {
        if self.disconnected {
            return;
        }
        if let Err(err) = self.serialize(cmd) {
            warn!(%err, opcode = ?cmd.opcode(), "failed to serialize command");
            self.disconnect();
        }
    }

    fn serialize(&mut self, cmd: &Command<'_>) -> Result<(), WireError> {
        let mut limited = LimitedSerializer {
            inner: &mut self.serializer,
            max_allocation_size: self.descriptor.max_allocation_size,
        };
        serialize_command(&mut limited, cmd)
    }

    fn next_request_serial(&mut self) -> u64 {
        let serial = self.next_request_serial;
        self.next_request_serial += 1;
        serial
    }

    /// Reserves a device handle for the server to inject a device under.
    pub fn reserve_device(&mut self) -> Option<Device> {
        let handle = self.devices.reserve(DeviceState {
            refcount: 1,
            lost: false,
            uncaptured_error: None,
            device_lost: None,
            pop_requests: HashMap::new(),
        })?;
        trace!(%handle, "device reserved");
        Some(Device(handle))
    }

    pub fn reference<T: WireObject>(&mut self, object: T) -> bool {
        let handle = object.handle();
        match T::TYPE {
            ObjectType::Device => add_ref(&mut self.devices, handle),
            ObjectType::Queue => add_ref(&mut self.queues, handle),
            ObjectType::Buffer => add_ref(&mut self.buffers, handle),
            ObjectType::Texture => add_ref(&mut self.textures, handle),
            ObjectType::TextureView => add_ref(&mut self.texture_views, handle),
            ObjectType::ShaderModule => add_ref(&mut self.shader_modules, handle),
            ObjectType::CommandEncoder => add_ref(&mut self.command_encoders, handle),
            ObjectType::CommandBuffer => add_ref(&mut self.command_buffers, handle),
        }
    }

    /// Drops a reference. The last release frees the id, fails the object's
    /// pending requests and, for everything but devices, destroys the server
    /// object.
    pub fn release<T: WireObject>(&mut self, object: T) {
        let handle = object.handle();
        let freed = match T::TYPE {
            ObjectType::Device => {
                if let Some(state) = drop_ref(&mut self.devices, handle) {
                    fail_device(state, DeviceLostReason::Destroyed, "Device was destroyed.");
                }
                return;
            }
            ObjectType::Queue => drop_ref(&mut self.queues, handle).map(|state| {
                for (_, callback) in state.work_done_requests {
                    callback(QueueWorkDoneStatus::Unknown);
                }
            }),
            ObjectType::Buffer => drop_ref(&mut self.buffers, handle).map(|state| {
                if let MapState::Pending { callback, .. } = state.map {
                    callback(MapAsyncStatus::DestroyedBeforeCallback);
                }
            }),
            ObjectType::Texture => drop_ref(&mut self.textures, handle).map(drop),
            ObjectType::TextureView => drop_ref(&mut self.texture_views, handle).map(drop),
            ObjectType::ShaderModule => drop_ref(&mut self.shader_modules, handle).map(drop),
            ObjectType::CommandEncoder => drop_ref(&mut self.command_encoders, handle).map(drop),
            ObjectType::CommandBuffer => drop_ref(&mut self.command_buffers, handle).map(drop),
        };
        if freed.is_some() {
            trace!(ty = %T::TYPE, %handle, "object released");
            self.send(&Command::DestroyObject {
                object_type: T::TYPE,
                object_id: handle.id,
            });
        }
    }

    /// Device that owns `object`, or `None` if the handle does not name a live
    /// object. A device owns itself.
    fn owner<T: WireObject>(&self, object: T) -> Option<ObjectHandle> {
        let handle = object.handle();
        match T::TYPE {
            ObjectType::Device => self.devices.get(handle).map(|_| handle),
            ObjectType::Queue => self.queues.get(handle).map(|s| s.device),
            ObjectType::Buffer => self.buffers.get(handle).map(|s| s.device),
            ObjectType::Texture => self.textures.get(handle).map(|s| s.device),
            ObjectType::TextureView => self.texture_views.get(handle).map(|s| s.device),
            ObjectType::ShaderModule => self.shader_modules.get(handle).map(|s| s.device),
            ObjectType::CommandEncoder => self.command_encoders.get(handle).map(|s| s.device),
            ObjectType::CommandBuffer => self.command_buffers.get(handle).map(|s| s.device),
        }
    }

    /// Owner of the object a call is made on. Calls on released objects are
    /// dropped: there is no live device left to report them to.
    fn receiver<T: WireObject>(&self, object: T) -> Option<ObjectHandle> {
        let owner = self.owner(object);
        if owner.is_none() {
            debug!(ty = %T::TYPE, handle = %object.handle(), "call on a released object dropped");
        }
        owner
    }

    /// Checks an argument of a call made on an object owned by `device`. A
    /// released argument turns the call into a validation error on `device`
    /// instead of reaching the server.
    fn check_argument<T: WireObject>(&mut self, device: ObjectHandle, object: T) -> bool {
        if self.owner(object).is_some() {
            return true;
        }
        let handle = object.handle();
        debug!(ty = %T::TYPE, %handle, "released object passed as an argument");
        let message = format!("{} {handle} was used after it was released", T::TYPE);
        self.send(&Command::DeviceInjectError {
            device_id: device.id,
            ty: ErrorType::Validation,
            message: &message,
        });
        false
    }

    fn new_object<T: WireObject>(&mut self, device: ObjectHandle) -> Option<T> {
        let state = ObjectState::new(device);
        let handle = match T::TYPE {
            ObjectType::Texture => self.textures.reserve(state),
            ObjectType::TextureView => self.texture_views.reserve(state),
            ObjectType::ShaderModule => self.shader_modules.reserve(state),
            ObjectType::CommandEncoder => self.command_encoders.reserve(state),
            ObjectType::CommandBuffer => self.command_buffers.reserve(state),
            ObjectType::Device | ObjectType::Queue | ObjectType::Buffer => None,
        }?;
        Some(T::from_handle(handle))
    }

    pub fn device_create_buffer(
        &mut self,
        device: Device,
        desc: &BufferDescriptor<'_>,
    ) -> Option<Buffer> {
        let owner = self.receiver(device)?;
        let map = if desc.mapped_at_creation {
            match mapped_at_creation_data(desc.size) {
                Some(data) => MapState::MappedAtCreation { data },
                None => MapState::Unmapped,
            }
        } else {
            MapState::Unmapped
        };
        let result = self.buffers.reserve(BufferState {
            refcount: 1,
            device: owner,
            map,
        })?;
        self.send(&Command::DeviceCreateBuffer {
            device_id: device.0.id,
            result,
            desc: *desc,
        });
        Some(Buffer(result))
    }

    pub fn device_create_texture(
        &mut self,
        device: Device,
        desc: &TextureDescriptor<'_>,
    ) -> Option<Texture> {
        let owner = self.receiver(device)?;
        let texture: Texture = self.new_object(owner)?;
        self.send(&Command::DeviceCreateTexture {
            device_id: device.0.id,
            result: texture.0,
            desc: *desc,
        });
        Some(texture)
    }

    pub fn texture_create_view(
        &mut self,
        texture: Texture,
        desc: &TextureViewDescriptor<'_>,
    ) -> Option<TextureView> {
        let owner = self.receiver(texture)?;
        let view: TextureView = self.new_object(owner)?;
        self.send(&Command::TextureCreateView {
            texture_id: texture.0.id,
            result: view.0,
            desc: *desc,
        });
        Some(view)
    }

    pub fn device_create_shader_module(
        &mut self,
        device: Device,
        label: Option<&str>,
        code: &str,
    ) -> Option<ShaderModule> {
        let owner = self.receiver(device)?;
        let module: ShaderModule = self.new_object(owner)?;
        self.send(&Command::DeviceCreateShaderModule {
            device_id: device.0.id,
            result: module.0,
            label,
            code,
        });
        Some(module)
    }

    pub fn device_create_command_encoder(
        &mut self,
        device: Device,
        label: Option<&str>,
    ) -> Option<CommandEncoder> {
        let owner = self.receiver(device)?;
        let encoder: CommandEncoder = self.new_object(owner)?;
        self.send(&Command::DeviceCreateCommandEncoder {
            device_id: device.0.id,
            result: encoder.0,
            label,
        });
        Some(encoder)
    }

    pub fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: CommandEncoder,
        source: Buffer,
        source_offset: u64,
        destination: Buffer,
        destination_offset: u64,
        size: u64,
    ) {
        let Some(owner) = self.receiver(encoder) else {
            return;
        };
        if !self.check_argument(owner, source) || !self.check_argument(owner, destination) {
            return;
        }
        self.send(&Command::CommandEncoderCopyBufferToBuffer {
            encoder_id: encoder.0.id,
            source_id: source.0.id,
            source_offset,
            destination_id: destination.0.id,
            destination_offset,
            size,
        });
    }

    pub fn command_encoder_finish(
        &mut self,
        encoder: CommandEncoder,
        label: Option<&str>,
    ) -> Option<CommandBuffer> {
        let owner = self.receiver(encoder)?;
        let command_buffer: CommandBuffer = self.new_object(owner)?;
        self.send(&Command::CommandEncoderFinish {
            encoder_id: encoder.0.id,
            result: command_buffer.0,
            label,
        });
        Some(command_buffer)
    }

    pub fn device_get_queue(&mut self, device: Device) -> Option<Queue> {
        let owner = self.receiver(device)?;
        let result = self.queues.reserve(QueueState {
            refcount: 1,
            device: owner,
            work_done_requests: HashMap::new(),
        })?;
        self.send(&Command::DeviceGetQueue {
            device_id: device.0.id,
            result,
        });
        Some(Queue(result))
    }

    pub fn queue_submit(&mut self, queue: Queue, command_buffers: &[CommandBuffer]) {
        let Some(owner) = self.receiver(queue) else {
            return;
        };
        for &command_buffer in command_buffers {
            if !self.check_argument(owner, command_buffer) {
                return;
            }
        }
        let ids: Vec<u8> = command_buffers
            .iter()
            .flat_map(|cb| cb.0.id.to_le_bytes())
            .collect();
        self.send(&Command::QueueSubmit {
            queue_id: queue.0.id,
            command_buffers: ObjectIdList::from_raw(&ids),
        });
    }

    pub fn queue_write_buffer(&mut self, queue: Queue, buffer: Buffer, offset: u64, data: &[u8]) {
        let Some(owner) = self.receiver(queue) else {
            return;
        };
        if !self.check_argument(owner, buffer) {
            return;
        }
        self.send(&Command::QueueWriteBuffer {
            queue_id: queue.0.id,
            buffer_id: buffer.0.id,
            offset,
            data,
        });
    }

    pub fn queue_on_submitted_work_done(&mut self, queue: Queue, callback: QueueWorkDoneCallback) {
        if self.disconnected {
            callback(QueueWorkDoneStatus::DeviceLost);
            return;
        }
        let request_serial = self.next_request_serial();
        let Some(state) = self.queues.get_mut(queue.0) else {
            callback(QueueWorkDoneStatus::Unknown);
            return;
        };
        state.work_done_requests.insert(request_serial, callback);
        self.send(&Command::QueueOnSubmittedWorkDone {
            queue_id: queue.0.id,
            request_serial,
        });
    }

    pub fn device_push_error_scope(&mut self, device: Device, filter: ErrorFilter) {
        if self.receiver(device).is_none() {
            return;
        }
        self.send(&Command::DevicePushErrorScope {
            device_id: device.0.id,
            filter,
        });
    }

    pub fn device_pop_error_scope(&mut self, device: Device, callback: PopErrorScopeCallback) {
        if self.disconnected {
            callback(ErrorType::DeviceLost, "GPU device disconnected");
            return;
        }
        let request_serial = self.next_request_serial();
        let Some(state) = self.devices.get_mut(device.0) else {
            callback(ErrorType::Unknown, "Device destroyed before callback");
            return;
        };
        state.pop_requests.insert(request_serial, callback);
        self.send(&Command::DevicePopErrorScope {
            device_id: device.0.id,
            request_serial,
        });
    }

    pub fn device_inject_error(&mut self, device: Device, ty: ErrorType, message: &str) {
        if self.receiver(device).is_none() {
            return;
        }
        self.send(&Command::DeviceInjectError {
            device_id: device.0.id,
            ty,
            message,
        });
    }

    pub fn device_set_uncaptured_error_callback(
        &mut self,
        device: Device,
        callback: Option<UncapturedErrorCallback>,
    ) {
        if let Some(state) = self.devices.get_mut(device.0) {
            state.uncaptured_error = callback;
        }
    }

    pub fn device_set_device_lost_callback(
        &mut self,
        device: Device,
        callback: Option<DeviceLostCallback>,
    ) {
        if let Some(state) = self.devices.get_mut(device.0) {
            if !state.lost {
                state.device_lost = callback;
            }
        }
    }

    /// Whether the server reported the device lost, or the connection is gone.
    pub fn device_is_lost(&self, device: Device) -> bool {
        self.disconnected || self.devices.get(device.0).map_or(true, |state| state.lost)
    }

    /// Starts an asynchronous mapping. A second mapping while one is pending or
    /// active fails locally without reaching the server.
    pub fn buffer_map_async(
        &mut self,
        buffer: Buffer,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: BufferMapCallback,
    ) {
        if self.disconnected {
            callback(MapAsyncStatus::DeviceLost);
            return;
        }
        let request_serial = self.next_request_serial();
        let Some(state) = self.buffers.get_mut(buffer.0) else {
            callback(MapAsyncStatus::DestroyedBeforeCallback);
            return;
        };
        if !matches!(state.map, MapState::Unmapped) {
            callback(MapAsyncStatus::ValidationError);
            return;
        }
        state.map = MapState::Pending {
            request_serial,
            mode,
            offset,
            size,
            callback,
        };
        self.send(&Command::BufferMapAsync {
            buffer_id: buffer.0.id,
            mode,
            request_serial,
            offset,
            size,
        });
    }

    /// Bytes of an active mapping, `None` if `[offset, offset + size)` is not
    /// mapped.
    pub fn buffer_get_mapped_range(&self, buffer: Buffer, offset: u64, size: u64) -> Option<&[u8]> {
        let state = self.buffers.get(buffer.0)?;
        let (base, data) = match &state.map {
            MapState::MappedAtCreation { data } => (0, data),
            MapState::Mapped {
                offset: base, data, ..
            } => (*base, data),
            _ => return None,
        };
        let (start, end) = mapped_bounds(base, data.len(), offset, size)?;
        data.get(start..end)
    }

    /// Writable bytes of a write mapping or a mapping at creation.
    pub fn buffer_get_mapped_range_mut(
        &mut self,
        buffer: Buffer,
        offset: u64,
        size: u64,
    ) -> Option<&mut [u8]> {
        let state = self.buffers.get_mut(buffer.0)?;
        let (base, data) = match &mut state.map {
            MapState::MappedAtCreation { data } => (0, data),
            MapState::Mapped {
                mode,
                offset: base,
                data,
            } if *mode == MapMode::WRITE => (*base, data),
            _ => return None,
        };
        let (start, end) = mapped_bounds(base, data.len(), offset, size)?;
        data.get_mut(start..end)
    }

    /// Ends the current mapping, sending back what was written into a write
    /// mapping.
    pub fn buffer_unmap(&mut self, buffer: Buffer) {
        let Some(state) = self.buffers.get_mut(buffer.0) else {
            return;
        };
        let (write_offset, data) = match std::mem::replace(&mut state.map, MapState::Unmapped) {
            MapState::MappedAtCreation { data } => (0, data),
            MapState::Mapped {
                mode,
                offset,
                data,
            } if mode == MapMode::WRITE => (offset, data),
            MapState::Pending { callback, .. } => {
                callback(MapAsyncStatus::UnmappedBeforeCallback);
                (0, Vec::new())
            }
            _ => (0, Vec::new()),
        };
        self.send(&Command::BufferUnmap {
            buffer_id: buffer.0.id,
            write_offset,
            data: &data,
        });
    }

    pub fn buffer_destroy(&mut self, buffer: Buffer) {
        let Some(state) = self.buffers.get_mut(buffer.0) else {
            debug!(handle = %buffer.0, "destroy of a released buffer dropped");
            return;
        };
        if let MapState::Pending { callback, .. } =
            std::mem::replace(&mut state.map, MapState::Unmapped)
        {
            callback(MapAsyncStatus::DestroyedBeforeCallback);
        }
        self.send(&Command::BufferDestroy {
            buffer_id: buffer.0.id,
        });
    }

    /// Stops sending commands and fails everything still waiting on the server.
    /// Bytes already serialized stay in the serializer.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        debug!("wire client disconnected");

        for (_, device) in self.devices.iter_mut() {
            device.lost = true;
            for (_, callback) in device.pop_requests.drain() {
                callback(ErrorType::Unknown, "GPU device disconnected");
            }
            if let Some(callback) = device.device_lost.take() {
                callback(DeviceLostReason::Unknown, "GPU connection lost");
            }
        }
        for (_, queue) in self.queues.iter_mut() {
            for (_, callback) in queue.work_done_requests.drain() {
                callback(QueueWorkDoneStatus::Unknown);
            }
        }
        for (_, buffer) in self.buffers.iter_mut() {
            if !matches!(buffer.map, MapState::Pending { .. }) {
                continue;
            }
            if let MapState::Pending { callback, .. } =
                std::mem::replace(&mut buffer.map, MapState::Unmapped)
            {
                callback(MapAsyncStatus::Unknown);
            }
        }
    }

    fn handle_packet(&mut self, packet: CmdPacket<'_>) -> Result<(), WireError> {
        match ReturnCommand::decode(packet)? {
            ReturnCommand::Chunked(_) => Err(WireError::NestedChunk),
            ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                ty,
                message,
            } => {
                if let Some(callback) = self
                    .devices
                    .get_mut(device)
                    .and_then(|state| state.uncaptured_error.as_mut())
                {
                    callback(ty, message);
                }
                Ok(())
            }
            ReturnCommand::DeviceLostCallback {
                device,
                reason,
                message,
            } => {
                if self.disconnected {
                    return Ok(());
                }
                if let Some(state) = self.devices.get_mut(device) {
                    state.lost = true;
                    if let Some(callback) = state.device_lost.take() {
                        callback(reason, message);
                    }
                }
                debug!(%device, ?reason, "device lost");
                Ok(())
            }
            ReturnCommand::DevicePopErrorScopeCallback {
                device,
                request_serial,
                ty,
                message,
            } => {
                if let Some(callback) = self
                    .devices
                    .get_mut(device)
                    .and_then(|state| state.pop_requests.remove(&request_serial))
                {
                    callback(ty, message);
                }
                Ok(())
            }
            ReturnCommand::QueueWorkDoneCallback {
                queue,
                request_serial,
                status,
            } => {
                if let Some(callback) = self
                    .queues
                    .get_mut(queue)
                    .and_then(|state| state.work_done_requests.remove(&request_serial))
                {
                    callback(status);
                }
                Ok(())
            }
            ReturnCommand::BufferMapAsyncCallback {
                buffer,
                request_serial,
                status,
                data,
            } => self.on_map_done(buffer, request_serial, status, data),
        }
    }

    fn on_map_done(
        &mut self,
        buffer: ObjectHandle,
        request_serial: u64,
        status: MapAsyncStatus,
        data: &[u8],
    ) -> Result<(), WireError> {
        let Some(state) = self.buffers.get_mut(buffer) else {
            return Ok(());
        };
        let MapState::Pending {
            request_serial: pending,
            size,
            ..
        } = state.map
        else {
            return Ok(());
        };
        if pending != request_serial {
            return Ok(());
        }
        if status == MapAsyncStatus::Success && data.len() as u64 != size {
            return Err(WireError::MappedDataMismatch {
                expected: size,
                found: data.len(),
            });
        }
        let MapState::Pending {
            mode,
            offset,
            callback,
            ..
        } = std::mem::replace(&mut state.map, MapState::Unmapped)
        else {
            return Ok(());
        };
        if status == MapAsyncStatus::Success {
            state.map = MapState::Mapped {
                mode,
                offset,
                data: data.to_vec(),
            };
        }
        callback(status);
        Ok(())
    }
}

impl<S: CommandSerializer> CommandHandler for Client<S> {
    fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Option<&'a [u8]> {
        let mut assembler = std::mem::replace(
            &mut self.assembler,
            ChunkAssembler::new(self.descriptor.max_chunked_command_size),
        );
        let result = process_stream(commands, &mut assembler, &mut |packet| {
            self.handle_packet(packet)
        });
        self.assembler = assembler;
        match result {
            Ok(()) => Some(&commands[commands.len()..]),
            Err(err) => {
                warn!(%err, "fatal error in server command stream");
                None
            }
        }
    }
}

fn fail_device(state: DeviceState, reason: DeviceLostReason, message: &str) {
    for (_, callback) in state.pop_requests {
        callback(ErrorType::Unknown, "Device destroyed before callback");
    }
    if let Some(callback) = state.device_lost {
        callback(reason, message);
    }
}

fn mapped_at_creation_data(size: u64) -> Option<Vec<u8>> {
    let size = usize::try_from(size).ok()?;
    let mut data = Vec::new();
    data.try_reserve_exact(size).ok()?;
    data.resize(size, 0);
    Some(data)
}

fn mapped_bounds(base: u64, len: usize, offset: u64, size: u64) -> Option<(usize, usize)> {
    let start = offset.checked_sub(base)?;
    let end = start.checked_add(size)?;
    if end > len as u64 {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(end).ok()?))
}

/// Caps the allocation size the chunking path sees at the client's limit.
struct LimitedSerializer<'s, S: CommandSerializer> {
    inner: &'s mut S,
    max_allocation_size: usize,
}

impl<S: CommandSerializer> CommandSerializer for LimitedSerializer<'_, S> {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        self.inner.get_cmd_space(size)
    }

    fn flush(&mut self) -> bool {
        self.inner.flush()
    }

    fn maximum_allocation_size(&self) -> usize {
        self.max_allocation_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferSerializer;
    use gpuwire_protocol::{CmdOpcode, CmdStreamIter, CmdStreamWriter};
    use gpuwire_types::BufferUsage;
    use std::sync::{Arc, Mutex};

    type TestClient = Client<BufferSerializer>;

    fn client() -> TestClient {
        Client::new(BufferSerializer::new(64 * 1024), WireClientDescriptor::default()).unwrap()
    }

    fn sent_opcodes(client: &mut TestClient) -> Vec<CmdOpcode> {
        let bytes = client.serializer_mut().take();
        CmdStreamIter::new(&bytes)
            .map(|p| Command::decode(p.unwrap()).unwrap().opcode())
            .collect()
    }

    fn reply(client: &mut TestClient, cmds: &[ReturnCommand<'_>]) -> bool {
        let mut writer = CmdStreamWriter::new();
        for cmd in cmds {
            writer.push(cmd).unwrap();
        }
        let bytes = writer.finish();
        client.handle_commands(&bytes).is_some()
    }

    fn map_log() -> (Arc<Mutex<Vec<MapAsyncStatus>>>, impl Fn() -> BufferMapCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move || -> BufferMapCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |status| sink.lock().unwrap().push(status))
        };
        (log, make)
    }

    fn readable(client: &mut TestClient, device: Device, size: u64) -> Buffer {
        client
            .device_create_buffer(
                device,
                &BufferDescriptor {
                    label: None,
                    usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                    size,
                    mapped_at_creation: false,
                },
            )
            .unwrap()
    }

    #[test]
    fn ids_are_chosen_locally() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        assert_eq!(device.handle(), ObjectHandle::new(1, 0));
        let buffer = readable(&mut client, device, 16);
        let encoder = client.device_create_command_encoder(device, Some("enc")).unwrap();
        assert_eq!(buffer.handle(), ObjectHandle::new(1, 0));
        assert_eq!(encoder.handle(), ObjectHandle::new(1, 0));

        let bytes = client.serializer_mut().take();
        let cmds: Vec<_> = CmdStreamIter::new(&bytes)
            .map(|p| Command::decode(p.unwrap()).unwrap())
            .collect();
        assert!(matches!(
            cmds[0],
            Command::DeviceCreateBuffer { device_id: 1, result, .. } if result == buffer.handle()
        ));
        assert!(matches!(
            cmds[1],
            Command::DeviceCreateCommandEncoder { device_id: 1, label: Some("enc"), .. }
        ));
    }

    #[test]
    fn destroy_is_sent_when_the_last_reference_goes() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let texture = client
            .device_create_texture(device, &TextureDescriptor::default())
            .unwrap();
        sent_opcodes(&mut client);

        assert!(client.reference(texture));
        client.release(texture);
        assert!(sent_opcodes(&mut client).is_empty());
        client.release(texture);
        assert_eq!(sent_opcodes(&mut client), vec![CmdOpcode::DestroyObject]);
        assert!(!client.reference(texture));

        let again = client
            .device_create_texture(device, &TextureDescriptor::default())
            .unwrap();
        assert_eq!(again.handle(), ObjectHandle::new(texture.handle().id, 1));
        sent_opcodes(&mut client);

        // Devices are torn down out of band, never with DestroyObject.
        client.release(device);
        assert!(sent_opcodes(&mut client).is_empty());
        assert!(!client.reference(device));
    }

    #[test]
    fn released_handles_never_reach_the_server() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let queue = client.device_get_queue(device).unwrap();
        let stale = readable(&mut client, device, 16);
        client.release(stale);
        sent_opcodes(&mut client);

        client.queue_write_buffer(queue, stale, 0, &[0xaa; 16]);
        let bytes = client.serializer_mut().take();
        let packets: Vec<_> = CmdStreamIter::new(&bytes)
            .map(|p| Command::decode(p.unwrap()).unwrap())
            .collect();
        let [Command::DeviceInjectError {
            device_id,
            ty: ErrorType::Validation,
            message,
        }] = packets.as_slice()
        else {
            panic!("expected a single injected validation error, got {packets:?}");
        };
        assert_eq!(*device_id, device.handle().id);
        assert!(message.contains("Buffer 1@0"), "{message}");

        // The slot is reused; the old handle must not reach the new buffer.
        let live = readable(&mut client, device, 16);
        assert_eq!(live.handle(), ObjectHandle::new(stale.handle().id, 1));
        sent_opcodes(&mut client);
        client.queue_write_buffer(queue, stale, 0, &[0xaa; 16]);
        let encoder = client.device_create_command_encoder(device, None).unwrap();
        client.command_encoder_copy_buffer_to_buffer(encoder, stale, 0, live, 0, 16);
        client.buffer_destroy(stale);
        assert_eq!(
            sent_opcodes(&mut client),
            vec![
                CmdOpcode::DeviceInjectError,
                CmdOpcode::DeviceCreateCommandEncoder,
                CmdOpcode::DeviceInjectError,
            ]
        );

        let (log, callback) = map_log();
        client.buffer_map_async(stale, MapMode::READ, 0, 16, callback());
        assert_eq!(
            *log.lock().unwrap(),
            vec![MapAsyncStatus::DestroyedBeforeCallback]
        );

        let finished = client.command_encoder_finish(encoder, None).unwrap();
        client.release(finished);
        client.queue_submit(queue, &[finished]);
        assert_eq!(
            sent_opcodes(&mut client),
            vec![
                CmdOpcode::CommandEncoderFinish,
                CmdOpcode::DestroyObject,
                CmdOpcode::DeviceInjectError,
            ]
        );

        // Calls on a released receiver are dropped, creations return nothing.
        client.release(queue);
        client.release(device);
        sent_opcodes(&mut client);
        client.queue_write_buffer(queue, live, 0, &[1; 4]);
        client.device_push_error_scope(device, ErrorFilter::Validation);
        assert!(client.device_get_queue(device).is_none());
        assert!(client.device_create_command_encoder(device, None).is_none());
        assert!(client.serializer().is_empty());
    }

    #[test]
    fn second_map_fails_without_reaching_the_server() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let buffer = readable(&mut client, device, 16);
        sent_opcodes(&mut client);

        let (log, callback) = map_log();
        client.buffer_map_async(buffer, MapMode::READ, 0, 16, callback());
        client.buffer_map_async(buffer, MapMode::READ, 0, 16, callback());
        assert_eq!(*log.lock().unwrap(), vec![MapAsyncStatus::ValidationError]);
        assert_eq!(sent_opcodes(&mut client), vec![CmdOpcode::BufferMapAsync]);
    }

    #[test]
    fn map_reply_exposes_the_mapped_range() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let buffer = readable(&mut client, device, 16);
        let (log, callback) = map_log();
        client.buffer_map_async(buffer, MapMode::READ, 8, 8, callback());

        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert!(reply(
            &mut client,
            &[
                // Stale generation and unknown serial are ignored.
                ReturnCommand::BufferMapAsyncCallback {
                    buffer: ObjectHandle::new(buffer.handle().id, 9),
                    request_serial: 1,
                    status: MapAsyncStatus::Success,
                    data: &data,
                },
                ReturnCommand::BufferMapAsyncCallback {
                    buffer: buffer.handle(),
                    request_serial: 42,
                    status: MapAsyncStatus::Success,
                    data: &data,
                },
            ]
        ));
        assert!(log.lock().unwrap().is_empty());

        assert!(reply(
            &mut client,
            &[ReturnCommand::BufferMapAsyncCallback {
                buffer: buffer.handle(),
                request_serial: 1,
                status: MapAsyncStatus::Success,
                data: &data,
            }]
        ));
        assert_eq!(*log.lock().unwrap(), vec![MapAsyncStatus::Success]);
        assert_eq!(client.buffer_get_mapped_range(buffer, 12, 4), Some(&data[4..]));
        assert_eq!(client.buffer_get_mapped_range(buffer, 0, 4), None);
        assert_eq!(client.buffer_get_mapped_range_mut(buffer, 8, 8), None);
    }

    #[test]
    fn map_data_of_the_wrong_size_is_fatal() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let buffer = readable(&mut client, device, 16);
        let (_log, callback) = map_log();
        client.buffer_map_async(buffer, MapMode::READ, 0, 16, callback());
        assert!(!reply(
            &mut client,
            &[ReturnCommand::BufferMapAsyncCallback {
                buffer: buffer.handle(),
                request_serial: 1,
                status: MapAsyncStatus::Success,
                data: &[0; 4],
            }]
        ));
    }

    #[test]
    fn unmapping_a_pending_map_fails_it_locally() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let buffer = readable(&mut client, device, 16);
        let (log, callback) = map_log();
        client.buffer_map_async(buffer, MapMode::READ, 0, 16, callback());
        client.buffer_unmap(buffer);
        assert_eq!(
            *log.lock().unwrap(),
            vec![MapAsyncStatus::UnmappedBeforeCallback]
        );
        client.buffer_map_async(buffer, MapMode::READ, 0, 16, callback());
        client.release(buffer);
        assert_eq!(
            log.lock().unwrap().last(),
            Some(&MapAsyncStatus::DestroyedBeforeCallback)
        );
    }

    #[test]
    fn mapped_at_creation_data_is_sent_on_unmap() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let buffer = client
            .device_create_buffer(
                device,
                &BufferDescriptor {
                    label: None,
                    usage: BufferUsage::COPY_SRC,
                    size: 8,
                    mapped_at_creation: true,
                },
            )
            .unwrap();
        client
            .buffer_get_mapped_range_mut(buffer, 4, 4)
            .unwrap()
            .copy_from_slice(&[9, 9, 9, 9]);
        client.serializer_mut().take();
        client.buffer_unmap(buffer);

        let bytes = client.serializer_mut().take();
        let packet = CmdStreamIter::new(&bytes).next().unwrap().unwrap();
        assert_eq!(
            Command::decode(packet).unwrap(),
            Command::BufferUnmap {
                buffer_id: buffer.handle().id,
                write_offset: 0,
                data: &[0, 0, 0, 0, 9, 9, 9, 9],
            }
        );
        assert_eq!(client.buffer_get_mapped_range(buffer, 0, 8), None);
    }

    #[test]
    fn disconnect_fails_everything_once() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let queue = client.device_get_queue(device).unwrap();
        let buffer = readable(&mut client, device, 16);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.device_set_device_lost_callback(
            device,
            Some(Box::new(move |reason: DeviceLostReason, _: &str| {
                sink.lock().unwrap().push(format!("lost {reason:?}"))
            })),
        );
        let sink = Arc::clone(&events);
        client.device_pop_error_scope(
            device,
            Box::new(move |ty: ErrorType, _: &str| sink.lock().unwrap().push(format!("pop {ty:?}"))),
        );
        let sink = Arc::clone(&events);
        client.queue_on_submitted_work_done(
            queue,
            Box::new(move |status| sink.lock().unwrap().push(format!("done {status:?}"))),
        );
        let sink = Arc::clone(&events);
        client.buffer_map_async(
            buffer,
            MapMode::READ,
            0,
            16,
            Box::new(move |status| sink.lock().unwrap().push(format!("map {status:?}"))),
        );
        client.serializer_mut().take();

        client.disconnect();
        client.disconnect();
        assert!(client.is_disconnected());
        assert!(client.device_is_lost(device));
        let mut seen = events.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec!["done Unknown", "lost Unknown", "map Unknown", "pop Unknown"]
        );

        let sink = Arc::clone(&events);
        client.device_pop_error_scope(
            device,
            Box::new(move |ty: ErrorType, _: &str| sink.lock().unwrap().push(format!("pop {ty:?}"))),
        );
        assert_eq!(events.lock().unwrap().last().unwrap(), "pop DeviceLost");

        assert!(reply(
            &mut client,
            &[ReturnCommand::DeviceLostCallback {
                device: device.handle(),
                reason: DeviceLostReason::Destroyed,
                message: "late",
            }]
        ));
        assert_eq!(events.lock().unwrap().len(), 5);

        client.device_push_error_scope(device, ErrorFilter::Validation);
        assert!(client.serializer().is_empty());
    }

    #[test]
    fn uncaptured_errors_reach_the_callback() {
        let mut client = client();
        let device = client.reserve_device().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.device_set_uncaptured_error_callback(
            device,
            Some(Box::new(move |ty: ErrorType, message: &str| {
                sink.lock().unwrap().push((ty, message.to_owned()))
            })),
        );
        assert!(reply(
            &mut client,
            &[ReturnCommand::DeviceUncapturedErrorCallback {
                device: device.handle(),
                ty: ErrorType::Validation,
                message: "bad",
            }]
        ));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ErrorType::Validation, "bad".to_owned())]
        );
    }

    #[test]
    fn large_writes_are_chunked_at_the_client_limit() {
        let descriptor = WireClientDescriptor {
            max_allocation_size: 256,
            ..WireClientDescriptor::default()
        };
        let mut client = Client::new(BufferSerializer::new(64 * 1024), descriptor).unwrap();
        let device = client.reserve_device().unwrap();
        let queue = client.device_get_queue(device).unwrap();
        let buffer = readable(&mut client, device, 4096);
        client.serializer_mut().take();

        client.queue_write_buffer(queue, buffer, 0, &[7; 1000]);
        let opcodes = sent_opcodes(&mut client);
        assert!(opcodes.len() > 1);
        assert!(opcodes.iter().all(|op| *op == CmdOpcode::ChunkedCommand));
    }
}
