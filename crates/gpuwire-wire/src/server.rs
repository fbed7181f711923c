//! Replays client commands against a [`Procs`] implementation.

use std::sync::{Arc, Mutex, MutexGuard};

use gpuwire_protocol::{CmdPacket, Command, ReturnCommand};
use gpuwire_types::{
    DeviceLostReason, ErrorType, MapAsyncStatus, MapMode, ObjectHandle, ObjectId, ObjectType,
    Procs, QueueWorkDoneStatus, NULL_OBJECT_ID,
};
use tracing::{debug, trace, warn};

use crate::known_objects::{KnownObjects, ObjectIdTable, Resolution};
use crate::serializer::{process_stream, serialize_command, ChunkAssembler};
use crate::{CommandHandler, CommandSerializer, WireError, WireServerDescriptor};

/// Something the implementation reported through a callback, waiting to be
/// sent back to the client.
#[derive(Debug)]
enum ServerEvent<H> {
    UncapturedError {
        device: H,
        ty: ErrorType,
        message: String,
    },
    DeviceLost {
        device: H,
        reason: DeviceLostReason,
        message: String,
    },
    PopErrorScope {
        device: ObjectHandle,
        request_serial: u64,
        ty: ErrorType,
        message: String,
    },
    WorkDone {
        queue: H,
        request_serial: u64,
        status: QueueWorkDoneStatus,
    },
    MapDone {
        buffer: ObjectHandle,
        native: H,
        request_serial: u64,
        status: MapAsyncStatus,
        offset: u64,
        size: u64,
    },
}

/// Callbacks may fire from inside any proc call, so they only queue events.
#[derive(Debug)]
struct EventQueue<H> {
    events: Arc<Mutex<Vec<ServerEvent<H>>>>,
}

impl<H> Clone for EventQueue<H> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<H> EventQueue<H> {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ServerEvent<H>>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, event: ServerEvent<H>) {
        self.lock().push(event);
    }

    fn drain(&self) -> Vec<ServerEvent<H>> {
        std::mem::take(&mut *self.lock())
    }
}

/// The server end of a wire connection.
///
/// Every object the client creates is mirrored in a per-type
/// [`KnownObjects`] table under the id the client picked. Devices enter the
/// tables only through [`Server::inject_device`] and leave through
/// [`Server::destroy_device`].
pub struct Server<P, S>
where
    P: Procs,
    P::Handle: Send + 'static,
    S: CommandSerializer,
{
    procs: P,
    serializer: S,
    descriptor: WireServerDescriptor,
    assembler: ChunkAssembler,
    known: [KnownObjects<P::Handle>; ObjectType::COUNT],
    device_ids: ObjectIdTable<P::Handle>,
    queue_ids: ObjectIdTable<P::Handle>,
    events: EventQueue<P::Handle>,
}

impl<P, S> Server<P, S>
where
    P: Procs,
    P::Handle: Send + 'static,
    S: CommandSerializer,
{
    pub fn new(procs: P, serializer: S, descriptor: WireServerDescriptor) -> Result<Self, WireError> {
        descriptor.validate()?;
        Ok(Self {
            procs,
            serializer,
            descriptor,
            assembler: ChunkAssembler::new(descriptor.max_chunked_command_size),
            known: ObjectType::ALL.map(|ty| KnownObjects::new(ty, descriptor.max_object_id)),
            device_ids: ObjectIdTable::new(),
            queue_ids: ObjectIdTable::new(),
            events: EventQueue::new(),
        })
    }

    pub fn procs(&self) -> &P {
        &self.procs
    }

    pub fn procs_mut(&mut self) -> &mut P {
        &mut self.procs
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    pub fn serializer_mut(&mut self) -> &mut S {
        &mut self.serializer
    }

    pub fn known(&self, ty: ObjectType) -> &KnownObjects<P::Handle> {
        &self.known[ty.index()]
    }

    fn known_mut(&mut self, ty: ObjectType) -> &mut KnownObjects<P::Handle> {
        &mut self.known[ty.index()]
    }

    /// Native handle registered for `id`, if it names a valid object.
    pub fn native_handle(&self, ty: ObjectType, id: ObjectId) -> Option<P::Handle> {
        match self.known(ty).resolve(id) {
            Resolution::Success(handle) => handle,
            _ => None,
        }
    }

    /// Wire id the client uses for a native device or queue.
    pub fn wire_id_of(&self, ty: ObjectType, native: P::Handle) -> Option<ObjectId> {
        match ty {
            ObjectType::Device => self.device_ids.get(native),
            ObjectType::Queue => self.queue_ids.get(native),
            _ => None,
        }
    }

    /// Registers a device created outside the wire under a handle the client
    /// reserved. The server takes its own reference to `native`.
    pub fn inject_device(&mut self, native: P::Handle, handle: ObjectHandle) -> bool {
        let entry = match self.known_mut(ObjectType::Device).allocate(handle, NULL_OBJECT_ID) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%handle, %err, "device injection refused");
                return false;
            }
        };
        entry.handle = Some(native);
        entry.valid = true;
        self.procs.reference(native);
        self.device_ids.store(native, handle.id);

        let events = self.events.clone();
        self.procs.device_set_uncaptured_error_callback(
            native,
            Some(Box::new(move |ty: ErrorType, message: &str| {
                events.push(ServerEvent::UncapturedError {
                    device: native,
                    ty,
                    message: message.to_owned(),
                })
            })),
        );
        let events = self.events.clone();
        self.procs.device_set_device_lost_callback(
            native,
            Some(Box::new(move |reason: DeviceLostReason, message: &str| {
                events.push(ServerEvent::DeviceLost {
                    device: native,
                    reason,
                    message: message.to_owned(),
                })
            })),
        );
        debug!(%handle, ?native, "device injected");
        true
    }

    /// Releases a device and every object created from it.
    pub fn destroy_device(&mut self, id: ObjectId) -> bool {
        if self.known(ObjectType::Device).get(id).is_none() {
            return false;
        }
        for ty in ObjectType::ALL.into_iter().rev() {
            if ty == ObjectType::Device {
                continue;
            }
            for child in self.known(ty).ids_created_by(id) {
                self.free_object(ty, child);
            }
        }

        let Some(entry) = self.known_mut(ObjectType::Device).free(id) else {
            return false;
        };
        if let Some(native) = entry.handle {
            self.procs.device_set_uncaptured_error_callback(native, None);
            self.procs.device_set_device_lost_callback(native, None);
            self.device_ids.remove(native);
            self.procs.release(native);
        }
        debug!(id, "device destroyed");
        true
    }

    /// Frees one non-device object. Returns `false` for id `0`, for devices and
    /// for ids that name nothing.
    pub fn do_destroy_object(&mut self, ty: ObjectType, id: ObjectId) -> bool {
        if id == NULL_OBJECT_ID || ty == ObjectType::Device {
            return false;
        }
        self.free_object(ty, id)
    }

    fn free_object(&mut self, ty: ObjectType, id: ObjectId) -> bool {
        let Some(entry) = self.known_mut(ty).free(id) else {
            return false;
        };
        trace!(%ty, id, "object destroyed");
        if let Some(native) = entry.handle {
            if ty == ObjectType::Queue {
                self.queue_ids.remove(native);
            }
            self.procs.release(native);
        }
        true
    }

    /// Advances every device and sends the callbacks that became due.
    pub fn tick(&mut self) -> Result<(), WireError> {
        let devices: Vec<P::Handle> = self
            .known(ObjectType::Device)
            .iter()
            .filter(|(_, entry)| entry.valid)
            .filter_map(|(_, entry)| entry.handle)
            .collect();
        for device in devices {
            self.procs.device_tick(device);
        }
        self.send_events()?;
        self.serializer.flush();
        Ok(())
    }

    fn send(&mut self, cmd: &ReturnCommand<'_>) -> Result<(), WireError> {
        serialize_command(&mut self.serializer, cmd)
    }

    fn send_events(&mut self) -> Result<(), WireError> {
        for event in self.events.drain() {
            self.send_event(event)?;
        }
        Ok(())
    }

    fn send_event(&mut self, event: ServerEvent<P::Handle>) -> Result<(), WireError> {
        match event {
            ServerEvent::UncapturedError {
                device,
                ty,
                message,
            } => {
                let Some(device) = self.device_handle(device) else {
                    return Ok(());
                };
                self.send(&ReturnCommand::DeviceUncapturedErrorCallback {
                    device,
                    ty,
                    message: &message,
                })
            }
            ServerEvent::DeviceLost {
                device,
                reason,
                message,
            } => {
                let Some(device) = self.device_handle(device) else {
                    return Ok(());
                };
                self.send(&ReturnCommand::DeviceLostCallback {
                    device,
                    reason,
                    message: &message,
                })
            }
            ServerEvent::PopErrorScope {
                device,
                request_serial,
                ty,
                message,
            } => self.send(&ReturnCommand::DevicePopErrorScopeCallback {
                device,
                request_serial,
                ty,
                message: &message,
            }),
            ServerEvent::WorkDone {
                queue,
                request_serial,
                status,
            } => {
                let Some(queue) = self
                    .queue_ids
                    .get(queue)
                    .and_then(|id| self.known(ObjectType::Queue).handle_of(id))
                else {
                    return Ok(());
                };
                self.send(&ReturnCommand::QueueWorkDoneCallback {
                    queue,
                    request_serial,
                    status,
                })
            }
            ServerEvent::MapDone {
                buffer,
                native,
                request_serial,
                mut status,
                offset,
                size,
            } => {
                let known = self.known(ObjectType::Buffer);
                let live = known.handle_of(buffer.id) == Some(buffer)
                    && known.get(buffer.id).and_then(|e| e.handle) == Some(native);
                if !live {
                    return Ok(());
                }
                let mut data = Vec::new();
                if status == MapAsyncStatus::Success {
                    match self.procs.buffer_read_mapped_range(native, offset, size) {
                        Some(mapped) => data = mapped,
                        None => status = MapAsyncStatus::Unknown,
                    }
                }
                self.send(&ReturnCommand::BufferMapAsyncCallback {
                    buffer,
                    request_serial,
                    status,
                    data: &data,
                })
            }
        }
    }

    fn device_handle(&self, native: P::Handle) -> Option<ObjectHandle> {
        let id = self.device_ids.get(native)?;
        self.known(ObjectType::Device).handle_of(id)
    }

    /// Resolves an argument that must name an object. `Ok(None)` means it names
    /// an error object.
    fn resolve(&self, ty: ObjectType, id: ObjectId) -> Result<Option<P::Handle>, WireError> {
        match self.known(ty).resolve(id) {
            Resolution::Success(handle) => Ok(handle),
            Resolution::ErrorObject => Ok(None),
            Resolution::FatalError => Err(WireError::UnknownObject {
                object_type: ty,
                id,
            }),
        }
    }

    /// Device an object was created from.
    fn parent_device(&self, ty: ObjectType, id: ObjectId) -> ObjectId {
        self.known(ty).get(id).map_or(NULL_OBJECT_ID, |e| e.device)
    }

    /// Reports use of an error object to the device that owns it.
    fn report_error_object(&mut self, device: ObjectId, what: &str) {
        if let Some(native) = self.native_handle(ObjectType::Device, device) {
            let message = format!("{what} is an invalid object");
            self.procs
                .device_inject_error(native, ErrorType::Validation, &message);
        }
    }

    fn register(
        &mut self,
        ty: ObjectType,
        result: ObjectHandle,
        device: ObjectId,
        native: Option<P::Handle>,
    ) -> Result<(), WireError> {
        let entry = self.known_mut(ty).allocate(result, device)?;
        entry.handle = native;
        entry.valid = native.is_some();
        if let (ObjectType::Queue, Some(native)) = (ty, native) {
            self.queue_ids.store(native, result.id);
        }
        trace!(%ty, %result, valid = native.is_some(), "object created");
        Ok(())
    }

    fn check_allocation(&self, ty: ObjectType, result: ObjectHandle) -> Result<(), WireError> {
        self.known(ty).check_allocation(result)
    }

    fn handle_packet(&mut self, packet: CmdPacket<'_>) -> Result<(), WireError> {
        let cmd = Command::decode(packet)?;
        self.handle_command(cmd)?;
        self.send_events()
    }

    fn handle_command(&mut self, cmd: Command<'_>) -> Result<(), WireError> {
        match cmd {
            Command::Chunked(_) => Err(WireError::NestedChunk),
            Command::DestroyObject {
                object_type,
                object_id,
            } => {
                if self.do_destroy_object(object_type, object_id) {
                    Ok(())
                } else {
                    Err(WireError::InvalidDestroy {
                        object_type,
                        id: object_id,
                    })
                }
            }
            Command::DeviceCreateBuffer {
                device_id,
                result,
                desc,
            } => {
                let device = self.resolve(ObjectType::Device, device_id)?;
                self.check_allocation(ObjectType::Buffer, result)?;
                let native = device.and_then(|d| self.procs.device_create_buffer(d, &desc));
                self.register(ObjectType::Buffer, result, device_id, native)
            }
            Command::DeviceCreateTexture {
                device_id,
                result,
                desc,
            } => {
                let device = self.resolve(ObjectType::Device, device_id)?;
                self.check_allocation(ObjectType::Texture, result)?;
                let native = device.and_then(|d| self.procs.device_create_texture(d, &desc));
                self.register(ObjectType::Texture, result, device_id, native)
            }
            Command::TextureCreateView {
                texture_id,
                result,
                desc,
            } => {
                let texture = self.resolve(ObjectType::Texture, texture_id)?;
                let device_id = self.parent_device(ObjectType::Texture, texture_id);
                self.check_allocation(ObjectType::TextureView, result)?;
                let native = match texture {
                    Some(texture) => self.procs.texture_create_view(texture, &desc),
                    None => {
                        self.report_error_object(device_id, "Texture");
                        None
                    }
                };
                self.register(ObjectType::TextureView, result, device_id, native)
            }
            Command::DeviceCreateShaderModule {
                device_id,
                result,
                label,
                code,
            } => {
                let device = self.resolve(ObjectType::Device, device_id)?;
                self.check_allocation(ObjectType::ShaderModule, result)?;
                let native =
                    device.and_then(|d| self.procs.device_create_shader_module(d, label, code));
                self.register(ObjectType::ShaderModule, result, device_id, native)
            }
            Command::DeviceCreateCommandEncoder {
                device_id,
                result,
                label,
            } => {
                let device = self.resolve(ObjectType::Device, device_id)?;
                self.check_allocation(ObjectType::CommandEncoder, result)?;
                let native =
                    device.and_then(|d| self.procs.device_create_command_encoder(d, label));
                self.register(ObjectType::CommandEncoder, result, device_id, native)
            }
            Command::CommandEncoderCopyBufferToBuffer {
                encoder_id,
                source_id,
                source_offset,
                destination_id,
                destination_offset,
                size,
            } => {
                let encoder = self.resolve(ObjectType::CommandEncoder, encoder_id)?;
                let source = self.resolve(ObjectType::Buffer, source_id)?;
                let destination = self.resolve(ObjectType::Buffer, destination_id)?;
                match (encoder, source, destination) {
                    (Some(encoder), Some(source), Some(destination)) => {
                        self.procs.command_encoder_copy_buffer_to_buffer(
                            encoder,
                            source,
                            source_offset,
                            destination,
                            destination_offset,
                            size,
                        );
                    }
                    _ => {
                        let device = self.parent_device(ObjectType::CommandEncoder, encoder_id);
                        self.report_error_object(device, "Copy argument");
                    }
                }
                Ok(())
            }
            Command::CommandEncoderFinish {
                encoder_id,
                result,
                label,
            } => {
                let encoder = self.resolve(ObjectType::CommandEncoder, encoder_id)?;
                let device_id = self.parent_device(ObjectType::CommandEncoder, encoder_id);
                self.check_allocation(ObjectType::CommandBuffer, result)?;
                let native = match encoder {
                    Some(encoder) => self.procs.command_encoder_finish(encoder, label),
                    None => {
                        self.report_error_object(device_id, "CommandEncoder");
                        None
                    }
                };
                self.register(ObjectType::CommandBuffer, result, device_id, native)
            }
            Command::DeviceGetQueue { device_id, result } => {
                let device = self.resolve(ObjectType::Device, device_id)?;
                self.check_allocation(ObjectType::Queue, result)?;
                let native = device.and_then(|d| self.procs.device_get_queue(d));
                self.register(ObjectType::Queue, result, device_id, native)
            }
            Command::QueueSubmit {
                queue_id,
                command_buffers,
            } => {
                let queue = self.resolve(ObjectType::Queue, queue_id)?;
                let mut natives = Vec::with_capacity(command_buffers.len());
                let mut all_valid = true;
                for id in command_buffers.iter() {
                    match self.resolve(ObjectType::CommandBuffer, id)? {
                        Some(native) => natives.push(native),
                        None => all_valid = false,
                    }
                }
                match queue {
                    Some(queue) if all_valid => self.procs.queue_submit(queue, &natives),
                    _ => {
                        let device = self.parent_device(ObjectType::Queue, queue_id);
                        self.report_error_object(device, "Submitted object");
                    }
                }
                Ok(())
            }
            Command::QueueWriteBuffer {
                queue_id,
                buffer_id,
                offset,
                data,
            } => {
                let queue = self.resolve(ObjectType::Queue, queue_id)?;
                let buffer = self.resolve(ObjectType::Buffer, buffer_id)?;
                match (queue, buffer) {
                    (Some(queue), Some(buffer)) => {
                        self.procs.queue_write_buffer(queue, buffer, offset, data)
                    }
                    _ => {
                        let device = self.parent_device(ObjectType::Queue, queue_id);
                        self.report_error_object(device, "Written object");
                    }
                }
                Ok(())
            }
            Command::QueueOnSubmittedWorkDone {
                queue_id,
                request_serial,
            } => {
                let queue = self.resolve(ObjectType::Queue, queue_id)?;
                match queue {
                    Some(queue) => {
                        let events = self.events.clone();
                        self.procs.queue_on_submitted_work_done(
                            queue,
                            Box::new(move |status| {
                                events.push(ServerEvent::WorkDone {
                                    queue,
                                    request_serial,
                                    status,
                                })
                            }),
                        );
                        Ok(())
                    }
                    None => match self.known(ObjectType::Queue).handle_of(queue_id) {
                        Some(queue) => self.send(&ReturnCommand::QueueWorkDoneCallback {
                            queue,
                            request_serial,
                            status: QueueWorkDoneStatus::Error,
                        }),
                        None => Ok(()),
                    },
                }
            }
            Command::DevicePushErrorScope { device_id, filter } => {
                if let Some(device) = self.resolve(ObjectType::Device, device_id)? {
                    self.procs.device_push_error_scope(device, filter);
                }
                Ok(())
            }
            Command::DevicePopErrorScope {
                device_id,
                request_serial,
            } => {
                let device = self.resolve(ObjectType::Device, device_id)?;
                let Some(handle) = self.known(ObjectType::Device).handle_of(device_id) else {
                    return Ok(());
                };
                match device {
                    Some(device) => {
                        let events = self.events.clone();
                        self.procs.device_pop_error_scope(
                            device,
                            Box::new(move |ty: ErrorType, message: &str| {
                                events.push(ServerEvent::PopErrorScope {
                                    device: handle,
                                    request_serial,
                                    ty,
                                    message: message.to_owned(),
                                })
                            }),
                        );
                        Ok(())
                    }
                    None => self.send(&ReturnCommand::DevicePopErrorScopeCallback {
                        device: handle,
                        request_serial,
                        ty: ErrorType::Unknown,
                        message: "Device is an invalid object",
                    }),
                }
            }
            Command::DeviceInjectError {
                device_id,
                ty,
                message,
            } => {
                if let Some(device) = self.resolve(ObjectType::Device, device_id)? {
                    self.procs.device_inject_error(device, ty, message);
                }
                Ok(())
            }
            Command::BufferMapAsync {
                buffer_id,
                mode,
                request_serial,
                offset,
                size,
            } => self.map_async(buffer_id, mode, request_serial, offset, size),
            Command::BufferUnmap {
                buffer_id,
                write_offset,
                data,
            } => {
                match self.resolve(ObjectType::Buffer, buffer_id)? {
                    Some(buffer) => {
                        if !data.is_empty()
                            && !self
                                .procs
                                .buffer_write_mapped_range(buffer, write_offset, data)
                        {
                            debug!(buffer_id, write_offset, "unmap data outside the mapped range");
                        }
                        self.procs.buffer_unmap(buffer);
                    }
                    None => {
                        let device = self.parent_device(ObjectType::Buffer, buffer_id);
                        self.report_error_object(device, "Buffer");
                    }
                }
                Ok(())
            }
            Command::BufferDestroy { buffer_id } => {
                if let Some(buffer) = self.resolve(ObjectType::Buffer, buffer_id)? {
                    self.procs.buffer_destroy(buffer);
                }
                Ok(())
            }
        }
    }

    fn map_async(
        &mut self,
        buffer_id: ObjectId,
        mode: MapMode,
        request_serial: u64,
        offset: u64,
        size: u64,
    ) -> Result<(), WireError> {
        let native = self.resolve(ObjectType::Buffer, buffer_id)?;
        let Some(buffer) = self.known(ObjectType::Buffer).handle_of(buffer_id) else {
            return Ok(());
        };
        let Some(native) = native else {
            let device = self.parent_device(ObjectType::Buffer, buffer_id);
            self.report_error_object(device, "Buffer");
            return self.send(&ReturnCommand::BufferMapAsyncCallback {
                buffer,
                request_serial,
                status: MapAsyncStatus::ValidationError,
                data: &[],
            });
        };
        let events = self.events.clone();
        self.procs.buffer_map_async(
            native,
            mode,
            offset,
            size,
            Box::new(move |status| {
                events.push(ServerEvent::MapDone {
                    buffer,
                    native,
                    request_serial,
                    status,
                    offset,
                    size,
                })
            }),
        );
        Ok(())
    }
}

impl<P, S> CommandHandler for Server<P, S>
where
    P: Procs,
    P::Handle: Send + 'static,
    S: CommandSerializer,
{
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
                warn!(%err, "fatal error in client command stream");
                None
            }
        }
    }
}

impl<P, S> Drop for Server<P, S>
where
    P: Procs,
    P::Handle: Send + 'static,
    S: CommandSerializer,
{
    fn drop(&mut self) {
        for ty in ObjectType::ALL.into_iter().rev() {
            for entry in self.known_mut(ty).drain() {
                let Some(native) = entry.handle else {
                    continue;
                };
                if ty == ObjectType::Device {
                    self.procs.device_set_uncaptured_error_callback(native, None);
                    self.procs.device_set_device_lost_callback(native, None);
                }
                self.procs.release(native);
            }
        }
    }
}
