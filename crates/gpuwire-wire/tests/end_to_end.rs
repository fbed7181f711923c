use std::sync::{Arc, Mutex};

use gpuwire_native::{DeviceDescriptor, NativeHandle, NativeProcs};
use gpuwire_protocol::{CmdStreamWriter, Command};
use gpuwire_types::{
    BufferDescriptor, BufferUsage, DeviceLostReason, ErrorFilter, ErrorType, MapAsyncStatus,
    MapMode, ObjectHandle, ObjectType, QueueWorkDoneStatus, TextureDescriptor,
    TextureViewDescriptor,
};
use gpuwire_wire::{
    Buffer, BufferSerializer, Client, CommandHandler, CommandRing, Device, RingSerializer,
    Server, WireClientDescriptor, WireObject, WireServerDescriptor,
};

type TestServer = Server<NativeProcs, BufferSerializer>;

struct Harness {
    client: Client<BufferSerializer>,
    server: TestServer,
    device: Device,
    native_device: NativeHandle,
}

impl Harness {
    fn new() -> Self {
        Self::with_limits(WireClientDescriptor::default(), WireServerDescriptor::default())
    }

    fn with_limits(client: WireClientDescriptor, server: WireServerDescriptor) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let mut procs = NativeProcs::new();
        let native_device = procs.create_device(&DeviceDescriptor::default()).unwrap();
        let mut server = Server::new(
            procs,
            BufferSerializer::new(server.max_allocation_size),
            server,
        )
        .unwrap();
        let mut client =
            Client::new(BufferSerializer::new(client.max_allocation_size), client).unwrap();
        let device = client.reserve_device().unwrap();
        assert!(server.inject_device(native_device, device.handle()));
        Self {
            client,
            server,
            device,
            native_device,
        }
    }

    /// Delivers pending client commands and the replies they produce.
    fn pump(&mut self) {
        let commands = self.client.serializer_mut().take();
        assert!(self.server.handle_commands(&commands).is_some());
        self.deliver_replies();
    }

    fn tick(&mut self) {
        self.pump();
        self.server.tick().unwrap();
        self.deliver_replies();
    }

    fn deliver_replies(&mut self) {
        let replies = self.server.serializer_mut().take();
        assert!(self.client.handle_commands(&replies).is_some());
    }

    fn buffer(&mut self, usage: BufferUsage, size: u64) -> Buffer {
        self.client
            .device_create_buffer(
                self.device,
                &BufferDescriptor {
                    label: None,
                    usage,
                    size,
                    mapped_at_creation: false,
                },
            )
            .unwrap()
    }
}

fn status_log<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Arc::clone(&log), log)
}

#[test]
fn upload_copy_and_map_read_back() {
    let mut h = Harness::new();
    let queue = h.client.device_get_queue(h.device).unwrap();
    let src = h.buffer(BufferUsage::COPY_SRC | BufferUsage::COPY_DST, 16);
    let dst = h.buffer(BufferUsage::MAP_READ | BufferUsage::COPY_DST, 16);
    let payload: Vec<u8> = (0..16).collect();

    h.client.queue_write_buffer(queue, src, 0, &payload);
    let encoder = h.client.device_create_command_encoder(h.device, None).unwrap();
    h.client
        .command_encoder_copy_buffer_to_buffer(encoder, src, 0, dst, 0, 16);
    let commands = h.client.command_encoder_finish(encoder, None).unwrap();
    h.client.queue_submit(queue, &[commands]);

    let (sink, log) = status_log();
    h.client.buffer_map_async(
        dst,
        MapMode::READ,
        0,
        16,
        Box::new(move |status| sink.lock().unwrap().push(status)),
    );
    h.pump();
    // The copy is still in flight until the server ticks.
    assert!(log.lock().unwrap().is_empty());

    h.tick();
    assert_eq!(*log.lock().unwrap(), vec![MapAsyncStatus::Success]);
    assert_eq!(h.client.buffer_get_mapped_range(dst, 0, 16), Some(&payload[..]));

    h.client.buffer_unmap(dst);
    h.pump();
    assert_eq!(h.client.buffer_get_mapped_range(dst, 0, 16), None);
}

#[test]
fn write_mapping_round_trips_through_the_server() {
    let mut h = Harness::new();
    let upload = h.buffer(BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC, 8);
    let readback = h.buffer(BufferUsage::MAP_READ | BufferUsage::COPY_DST, 8);

    let (sink, log) = status_log();
    let callback = move || -> gpuwire_types::BufferMapCallback {
        let sink = Arc::clone(&sink);
        Box::new(move |status| sink.lock().unwrap().push(status))
    };
    h.client
        .buffer_map_async(upload, MapMode::WRITE, 0, 8, callback());
    h.tick();
    h.client
        .buffer_get_mapped_range_mut(upload, 0, 8)
        .unwrap()
        .copy_from_slice(&[1, 1, 2, 3, 5, 8, 13, 21]);
    h.client.buffer_unmap(upload);

    let queue = h.client.device_get_queue(h.device).unwrap();
    let encoder = h.client.device_create_command_encoder(h.device, None).unwrap();
    h.client
        .command_encoder_copy_buffer_to_buffer(encoder, upload, 0, readback, 0, 8);
    let commands = h.client.command_encoder_finish(encoder, None).unwrap();
    h.client.queue_submit(queue, &[commands]);
    h.client
        .buffer_map_async(readback, MapMode::READ, 0, 8, callback());
    h.tick();

    assert_eq!(
        *log.lock().unwrap(),
        vec![MapAsyncStatus::Success, MapAsyncStatus::Success]
    );
    assert_eq!(
        h.client.buffer_get_mapped_range(readback, 0, 8),
        Some(&[1, 1, 2, 3, 5, 8, 13, 21][..])
    );
}

#[test]
fn error_scopes_capture_validation_errors_across_the_wire() {
    let mut h = Harness::new();
    h.client.device_push_error_scope(h.device, ErrorFilter::Validation);
    // MAP_READ may only be combined with COPY_DST.
    h.buffer(BufferUsage::MAP_READ | BufferUsage::STORAGE, 16);

    let (sink, log) = status_log();
    h.client.device_pop_error_scope(
        h.device,
        Box::new(move |ty: ErrorType, message: &str| {
            sink.lock().unwrap().push((ty, message.to_owned()))
        }),
    );
    h.pump();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, ErrorType::Validation);
    assert!(log[0].1.contains("MAP_READ"), "{}", log[0].1);
}

#[test]
fn uncaptured_errors_and_device_loss_are_forwarded() {
    let mut h = Harness::new();
    let (sink, errors) = status_log();
    h.client.device_set_uncaptured_error_callback(
        h.device,
        Some(Box::new(move |ty: ErrorType, message: &str| {
            sink.lock().unwrap().push((ty, message.to_owned()))
        })),
    );
    let (sink, lost) = status_log();
    h.client.device_set_device_lost_callback(
        h.device,
        Some(Box::new(move |reason: DeviceLostReason, message: &str| {
            sink.lock().unwrap().push((reason, message.to_owned()))
        })),
    );

    h.client
        .device_inject_error(h.device, ErrorType::OutOfMemory, "too big");
    h.pump();
    assert_eq!(
        *errors.lock().unwrap(),
        vec![(ErrorType::OutOfMemory, "too big".to_owned())]
    );

    // Only Validation and OutOfMemory may be injected.
    h.client
        .device_inject_error(h.device, ErrorType::Internal, "driver hung");
    h.pump();
    {
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].0, ErrorType::Validation);
    }
    assert!(lost.lock().unwrap().is_empty());

    h.server
        .procs()
        .device(h.native_device)
        .unwrap()
        .lose(DeviceLostReason::Unknown, "driver hung");
    h.tick();
    assert_eq!(
        *lost.lock().unwrap(),
        vec![(DeviceLostReason::Unknown, "driver hung".to_owned())]
    );
    assert!(h.client.device_is_lost(h.device));
}

#[test]
fn work_done_waits_for_submitted_work() {
    let mut h = Harness::new();
    let queue = h.client.device_get_queue(h.device).unwrap();
    let buffer = h.buffer(BufferUsage::COPY_DST, 4);
    h.client.queue_write_buffer(queue, buffer, 0, &[1, 2, 3, 4]);

    let (sink, log) = status_log();
    h.client.queue_on_submitted_work_done(
        queue,
        Box::new(move |status| sink.lock().unwrap().push(status)),
    );
    h.pump();
    assert!(log.lock().unwrap().is_empty());
    h.tick();
    assert_eq!(*log.lock().unwrap(), vec![QueueWorkDoneStatus::Success]);
}

#[test]
fn released_objects_are_destroyed_on_the_server() {
    let mut h = Harness::new();
    let texture = h
        .client
        .device_create_texture(
            h.device,
            &TextureDescriptor {
                width: 4,
                height: 4,
                usage: gpuwire_types::TextureUsage::TEXTURE_BINDING,
                ..TextureDescriptor::default()
            },
        )
        .unwrap();
    let view = h
        .client
        .texture_create_view(texture, &TextureViewDescriptor::default())
        .unwrap();
    h.pump();
    assert_eq!(h.server.known(ObjectType::Texture).len(), 1);
    assert_eq!(h.server.known(ObjectType::TextureView).len(), 1);
    let live = h.server.procs().live_objects();

    h.client.release(view);
    h.client.release(texture);
    h.pump();
    assert!(h.server.known(ObjectType::Texture).is_empty());
    assert!(h.server.known(ObjectType::TextureView).is_empty());
    assert_eq!(h.server.procs().live_objects(), live - 2);
}

#[test]
fn destroy_object_refuses_devices_and_null_ids() {
    let mut h = Harness::new();
    assert!(!h.server.do_destroy_object(ObjectType::Device, h.device.handle().id));
    assert!(!h.server.do_destroy_object(ObjectType::Buffer, 0));
    assert!(!h.server.do_destroy_object(ObjectType::Buffer, 7));

    let mut writer = CmdStreamWriter::new();
    writer
        .push(&Command::DestroyObject {
            object_type: ObjectType::Device,
            object_id: h.device.handle().id,
        })
        .unwrap();
    assert!(h.server.handle_commands(writer.as_bytes()).is_none());
    assert!(h.server.known(ObjectType::Device).get(1).is_some());
}

#[test]
fn unknown_ids_and_reused_slots_are_fatal() {
    let mut h = Harness::new();

    let mut writer = CmdStreamWriter::new();
    writer
        .push(&Command::BufferDestroy { buffer_id: 3 })
        .unwrap();
    assert!(h.server.handle_commands(writer.as_bytes()).is_none());

    let create = Command::DeviceCreateCommandEncoder {
        device_id: h.device.handle().id,
        result: ObjectHandle::new(1, 0),
        label: None,
    };
    let mut writer = CmdStreamWriter::new();
    writer.push(&create).unwrap();
    assert!(h.server.handle_commands(writer.as_bytes()).is_some());
    assert!(h.server.handle_commands(writer.as_bytes()).is_none());

    let mut writer = CmdStreamWriter::new();
    writer
        .push(&Command::DeviceCreateCommandEncoder {
            device_id: h.device.handle().id,
            result: ObjectHandle::new(0, 0),
            label: None,
        })
        .unwrap();
    assert!(h.server.handle_commands(writer.as_bytes()).is_none());

    let truncated = &writer.as_bytes()[..12];
    assert!(h.server.handle_commands(truncated).is_none());
}

#[test]
fn destroying_a_device_releases_its_objects() {
    let mut h = Harness::new();
    let queue = h.client.device_get_queue(h.device).unwrap();
    h.buffer(BufferUsage::COPY_DST, 64);
    h.client.device_create_command_encoder(h.device, None).unwrap();
    h.pump();
    assert_eq!(h.server.procs().refcount(h.native_device), 2);
    let native_queue = h
        .server
        .native_handle(ObjectType::Queue, queue.handle().id)
        .unwrap();
    assert_eq!(
        h.server.wire_id_of(ObjectType::Queue, native_queue),
        Some(queue.handle().id)
    );

    assert!(h.server.destroy_device(h.device.handle().id));
    assert!(!h.server.destroy_device(h.device.handle().id));
    for ty in ObjectType::ALL {
        assert!(h.server.known(ty).is_empty(), "{ty} table not empty");
    }
    assert_eq!(h.server.wire_id_of(ObjectType::Device, h.native_device), None);
    assert_eq!(h.server.wire_id_of(ObjectType::Queue, native_queue), None);
    // Only the creator's reference to the device is left.
    assert_eq!(h.server.procs().live_objects(), 1);
    assert_eq!(h.server.procs().refcount(h.native_device), 1);
}

#[test]
fn injecting_over_a_live_device_is_refused() {
    let mut h = Harness::new();
    let other = h
        .server
        .procs_mut()
        .create_device(&DeviceDescriptor::default())
        .unwrap();
    assert!(!h.server.inject_device(other, h.device.handle()));
    assert!(!h.server.inject_device(other, ObjectHandle::NULL));
    assert_eq!(h.server.procs().refcount(other), 1);
}

#[test]
fn oversized_commands_and_replies_are_chunked() {
    let mut h = Harness::with_limits(
        WireClientDescriptor {
            max_allocation_size: 256,
            ..WireClientDescriptor::default()
        },
        WireServerDescriptor {
            max_allocation_size: 256,
            ..WireServerDescriptor::default()
        },
    );
    let upload = h
        .client
        .device_create_buffer(
            h.device,
            &BufferDescriptor {
                label: Some("upload"),
                usage: BufferUsage::COPY_SRC,
                size: 2048,
                mapped_at_creation: true,
            },
        )
        .unwrap();
    let pattern: Vec<u8> = (0..2048u32).map(|i| (i * 7) as u8).collect();
    h.client
        .buffer_get_mapped_range_mut(upload, 0, 2048)
        .unwrap()
        .copy_from_slice(&pattern);
    h.client.buffer_unmap(upload);

    let readback = h.buffer(BufferUsage::MAP_READ | BufferUsage::COPY_DST, 2048);
    let queue = h.client.device_get_queue(h.device).unwrap();
    let encoder = h.client.device_create_command_encoder(h.device, None).unwrap();
    h.client
        .command_encoder_copy_buffer_to_buffer(encoder, upload, 0, readback, 0, 2048);
    let commands = h.client.command_encoder_finish(encoder, None).unwrap();
    h.client.queue_submit(queue, &[commands]);

    let (sink, log) = status_log();
    h.client.buffer_map_async(
        readback,
        MapMode::READ,
        0,
        2048,
        Box::new(move |status| sink.lock().unwrap().push(status)),
    );
    h.tick();

    assert_eq!(*log.lock().unwrap(), vec![MapAsyncStatus::Success]);
    assert_eq!(
        h.client.buffer_get_mapped_range(readback, 0, 2048),
        Some(&pattern[..])
    );
}

#[test]
fn commands_travel_through_the_shared_ring() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let ring = Arc::new(CommandRing::new(4096).unwrap());
    let descriptor = WireClientDescriptor {
        max_allocation_size: 1024,
        ..WireClientDescriptor::default()
    };
    let mut client =
        Client::new(RingSerializer::new(Arc::clone(&ring), 1024), descriptor).unwrap();

    let mut procs = NativeProcs::new();
    let native = procs.create_device(&DeviceDescriptor::default()).unwrap();
    let mut server = Server::new(
        procs,
        BufferSerializer::new(64 * 1024),
        WireServerDescriptor::default(),
    )
    .unwrap();
    let device = client.reserve_device().unwrap();
    assert!(server.inject_device(native, device.handle()));

    let (sink, log) = status_log();
    client.device_push_error_scope(device, ErrorFilter::OutOfMemory);
    client.device_inject_error(device, ErrorType::OutOfMemory, "ring oom");
    client.device_pop_error_scope(
        device,
        Box::new(move |ty: ErrorType, message: &str| {
            sink.lock().unwrap().push((ty, message.to_owned()))
        }),
    );
    assert!(client.flush());
    assert_eq!(ring.drain_into(&mut server), Some(1));

    let replies = server.serializer_mut().take();
    assert!(client.handle_commands(&replies).is_some());
    assert_eq!(
        *log.lock().unwrap(),
        vec![(ErrorType::OutOfMemory, "ring oom".to_owned())]
    );
}

#[test]
fn stale_handles_cannot_reach_a_reused_slot() {
    let mut h = Harness::new();
    let queue = h.client.device_get_queue(h.device).unwrap();
    let stale = h.buffer(BufferUsage::COPY_DST, 16);
    h.client.release(stale);
    h.pump();

    let live = h.buffer(BufferUsage::MAP_READ | BufferUsage::COPY_DST, 16);
    assert_eq!(live.handle().id, stale.handle().id);

    h.client.device_push_error_scope(h.device, ErrorFilter::Validation);
    h.client.queue_write_buffer(queue, stale, 0, &[0xaa; 16]);
    let (sink, scope) = status_log();
    h.client.device_pop_error_scope(
        h.device,
        Box::new(move |ty: ErrorType, message: &str| {
            sink.lock().unwrap().push((ty, message.to_owned()))
        }),
    );
    h.client.queue_submit(queue, &[]);

    let (sink, mapped) = status_log();
    h.client.buffer_map_async(
        live,
        MapMode::READ,
        0,
        16,
        Box::new(move |status| sink.lock().unwrap().push(status)),
    );
    h.tick();

    {
        let scope = scope.lock().unwrap();
        assert_eq!(scope.len(), 1);
        assert_eq!(scope[0].0, ErrorType::Validation);
        assert!(scope[0].1.contains("released"), "{}", scope[0].1);
    }
    assert_eq!(*mapped.lock().unwrap(), vec![MapAsyncStatus::Success]);
    assert_eq!(h.client.buffer_get_mapped_range(live, 0, 16), Some(&[0u8; 16][..]));
}

#[test]
fn released_handles_leave_the_stream_usable() {
    let mut h = Harness::new();
    let (sink, errors) = status_log();
    h.client.device_set_uncaptured_error_callback(
        h.device,
        Some(Box::new(move |ty: ErrorType, message: &str| {
            sink.lock().unwrap().push((ty, message.to_owned()))
        })),
    );
    let queue = h.client.device_get_queue(h.device).unwrap();
    let released = h.buffer(BufferUsage::COPY_DST, 16);
    h.client.release(released);
    h.pump();
    assert!(h.server.known(ObjectType::Buffer).is_empty());

    // `pump` asserts the server accepted every command.
    h.client.queue_write_buffer(queue, released, 0, &[1; 16]);
    h.client.buffer_destroy(released);
    h.pump();

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorType::Validation);
    drop(errors);

    let (sink, done) = status_log();
    h.client.queue_on_submitted_work_done(
        queue,
        Box::new(move |status| sink.lock().unwrap().push(status)),
    );
    h.tick();
    assert_eq!(*done.lock().unwrap(), vec![QueueWorkDoneStatus::Success]);
}
