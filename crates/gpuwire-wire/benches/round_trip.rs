use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpuwire_native::{DeviceDescriptor, NativeProcs};
use gpuwire_types::{BufferDescriptor, BufferUsage};
use gpuwire_wire::{
    BufferSerializer, Client, CommandHandler, Server, WireClientDescriptor, WireObject,
    WireServerDescriptor,
};

fn criterion_config() -> Criterion {
    match std::env::var("GPUWIRE_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50),
    }
}

fn bench_queue_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_queue_write_buffer");
    for size in [256usize, 64 * 1024, 1024 * 1024] {
        let mut procs = NativeProcs::new();
        let native = procs.create_device(&DeviceDescriptor::default()).unwrap();
        let mut server = Server::new(
            procs,
            BufferSerializer::new(64 * 1024),
            WireServerDescriptor::default(),
        )
        .unwrap();
        let mut client = Client::new(
            BufferSerializer::new(64 * 1024),
            WireClientDescriptor::default(),
        )
        .unwrap();
        let device = client.reserve_device().unwrap();
        server.inject_device(native, device.handle());

        let queue = client.device_get_queue(device).unwrap();
        let buffer = client
            .device_create_buffer(
                device,
                &BufferDescriptor {
                    label: None,
                    usage: BufferUsage::COPY_DST,
                    size: size as u64,
                    mapped_at_creation: false,
                },
            )
            .unwrap();
        let setup = client.serializer_mut().take();
        server.handle_commands(&setup).unwrap();

        let payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                client.queue_write_buffer(queue, buffer, 0, black_box(payload));
                let bytes = client.serializer_mut().take();
                server.handle_commands(&bytes).unwrap();
                server.tick().unwrap();
            })
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_queue_writes
}
criterion_main!(benches);
