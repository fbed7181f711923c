use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpuwire_protocol::{CmdStreamIter, CmdStreamWriter, Command};
use gpuwire_types::{BufferDescriptor, BufferUsage, MapMode, ObjectHandle};

fn build_stream(write_size: usize, count: usize) -> Vec<u8> {
    let payload = vec![0x5a; write_size];
    let mut writer = CmdStreamWriter::new();
    for i in 0..count as u32 {
        writer
            .push(&Command::DeviceCreateBuffer {
                device_id: 1,
                result: ObjectHandle::new(i + 2, 0),
                desc: BufferDescriptor {
                    label: Some("bench"),
                    usage: BufferUsage::COPY_DST | BufferUsage::MAP_READ,
                    size: write_size as u64,
                    mapped_at_creation: false,
                },
            })
            .unwrap();
        writer
            .push(&Command::QueueWriteBuffer {
                queue_id: 1,
                buffer_id: i + 2,
                offset: 0,
                data: &payload,
            })
            .unwrap();
        writer
            .push(&Command::BufferMapAsync {
                buffer_id: i + 2,
                mode: MapMode::READ,
                request_serial: u64::from(i),
                offset: 0,
                size: write_size as u64,
            })
            .unwrap();
    }
    writer.finish()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for write_size in [16usize, 4096] {
        let stream = build_stream(write_size, 256);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(write_size),
            &stream,
            |b, stream| {
                b.iter(|| {
                    let mut n = 0usize;
                    for packet in CmdStreamIter::new(black_box(stream)) {
                        let cmd = packet.and_then(Command::decode).unwrap();
                        n += cmd.opcode() as usize;
                    }
                    n
                })
            },
        );
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for write_size in [16usize, 4096] {
        group.bench_function(BenchmarkId::from_parameter(write_size), |b| {
            b.iter(|| build_stream(black_box(write_size), 256))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
