use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use minipb::mini_descriptor::{decode_message_descriptor, encode_message_descriptor, FieldSpec, MessageSpec};
use minipb::{wire, Arena, DecodeOptions, EncodeOptions, FieldType, MiniTable, Mode};

fn scalar_field(number: u32, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        number,
        field_type,
        mode: Mode::Scalar,
        packed: false,
        required: false,
        proto3_singular: true,
    }
}

fn array_field(number: u32, field_type: FieldType, packed: bool) -> FieldSpec {
    FieldSpec {
        number,
        field_type,
        mode: Mode::Array,
        packed,
        required: false,
        proto3_singular: false,
    }
}

/// Same shape as the original `Test` message: two scalars, a bytes field,
/// one scalar sub-message, and a repeated int32. No map/oneof/extension —
/// those get their own micro-benchmarks, not the hot-path one.
fn build_test_schema() -> &'static MiniTable {
    let child_spec = MessageSpec {
        fields: vec![scalar_field(1, FieldType::Int32), scalar_field(2, FieldType::UInt32)],
        ..Default::default()
    };
    let child_descriptor = encode_message_descriptor(&child_spec);
    let child_mt: &'static MiniTable = Box::leak(Box::new(decode_message_descriptor(&child_descriptor).unwrap()));

    let mut message_field = scalar_field(4, FieldType::Message);
    message_field.mode = Mode::Scalar;
    let spec = MessageSpec {
        fields: vec![
            scalar_field(1, FieldType::Int32),
            scalar_field(2, FieldType::UInt32),
            scalar_field(3, FieldType::Bytes),
            message_field,
            array_field(5, FieldType::Int32, true),
        ],
        ..Default::default()
    };
    let descriptor = encode_message_descriptor(&spec);
    let mt: &'static MiniTable = Box::leak(Box::new(decode_message_descriptor(&descriptor).unwrap()));
    mt.set_sub_message(&mt.fields[3], child_mt as *const MiniTable as *mut MiniTable);
    mt
}

fn write_len_delim(buf: &mut Vec<u8>, field_number: u32, bytes: &[u8]) {
    wire::write_varint(buf, ((field_number as u64) << 3) | 2);
    wire::write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn make_small() -> Vec<u8> {
    let mut buf = Vec::new();
    wire::write_varint(&mut buf, (1 << 3) | 0);
    wire::write_varint(&mut buf, 42);
    wire::write_varint(&mut buf, (2 << 3) | 0);
    wire::write_varint(&mut buf, 0xDEADBEEF);
    buf
}

fn make_medium() -> Vec<u8> {
    let mut buf = make_small();
    write_len_delim(&mut buf, 3, b"Hello World! This is a test string with some content.");
    let mut child = Vec::new();
    wire::write_varint(&mut child, (1 << 3) | 0);
    wire::write_varint(&mut child, 123);
    wire::write_varint(&mut child, (2 << 3) | 0);
    wire::write_varint(&mut child, 456);
    write_len_delim(&mut buf, 4, &child);
    buf
}

fn make_large() -> Vec<u8> {
    let mut buf = make_medium();
    let mut packed = Vec::new();
    for i in 0..100i32 {
        wire::write_varint(&mut packed, i as u64);
    }
    write_len_delim(&mut buf, 5, &packed);
    buf
}

fn bench_decode(c: &mut Criterion) {
    let mt = build_test_schema();
    let mut group = c.benchmark_group("decode");

    for (name, data) in [("small", make_small()), ("medium", make_medium()), ("large", make_large())] {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let arena = Arena::new();
                let msg = minipb::Message::new_in(&arena, mt.size as usize).unwrap();
                let status = minipb::decode_message(black_box(&data), &msg, mt, None, DecodeOptions::new(), &arena);
                black_box(status)
            })
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mt = build_test_schema();
    let mut group = c.benchmark_group("encode");

    for (name, data) in [("small", make_small()), ("medium", make_medium()), ("large", make_large())] {
        let arena = Arena::new();
        let msg = minipb::Message::new_in(&arena, mt.size as usize).unwrap();
        minipb::decode_message(&data, &msg, mt, None, DecodeOptions::new(), &arena);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let out = minipb::encode_message(black_box(&msg), mt, None, EncodeOptions::new()).unwrap();
                black_box(out.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
