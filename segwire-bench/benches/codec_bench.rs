//! Field array and segment encoding/decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segwire_protocol::{
    FieldArray, FieldArraySchema, FieldSpec, FieldType, SegmentDecoder, SegmentEncoder, Value,
};
use segwire_schema::Schema;
use std::collections::BTreeMap;

const ACCOUNT: &str = include_str!("../../schemas/account.yaml");

fn profile_schema() -> FieldArraySchema {
    let mut optional = BTreeMap::new();
    optional.insert(0, FieldSpec::new("nickname", FieldType::Str));
    optional.insert(3, FieldSpec::new("avatar", FieldType::Bin));
    FieldArraySchema::new(
        vec![
            FieldSpec::new("id", FieldType::Int(8)),
            FieldSpec::new("active", FieldType::Bool),
            FieldSpec::new("bio", FieldType::Str),
            FieldSpec::new("tags", FieldType::list(FieldType::Str, 1)),
        ],
        optional,
    )
    .unwrap()
}

fn profile(bio_len: usize) -> FieldArray {
    FieldArray::new(vec![
        Value::Int(0x1234_5678),
        Value::Bool(true),
        Value::from("b".repeat(bio_len)),
        Value::List(vec![Value::from("rust"), Value::from("wire")]),
    ])
    .with_optional(0, Value::from("ann"))
}

fn bench_field_array_encode(c: &mut Criterion) {
    let schema = profile_schema();
    let mut group = c.benchmark_group("field_array_encode");

    for size in [16, 256, 4096] {
        let fields = profile(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &fields, |b, fields| {
            b.iter(|| black_box(fields.encode(&schema).unwrap()));
        });
    }

    group.finish();
}

fn bench_field_array_decode(c: &mut Criterion) {
    let schema = profile_schema();
    let mut group = c.benchmark_group("field_array_decode");

    for size in [16, 256, 4096] {
        let (encoded, bits) = profile(size).encode(&schema).unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(FieldArray::decode(encoded, bits, &schema).unwrap()));
        });
    }

    group.finish();
}

fn bench_segment_decode(c: &mut Criterion) {
    let schema = Schema::from_yaml(ACCOUNT).unwrap();
    let echo = schema.method_by_name("echo").unwrap().clone();
    let mut group = c.benchmark_group("segment_decode");

    for count in [1usize, 64] {
        let mut stream = Vec::new();
        for i in 0..count {
            let invoke = segwire_protocol::InvokeMethod::new(
                echo.method,
                FieldArray::new(vec![Value::from(format!("message {}", i))]),
            );
            let bytes = SegmentEncoder::invoke_method(
                (i % 256) as u8,
                &invoke,
                echo.params.schema(),
                None,
            )
            .unwrap();
            stream.extend_from_slice(&bytes);
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("invoke", count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = SegmentDecoder::new();
                decoder.extend(stream);
                let mut decoded = 0;
                while let Some(segment) = decoder.decode_serverbound(&schema).unwrap() {
                    black_box(segment);
                    decoded += 1;
                }
                assert_eq!(decoded, count);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_field_array_encode,
    bench_field_array_decode,
    bench_segment_decode,
);

criterion_main!(benches);
