//! End-to-end client-server benchmarks over an in-memory stream.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use segwire_protocol::{FieldArray, Value};
use segwire_schema::Schema;
use segwire_session::{
    CallContext, HandlerRegistry, HandlerResult, MethodCall, Reply, Session, SessionConfig,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

const ACCOUNT: &str = include_str!("../../schemas/account.yaml");

async fn echo(ctx: CallContext) -> HandlerResult {
    Ok(Reply::new(ctx.params))
}

struct TestSetup {
    _server: Session,
    client: Session,
}

fn setup(rt: &Runtime) -> TestSetup {
    let schema = Arc::new(Schema::from_yaml(ACCOUNT).unwrap());
    let mut handlers = HandlerRegistry::new();
    handlers.register_named(&schema, "echo", echo).unwrap();

    rt.block_on(async {
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        TestSetup {
            _server: Session::server(
                server_io,
                schema.clone(),
                handlers,
                SessionConfig::default(),
            ),
            client: Session::client(client_io, schema, SessionConfig::default()),
        }
    })
}

fn echo_call() -> MethodCall {
    MethodCall::new("echo", FieldArray::new(vec![Value::from("ping")]))
}

fn bench_echo_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup(&rt);

    let mut group = c.benchmark_group("session_echo");
    group.throughput(Throughput::Elements(1));

    group.bench_function("echo", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.invoke(echo_call()).await.unwrap()) });
    });

    group.finish();
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup(&rt);

    let mut group = c.benchmark_group("session_concurrent");

    for concurrency in [8usize, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_function(format!("echo_x{}", concurrency), |b| {
            b.to_async(&rt).iter(|| async {
                let calls: Vec<_> = (0..concurrency)
                    .map(|_| {
                        let client = setup.client.clone();
                        tokio::spawn(async move { client.invoke(echo_call()).await })
                    })
                    .collect();
                for call in calls {
                    black_box(call.await.unwrap().unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_echo_latency, bench_concurrent_calls);

criterion_main!(benches);
