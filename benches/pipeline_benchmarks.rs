/// Benchmarks for response buffering and interceptor waves
use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::Method;
use restpipe::buffer::BufferPool;
use restpipe::conduit::{BufferingConduit, MemoryDownstream, SinkConduit};
use restpipe::config::Config;
use restpipe::exchange::{ContentKind, Exchange, Request, Response};
use restpipe::gateway::Gateway;
use restpipe::interceptor::{Interceptor, InterceptorError, InterceptPoint};
use restpipe::plugin::InterceptorRecord;
use std::sync::Arc;

struct Stamp;

#[async_trait]
impl Interceptor for Stamp {
    async fn resolve(&self, _request: &Request, _response: &Response) -> Result<bool, InterceptorError> {
        Ok(true)
    }

    async fn handle(&self, _request: &mut Request, response: &mut Response) -> Result<(), InterceptorError> {
        response
            .headers_mut()
            .insert("x-stamp", http::HeaderValue::from_static("1"));
        Ok(())
    }
}

fn bench_buffering(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferingConduit");
    let gateway = Gateway::builder(Config::default()).build().unwrap();

    for size in [1024usize, 64 * 1024, 512 * 1024] {
        let chunk = Bytes::from(vec![b'x'; 4096]);
        let chunks = size / chunk.len();
        let pool = BufferPool::new(16 * 1024, 1024 * 1024);

        group.bench_with_input(BenchmarkId::new("write_and_flush", size), &chunks, |b, &chunks| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            b.to_async(&rt).iter(|| async {
                let exchange = Exchange::new(
                    Request::new(Method::GET, "/api/items".parse().unwrap()),
                    pool.clone(),
                    Box::new(MemoryDownstream::new()),
                );
                let mut conduit = BufferingConduit::new(exchange, gateway.executor().clone());
                for _ in 0..chunks {
                    conduit.write(chunk.clone()).await.unwrap();
                }
                conduit.terminate_writes().await.unwrap();
            });
        });
    }

    group.finish();
}

fn bench_interceptor_wave(c: &mut Criterion) {
    let mut group = c.benchmark_group("InterceptorWave");

    for count in [1usize, 8, 32] {
        let gateway = Gateway::builder(Config::default()).build().unwrap();
        for i in 0..count {
            gateway.registry().register_interceptor(
                InterceptorRecord::interceptor(format!("stamp-{i}"), InterceptPoint::RequestAfterAuth, Arc::new(Stamp))
                    .with_kind(ContentKind::Json)
                    .with_priority(i as i32),
            );
        }

        group.bench_with_input(BenchmarkId::new("ping", count), &gateway, |b, gateway| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            b.to_async(&rt).iter(|| async {
                let downstream = MemoryDownstream::new();
                let exchange = gateway.exchange(
                    Request::new(Method::GET, "/ping".parse().unwrap()),
                    Box::new(downstream.clone()),
                );
                gateway.handle(exchange).await;
                black_box(downstream.recorded().status)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_buffering, bench_interceptor_wave);
criterion_main!(benches);
