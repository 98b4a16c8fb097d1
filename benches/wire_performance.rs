//! HTTP/1.1 wire benchmarks
//!
//! Measures the hot paths of a call that do not touch the network:
//! - Response head parsing
//! - Chunked body decoding
//! - Request encoding
//! - gzip content decoding
//! - Cookie header assembly
//!
//! Run with: cargo bench --bench wire_performance

use bytes::Bytes;
use courier::http::chunked::ChunkedDecoder;
use courier::http::decode::decode_content;
use courier::http::{
    BuildContext, Cookie, CookieJar, Headers, Method, Request, RequestBuilder, ResponseParser,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use url::Url;

fn bench_response_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_head");

    let small = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec();
    let mut large = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n".to_vec();
    for i in 0..40 {
        large.extend_from_slice(format!("X-Header-{}: value-{}\r\n", i, i).as_bytes());
    }
    large.extend_from_slice(b"Content-Length: 0\r\n\r\n");

    for (name, head) in [("minimal", &small), ("forty_headers", &large)] {
        group.throughput(Throughput::Bytes(head.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), head, |b, head| {
            b.iter(|| {
                let mut parser = ResponseParser::new();
                black_box(parser.parse(black_box(head)).unwrap());
            });
        });
    }
    group.finish();
}

fn chunked_body(total: usize, chunk: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(total + total / chunk * 8 + 8);
    let data = vec![b'x'; chunk];
    let mut left = total;
    while left > 0 {
        let n = left.min(chunk);
        out.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
        out.extend_from_slice(&data[..n]);
        out.extend_from_slice(b"\r\n");
        left -= n;
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

fn bench_chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_decode");

    for chunk in [256usize, 4096, 65536] {
        let body = chunked_body(1024 * 1024, chunk);
        group.throughput(Throughput::Bytes(1024 * 1024));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &body, |b, body| {
            let mut out = vec![0u8; 64 * 1024];
            b.iter(|| {
                let mut decoder = ChunkedDecoder::new();
                let mut input = &body[..];
                let mut total = 0;
                loop {
                    let (used, produced, done) = decoder.decode(input, &mut out).unwrap();
                    input = &input[used..];
                    total += produced;
                    if done {
                        break;
                    }
                }
                black_box(total);
            });
        });
    }
    group.finish();
}

fn bench_request_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_build");
    let builder = RequestBuilder::default();
    let ctx = BuildContext::default();

    let get = Request::parse(Method::Get, "http://api.example.com/v1/items")
        .unwrap()
        .with_params(vec![("page".into(), "2".into()), ("q".into(), "rust http".into())]);
    group.bench_function("get_with_params", |b| {
        b.iter(|| black_box(builder.build(black_box(&get), &ctx).unwrap().to_bytes().unwrap()));
    });

    let value = serde_json::json!({"name": "ada", "tags": ["a", "b", "c"], "count": 3});
    let post = Request::parse(Method::Post, "http://api.example.com/v1/items")
        .unwrap()
        .with_body(courier::http::Body::json(&value).unwrap());
    group.bench_function("post_json", |b| {
        b.iter(|| black_box(builder.build(black_box(&post), &ctx).unwrap().to_bytes().unwrap()));
    });
    group.finish();
}

fn bench_gzip_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("gzip_decode");
    let text: Vec<u8> = (0..256 * 1024).map(|i| b"abcdefghij"[i % 10]).collect();
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&text).unwrap();
    let raw = Bytes::from(enc.finish().unwrap());
    let headers: Headers = [("Content-Encoding", "gzip")].into_iter().collect();

    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("256k", |b| {
        b.iter(|| black_box(decode_content(black_box(&raw), &headers).unwrap()));
    });
    group.finish();
}

fn bench_cookie_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("cookie_header");
    let jar = CookieJar::new();
    for i in 0..50 {
        let path = if i % 2 == 0 { "/" } else { "/api" };
        jar.insert(Cookie::new(format!("c{}", i), format!("v{}", i), "example.com", path));
    }
    let url = Url::parse("http://example.com/api/items").unwrap();

    group.bench_function("fifty_cookies", |b| {
        b.iter(|| black_box(jar.cookie_header(black_box(&url))));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_response_head,
    bench_chunked_decode,
    bench_request_build,
    bench_gzip_decode,
    bench_cookie_header
);
criterion_main!(benches);
