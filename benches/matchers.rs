//! Benchmarks for connection classification.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use ultramux::mux::{Any, HTTP2_PREFACE, Http1, Http2HeaderField, Match, Matcher};

const FRAME_SETTINGS: u8 = 0x4;
const FRAME_HEADERS: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

fn frame(kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
    out.extend_from_slice(&stream.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn grpc_request() -> Vec<u8> {
    let mut encoder = fluke_hpack::Encoder::new();
    let headers = [
        (":method", "POST"),
        (":scheme", "http"),
        (":path", "/ultra.UltraService/SayHello"),
        (":authority", "localhost"),
        ("content-type", "application/grpc"),
        ("te", "trailers"),
    ];
    let block = encoder.encode(
        headers
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
    );

    let mut out = HTTP2_PREFACE.to_vec();
    out.extend(frame(FRAME_SETTINGS, 0, 0, &[0, 2, 0, 0, 0, 0]));
    out.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block));
    out
}

fn benchmark_grpc_matcher(c: &mut Criterion) {
    let matcher = Http2HeaderField::grpc();
    let request = grpc_request();

    let mut group = c.benchmark_group("grpc_matcher");
    group.throughput(Throughput::Bytes(request.len() as u64));
    group.bench_function("full_request", |b| {
        b.iter(|| black_box(matcher.matches(black_box(&request))))
    });
    group.bench_function("truncated_preface", |b| {
        b.iter(|| black_box(matcher.matches(black_box(&request[..12]))))
    });
    group.bench_function("http1_request", |b| {
        b.iter(|| black_box(matcher.matches(black_box(b"GET /health HTTP/1.1\r\n"))))
    });
    group.finish();
}

fn benchmark_http1_matcher(c: &mut Criterion) {
    let request = b"GET /grpc-call?name=Ann HTTP/1.1\r\nHost: localhost\r\n\r\n";

    c.bench_function("http1_request_line", |b| {
        b.iter(|| black_box(Http1.matches(black_box(request))))
    });
}

fn benchmark_ordered_evaluation(c: &mut Criterion) {
    let matchers: Vec<Box<dyn Matcher>> = vec![Box::new(Http2HeaderField::grpc()), Box::new(Any)];
    let request = b"GET / HTTP/1.1\r\n\r\n";

    c.bench_function("first_match_fallthrough", |b| {
        b.iter(|| {
            black_box(
                matchers
                    .iter()
                    .position(|m| m.matches(black_box(request)) == Match::Yes),
            )
        })
    });
}

criterion_group!(
    benches,
    benchmark_grpc_matcher,
    benchmark_http1_matcher,
    benchmark_ordered_evaluation,
);
criterion_main!(benches);
