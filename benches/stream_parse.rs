use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use muxchat::core::chat_stream::decode_lines;
use muxchat::core::sse::SseLineBuffer;
use muxchat::core::thinking::{Segment, ThinkingSplitter};

fn make_body(frames: usize) -> Vec<u8> {
    let mut body = String::new();
    for i in 0..frames {
        let text = if i % 16 == 0 { "<think>pondering</think>" } else { "lorem ipsum dolor " };
        let payload = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
        body.push_str(&format!("data: {payload}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}

fn bench_stream_parse(c: &mut Criterion) {
    for &frames in &[200usize, 2000usize] {
        let body = make_body(frames);
        let mut group = c.benchmark_group(format!("stream_parse_frames{frames}"));
        group.throughput(Throughput::Bytes(body.len() as u64));

        // Network-sized reads that split frames mid-line.
        for &read_size in &[64usize, 1024usize] {
            group.bench_function(BenchmarkId::new("tokenize_decode", read_size), |b| {
                b.iter(|| {
                    let mut buffer = SseLineBuffer::new();
                    let mut events = 0;
                    for chunk in body.chunks(read_size) {
                        events += decode_lines(buffer.push(chunk)).len();
                    }
                    buffer.finish();
                    events
                })
            });
        }

        let text: String = (0..frames)
            .map(|i| if i % 16 == 0 { "<thi" } else { "nk>words</think> more " })
            .collect();
        group.bench_function(BenchmarkId::new("thinking_split", 7), |b| {
            b.iter(|| {
                let mut splitter = ThinkingSplitter::new();
                let mut segments: Vec<Segment> = Vec::new();
                let chars: Vec<char> = text.chars().collect();
                for piece in chars.chunks(7) {
                    let piece: String = piece.iter().collect();
                    splitter.push(&piece, &mut segments);
                }
                splitter.finish(&mut segments);
                segments.len()
            })
        });

        group.finish();
    }
}

criterion_group!(benches, bench_stream_parse);
criterion_main!(benches);
