// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use fovea::codec::h264::Depacketizer;
use fovea::codec::{AcquireBufferError, Decoder, VecSample};
use fovea::rtp::ReceivedPacketBuilder;

struct NullDecoder;

impl Decoder for NullDecoder {
    type Sample = VecSample;

    fn acquire_buffer(&mut self) -> Result<VecSample, AcquireBufferError> {
        Ok(VecSample::default())
    }

    fn decode_frame(&mut self, _sample: VecSample) {}
}

const FRAGMENT_SIZE: usize = 1400;
const FRAGMENTS_PER_FRAME: usize = 8;
const FRAMES: u32 = 100;

/// Depacketizes a synthesized stream: a parameter-set STAP-A every 30 frames,
/// then each frame as a run of FU-A fragments.
fn h264_stream() {
    let mut d = Depacketizer::new(NullDecoder);
    let mut sequence_number = 0u16;
    let body = [0x42u8; FRAGMENT_SIZE];
    for i in 0..FRAMES {
        let timestamp = i.wrapping_mul(3000);
        if i % 30 == 0 {
            let mut payload = vec![0x18];
            for nal in [&b"\x67\x64\x00\x1e\xac\xd9"[..], &b"\x68\xeb\xec\xb2"[..]] {
                payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
                payload.extend_from_slice(nal);
            }
            d.push(
                ReceivedPacketBuilder::new(sequence_number, timestamp)
                    .build(payload)
                    .unwrap(),
            );
            sequence_number = sequence_number.wrapping_add(1);
        }
        for f in 0..FRAGMENTS_PER_FRAME {
            let fu_header = if f == 0 {
                0x85
            } else if f == FRAGMENTS_PER_FRAME - 1 {
                0x45
            } else {
                0x05
            };
            let mut payload = vec![0x7c, fu_header];
            payload.extend_from_slice(&body);
            d.push(
                ReceivedPacketBuilder::new(sequence_number, timestamp)
                    .build(payload)
                    .unwrap(),
            );
            sequence_number = sequence_number.wrapping_add(1);
        }
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut g = c.benchmark_group("depacketize");
    g.throughput(criterion::Throughput::Bytes(
        (FRAMES as u64) * (FRAGMENTS_PER_FRAME as u64) * (FRAGMENT_SIZE as u64),
    ))
    .bench_function("h264_stream", |b| b.iter(h264_stream));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
