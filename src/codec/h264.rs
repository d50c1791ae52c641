// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.

use bytes::{Buf, Bytes};
use log::{debug, trace, warn};

use crate::rtp::ReceivedPacket;
use crate::{PacketListener, ParticipantInfo, SessionContext};

use super::{AcquireBufferError, Decoder, SampleBuffer, START_CODE};

/// A depacketizer which reassembles access units from single-NAL, FU-A, and
/// STAP-A payloads as specified in [RFC 6184](https://tools.ietf.org/html/rfc6184)
/// and hands them to a [`Decoder`] in Annex B byte-stream form (each NAL unit
/// prefixed with `00 00 00 01`).
///
/// This is deliberately loss-tolerant: a sequence-number gap, a timestamp
/// change mid-fragment, or a decoder with no free buffer marks the in-progress
/// access unit as corrupt and suppresses its accumulation, but never stops the
/// stream. A suppressed unit is still emitted when its End fragment arrives;
/// judging completeness is the decoder's concern. Aggregation modes other
/// than FU-A and STAP-A are logged and ignored.
pub struct Depacketizer<D: Decoder> {
    decoder: D,

    last_sequence_number: u16,
    last_sequence_number_is_valid: bool,

    /// Whether the packet currently being processed followed a gap.
    sequence_error: bool,

    /// The in-progress access unit, if a clean start has been seen.
    current: Option<InProgress<D::Sample>>,
}

struct InProgress<S> {
    sample: S,
    rtp_timestamp: u32,

    /// Set on any error within this access unit; suppresses accumulation
    /// until the unit is closed.
    errored: bool,
}

impl<D: Decoder> Depacketizer<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            last_sequence_number: 0,
            last_sequence_number_is_valid: false,
            sequence_error: false,
            current: None,
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    pub fn into_decoder(self) -> D {
        self.decoder
    }

    /// Processes one packet, advancing reassembly state and emitting any
    /// access units it completes.
    pub fn push(&mut self, pkt: ReceivedPacket) {
        let sequence_number = pkt.sequence_number();
        let timestamp = pkt.timestamp();
        let data = pkt.into_payload_bytes();

        self.sequence_error = self.last_sequence_number_is_valid
            && self.last_sequence_number.wrapping_add(1) != sequence_number;
        if self.sequence_error {
            debug!(
                "RTP data. {}b #{} {} SKIPPED ({})",
                data.len(),
                sequence_number,
                timestamp,
                sequence_number
                    .wrapping_sub(self.last_sequence_number)
                    .wrapping_sub(1),
            );
        } else {
            trace!("RTP data. {}b #{} {}", data.len(), sequence_number, timestamp);
        }

        // https://tools.ietf.org/html/rfc6184#section-5.2
        match data.first() {
            Some(&indicator) => {
                let f_and_nri = indicator & 0b1110_0000;
                match indicator & 0b0001_1111 {
                    1..=23 => self.single_nal(timestamp, &data),
                    28 => self.fu_a(sequence_number, timestamp, f_and_nri, &data),
                    24 => self.stap_a(sequence_number, timestamp, data.slice(1..)),
                    t => warn!(
                        "NAL: unimplemented unit type {} ({:?}) at seq {:04x}",
                        t,
                        super::unit_type(indicator),
                        sequence_number,
                    ),
                }
            }
            None => warn!("empty payload at seq {:04x}", sequence_number),
        }

        self.last_sequence_number = sequence_number;
        self.last_sequence_number_is_valid = true;
    }

    /// The entire NAL unit is in this one payload.
    fn single_nal(&mut self, timestamp: u32, payload: &[u8]) {
        debug!("NAL: full packet, {:?}", super::unit_type(payload[0]));
        self.start_access_unit(timestamp);
        match self.current.as_mut() {
            Some(current) => {
                current.sample.put(&START_CODE);
                current.sample.put(payload);
            }
            None => return,
        }
        self.finish_access_unit();
    }

    /// One fragment of a NAL unit too large for a single packet;
    /// [RFC 6184 section 5.8](https://tools.ietf.org/html/rfc6184#section-5.8).
    fn fu_a(&mut self, sequence_number: u16, timestamp: u32, f_and_nri: u8, payload: &[u8]) {
        let Some(&fu_header) = payload.get(1) else {
            warn!("FU-A without header byte at seq {:04x}", sequence_number);
            return;
        };
        let fu_start = (fu_header & 0b1000_0000) != 0;
        let fu_end = (fu_header & 0b0100_0000) != 0;
        let fu_type = fu_header & 0b0001_1111;

        if fu_start {
            debug!("FU-A start found, starting new access unit");
            self.start_access_unit(timestamp);
            if let Some(current) = self.current.as_mut() {
                current.sample.put(&START_CODE);
                // The type octet of the fragmented NAL unit is not carried as
                // such; its F and NRI bits ride in the FU indicator and its
                // type bits in the FU header.
                current.sample.put(&[fu_type | f_and_nri]);
            }
        }

        // Without an open access unit the start fragment was missed; nothing
        // to do but discard fragments until the next one.
        let Some(current) = self.current.as_mut() else {
            debug!("dropping orphan FU-A fragment at seq {:04x}", sequence_number);
            return;
        };

        if timestamp != current.rtp_timestamp {
            warn!(
                "non-consecutive timestamp {} mid-fragment (unit started at {})",
                timestamp, current.rtp_timestamp,
            );
            current.errored = true;
        }
        if self.sequence_error {
            current.errored = true;
        }

        if !current.errored {
            current.sample.put(&payload[2..]);
        } else {
            debug!("suppressing fragment of corrupt access unit");
        }

        if fu_end {
            debug!("FU-A end found, sending access unit");
            self.finish_access_unit();
        }
    }

    /// Several complete NAL units aggregated into one payload, each preceded
    /// by a 16-bit length;
    /// [RFC 6184 section 5.7.1](https://tools.ietf.org/html/rfc6184#section-5.7.1).
    fn stap_a(&mut self, sequence_number: u16, timestamp: u32, mut data: Bytes) {
        debug!("NAL: STAP-A");
        while data.has_remaining() {
            if data.remaining() < 2 {
                warn!(
                    "STAP-A has {} remaining bytes while expecting 2-byte length at seq {:04x}",
                    data.remaining(),
                    sequence_number,
                );
                break;
            }
            let len = usize::from(data.get_u16());
            if len == 0 {
                warn!("zero length in STAP-A at seq {:04x}", sequence_number);
                break;
            }
            if len > data.remaining() {
                warn!(
                    "STAP-A too short: {} bytes remaining, expecting {}-byte NAL at seq {:04x}",
                    data.remaining(),
                    len,
                    sequence_number,
                );
                break;
            }
            let record = data.split_to(len);
            self.start_access_unit(timestamp);
            match self.current.as_mut() {
                Some(current) => {
                    current.sample.put(&START_CODE);
                    current.sample.put(&record);
                }
                None => continue,
            }
            self.finish_access_unit();
        }
    }

    /// Opens a fresh access unit at the given timestamp, reusing a sample
    /// that was never returned to the decoder (an aborted unit) when one is
    /// around. On acquisition failure the unit stays closed and its
    /// fragments fall out as orphans.
    fn start_access_unit(&mut self, rtp_timestamp: u32) {
        let mut sample = match self.current.take() {
            Some(aborted) => {
                let mut sample = aborted.sample;
                sample.clear();
                sample
            }
            None => match self.decoder.acquire_buffer() {
                Ok(sample) => sample,
                Err(AcquireBufferError(e)) => {
                    warn!("dropping access unit at rtp timestamp {rtp_timestamp}: {e}");
                    return;
                }
            },
        };
        sample.set_rtp_timestamp(rtp_timestamp);
        self.current = Some(InProgress {
            sample,
            rtp_timestamp,
            errored: false,
        });
    }

    /// Closes the open access unit and hands it to the decoder. Emission is
    /// unconditional: a suppressed unit goes out with whatever accumulated
    /// before the error, and the decoder judges completeness.
    fn finish_access_unit(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        let mut sample = current.sample;
        let size = sample.len();
        sample.set_sample_size(size);
        self.decoder.decode_frame(sample);
    }
}

impl<D: Decoder> PacketListener for Depacketizer<D> {
    fn data_packet_received(
        &mut self,
        _session: &SessionContext,
        _participant: &ParticipantInfo,
        packet: ReceivedPacket,
    ) {
        self.push(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::testutil::TestDecoder;

    fn pkt(sequence_number: u16, timestamp: u32, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder::new(sequence_number, timestamp)
            .build(payload.iter().copied())
            .unwrap()
    }

    fn annex_b(nal: &[u8]) -> Vec<u8> {
        let mut out = b"\x00\x00\x00\x01".to_vec();
        out.extend_from_slice(nal);
        out
    }

    #[test]
    fn depacketize() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(0, 0, b"\x06plain")); // plain SEI packet.
        d.push(pkt(1, 0, b"\x18\x00\x09\x06stap-a 1\x00\x09\x06stap-a 2"));
        d.push(pkt(2, 0, b"\x7c\x86fu-a start, "));
        d.push(pkt(3, 0, b"\x7c\x06fu-a middle, "));
        d.push(pkt(4, 0, b"\x7c\x46fu-a end"));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].data(), annex_b(b"\x06plain"));
        assert_eq!(frames[1].data(), annex_b(b"\x06stap-a 1"));
        assert_eq!(frames[2].data(), annex_b(b"\x06stap-a 2"));
        assert_eq!(
            frames[3].data(),
            annex_b(b"\x66fu-a start, fu-a middle, fu-a end"),
        );
        assert_eq!(frames[3].sample_size(), frames[3].data().len());
    }

    #[test]
    fn fu_a_round_trip() {
        // An IDR slice NAL (header 0x65: F=0, NRI=3, type 5) split into
        // fragments; the reconstruction must byte-match the original.
        let payload: Vec<u8> = (0..60).collect();
        let nal: Vec<u8> = std::iter::once(0x65u8).chain(payload.iter().copied()).collect();

        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        let chunks: Vec<&[u8]> = payload.chunks(20).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let fu_header = if i == 0 {
                0x80 | 0x05 // start
            } else if i == chunks.len() - 1 {
                0x40 | 0x05 // end
            } else {
                0x05
            };
            let mut data = vec![0x7c, fu_header]; // indicator: F=0, NRI=3, type 28
            data.extend_from_slice(chunk);
            d.push(pkt(i as u16, 90_000, &data));
        }
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(&nal));
        assert_eq!(frames[0].rtp_timestamp(), 90_000);
    }

    #[test]
    fn stap_a_fan_out() {
        // Three records of sizes {5, 12, 7}.
        let r1 = b"\x67abcd";
        let r2 = b"\x68bcdefghijkl";
        let r3 = b"\x06cdefgh";
        let mut payload = vec![0x18];
        for r in [&r1[..], &r2[..], &r3[..]] {
            payload.extend_from_slice(&(r.len() as u16).to_be_bytes());
            payload.extend_from_slice(r);
        }
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(7, 1234, &payload));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data(), annex_b(r1));
        assert_eq!(frames[1].data(), annex_b(r2));
        assert_eq!(frames[2].data(), annex_b(r3));
        for f in &frames {
            assert_eq!(f.rtp_timestamp(), 1234);
        }
    }

    #[test]
    fn truncated_stap_a() {
        // Second record declares 200 bytes but only 4 remain: the packet is
        // abandoned after the first record, without panicking.
        let mut payload = vec![0x18];
        payload.extend_from_slice(b"\x00\x03\x06ab");
        payload.extend_from_slice(b"\x00\xc8\x06cd");
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(0, 0, &payload));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x06ab"));

        // The stream continues normally afterwards.
        d.push(pkt(1, 90, b"\x06ok"));
        assert_eq!(decoder.decoded().len(), 2);
    }

    #[test]
    fn gap_recovery() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());

        // First access unit: 5 fragments with the 3rd lost. The unit is
        // emitted at its End fragment with accumulation suppressed from the
        // gap onward.
        d.push(pkt(0, 1000, b"\x7c\x85one "));
        d.push(pkt(1, 1000, b"\x7c\x05two "));
        // seq 2 lost.
        d.push(pkt(3, 1000, b"\x7c\x05four "));
        d.push(pkt(4, 1000, b"\x7c\x45five"));

        // Second access unit: clean.
        d.push(pkt(5, 2000, b"\x7c\x85alpha "));
        d.push(pkt(6, 2000, b"\x7c\x45omega"));

        let frames = decoder.decoded();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), annex_b(b"\x65one two "));
        assert_eq!(frames[1].data(), annex_b(b"\x65alpha omega"));
    }

    #[test]
    fn orphan_fragments_dropped() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(0, 0, b"\x7c\x05middle"));
        d.push(pkt(1, 0, b"\x7c\x45end"));
        assert!(decoder.decoded().is_empty());

        // A start fragment opens a unit again.
        d.push(pkt(2, 0, b"\x7c\x85go "));
        d.push(pkt(3, 0, b"\x7c\x45stop"));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x65go stop"));
    }

    #[test]
    fn timestamp_mismatch_mid_fragment() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(0, 1000, b"\x7c\x85head "));
        d.push(pkt(1, 4000, b"\x7c\x45tail"));
        // Emission still occurs, with the mismatched fragment suppressed.
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x65head "));
    }

    #[test]
    fn sequence_number_wrap_is_not_a_gap() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(65_535, 0, b"\x7c\x85first "));
        d.push(pkt(0, 0, b"\x7c\x45second"));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x65first second"));
    }

    #[test]
    fn unimplemented_type_ignored() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(0, 0, b"\x39stuff")); // type 25 (STAP-B): unsupported.
        assert!(decoder.decoded().is_empty());

        // Sequence bookkeeping advanced, so the next unit sees no gap.
        d.push(pkt(1, 0, b"\x7c\x85a "));
        d.push(pkt(2, 0, b"\x7c\x45b"));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x65a b"));
    }

    #[test]
    fn acquire_failure_is_recoverable() {
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());

        decoder.fail_next_acquire();
        d.push(pkt(0, 0, b"\x06gone"));
        assert!(decoder.decoded().is_empty());

        // The next unit acquires a fresh buffer and goes through.
        d.push(pkt(1, 90, b"\x06kept"));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x06kept"));

        // Same for a fragmented unit: its fragments fall out as orphans.
        decoder.fail_next_acquire();
        d.push(pkt(2, 180, b"\x7c\x85x "));
        d.push(pkt(3, 180, b"\x7c\x45y"));
        assert_eq!(decoder.decoded().len(), 1);
        d.push(pkt(4, 270, b"\x7c\x85x "));
        d.push(pkt(5, 270, b"\x7c\x45y"));
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data(), annex_b(b"\x65x y"));
    }

    #[test]
    fn aborted_unit_reuses_sample() {
        // A start fragment whose unit never ends leaves an unreturned
        // sample; the next start must reuse it (cleared) rather than leak.
        let decoder = TestDecoder::new();
        let mut d = Depacketizer::new(decoder.clone());
        d.push(pkt(0, 0, b"\x7c\x85doomed"));
        d.push(pkt(1, 90, b"\x7c\x85fresh "));
        d.push(pkt(2, 90, b"\x7c\x45unit"));
        assert_eq!(decoder.acquires(), 1);
        let frames = decoder.decoded();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), annex_b(b"\x65fresh unit"));
        assert_eq!(frames[0].rtp_timestamp(), 90);
    }
}
