// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: the decoder sink boundary and RTP payload
//! classification shared between the depacketizer and the jitter buffer.

use h264_reader::nal::{NalHeader, UnitType};
use thiserror::Error;

pub mod h264;

/// The Annex B start code prepended to every emitted NAL unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// The decoder couldn't supply an input buffer.
///
/// Recoverable: the in-progress access unit is abandoned and processing
/// continues with the next one. See [`Decoder::acquire_buffer`].
#[derive(Debug, Error)]
#[error("no decoder input buffer available: {0}")]
pub struct AcquireBufferError(pub String);

/// A writable decoder input buffer plus the tags the decoder needs.
pub trait SampleBuffer {
    /// Discards accumulated bytes, keeping the buffer usable.
    fn clear(&mut self);

    /// Appends bytes to the writable region.
    fn put(&mut self, data: &[u8]);

    /// Bytes accumulated so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tags the sample with the RTP timestamp of its access unit.
    fn set_rtp_timestamp(&mut self, timestamp: u32);

    /// Records the final sample length before handoff to the decoder.
    fn set_sample_size(&mut self, size: usize);
}

/// The downstream video decoder, at its interface boundary.
///
/// [`Decoder::acquire_buffer`] may fail when the platform codec has no free
/// input buffer; the depacketizer treats that as a per-frame recoverable
/// condition. [`Decoder::decode_frame`] takes ownership of the filled sample;
/// a slow implementation stalls the pacer loop (backpressure is implicit).
pub trait Decoder {
    type Sample: SampleBuffer;

    fn acquire_buffer(&mut self) -> Result<Self::Sample, AcquireBufferError>;

    fn decode_frame(&mut self, sample: Self::Sample);
}

/// A plain `Vec<u8>`-backed [`SampleBuffer`] for sinks without
/// platform-managed buffer pools.
#[derive(Clone, Debug, Default)]
pub struct VecSample {
    data: Vec<u8>,
    rtp_timestamp: u32,
    sample_size: usize,
}

impl VecSample {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl SampleBuffer for VecSample {
    fn clear(&mut self) {
        self.data.clear();
    }

    fn put(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn set_rtp_timestamp(&mut self, timestamp: u32) {
        self.rtp_timestamp = timestamp;
    }

    fn set_sample_size(&mut self, size: usize) {
        self.sample_size = size;
    }
}

/// Classification of one RTP payload by its NAL indicator octet, per
/// [RFC 6184 section 5.2](https://tools.ietf.org/html/rfc6184#section-5.2).
///
/// The jitter buffer uses this to judge frame completeness without parsing
/// payloads in full: a frame needs an access-unit start and end plus a
/// contiguous sequence span.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NalKind {
    /// A complete NAL unit (types 1–23): both start and end of an access unit.
    Full,
    /// STAP-A aggregation (type 24): one or more complete NAL units.
    StapA,
    /// FU-A fragment with the Start bit.
    FuStart,
    /// FU-A fragment with neither Start nor End bit.
    FuMiddle,
    /// FU-A fragment with the End bit.
    FuEnd,
    /// Anything else, including payloads too short to classify.
    Other,
}

impl NalKind {
    pub fn classify(payload: &[u8]) -> Self {
        let Some(&indicator) = payload.first() else {
            return NalKind::Other;
        };
        match indicator & 0x1F {
            1..=23 => NalKind::Full,
            24 => NalKind::StapA,
            28 => match payload.get(1) {
                Some(&fu) if fu & 0x80 != 0 => NalKind::FuStart,
                Some(&fu) if fu & 0x40 != 0 => NalKind::FuEnd,
                Some(_) => NalKind::FuMiddle,
                None => NalKind::Other,
            },
            _ => NalKind::Other,
        }
    }

    /// True if a payload of this kind starts an access unit.
    pub fn starts_unit(self) -> bool {
        matches!(self, NalKind::Full | NalKind::StapA | NalKind::FuStart)
    }

    /// True if a payload of this kind ends an access unit.
    pub fn ends_unit(self) -> bool {
        matches!(self, NalKind::Full | NalKind::StapA | NalKind::FuEnd)
    }
}

/// Names the H.264 unit type of a NAL header octet, for diagnostics.
pub(crate) fn unit_type(octet: u8) -> Option<UnitType> {
    NalHeader::new(octet).ok().map(|h| h.nal_unit_type())
}
