// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{AcquireBufferError, Decoder, VecSample};
use crate::rtp::ReceivedPacket;
use crate::{PacketListener, ParticipantInfo, SessionContext};

/// A [`Decoder`] for tests: hands out [`VecSample`]s and keeps everything it
/// decodes. Cloning shares the underlying storage, so a test can keep a
/// handle while the pipeline owns the other.
#[derive(Clone, Default)]
pub(crate) struct TestDecoder {
    frames: Arc<Mutex<Vec<VecSample>>>,
    acquires: Arc<AtomicUsize>,
    fail_acquires: Arc<AtomicUsize>,
}

impl TestDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the next `acquire_buffer` call fail, as a platform codec with
    /// no free input buffer would.
    pub(crate) fn fail_next_acquire(&self) {
        self.fail_acquires.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of successful buffer acquisitions so far.
    pub(crate) fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Snapshot of the decoded samples so far.
    pub(crate) fn decoded(&self) -> Vec<VecSample> {
        self.frames.lock().clone()
    }
}

impl Decoder for TestDecoder {
    type Sample = VecSample;

    fn acquire_buffer(&mut self) -> Result<VecSample, AcquireBufferError> {
        if self.fail_acquires.load(Ordering::SeqCst) > 0 {
            self.fail_acquires.fetch_sub(1, Ordering::SeqCst);
            return Err(AcquireBufferError("no free input buffer".to_owned()));
        }
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(VecSample::default())
    }

    fn decode_frame(&mut self, sample: VecSample) {
        self.frames.lock().push(sample);
    }
}

/// A listener that records the (sequence number, RTP timestamp) of every
/// packet it receives, in order.
#[derive(Clone, Default)]
pub(crate) struct CollectListener {
    received: Arc<Mutex<Vec<(u16, u32)>>>,
}

impl CollectListener {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn received(&self) -> Vec<(u16, u32)> {
        self.received.lock().clone()
    }
}

impl PacketListener for CollectListener {
    fn data_packet_received(
        &mut self,
        _session: &SessionContext,
        _participant: &ParticipantInfo,
        packet: ReceivedPacket,
    ) {
        self.received
            .lock()
            .push((packet.sequence_number(), packet.timestamp()));
    }
}
