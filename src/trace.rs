// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-oriented packet diagnostics, outside the playout path.

use std::io::Write;

use log::warn;

use crate::rtp::ReceivedPacket;
use crate::{PacketListener, ParticipantInfo, SessionContext};

/// A [`PacketListener`] which writes one
/// `wall_clock_millis,sequence_number,rtp_timestamp` line per received
/// packet, for offline analysis of buffering delay.
///
/// Write errors are logged and otherwise ignored; tracing must never affect
/// the stream. The writer is flushed on drop.
pub struct DelayTracer<W: Write> {
    out: W,
}

impl<W: Write> DelayTracer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write> PacketListener for DelayTracer<W> {
    fn data_packet_received(
        &mut self,
        _session: &SessionContext,
        _participant: &ParticipantInfo,
        packet: ReceivedPacket,
    ) {
        if let Err(e) = writeln!(
            self.out,
            "{},{},{}",
            packet.ctx().received_wall().timestamp_millis(),
            packet.sequence_number(),
            packet.timestamp(),
        ) {
            warn!("trace write failed: {e}");
        }
    }
}

impl<W: Write> Drop for DelayTracer<W> {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}
