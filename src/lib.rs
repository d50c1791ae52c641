// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP H.264 playout pipeline: jitter buffer, RFC 6184 depacketization, and a
//! fixed-cadence pacer feeding a downstream decoder.
//!
//! The pipeline has three packet consumers, all implementing the one-method
//! [`PacketListener`] trait so a transport layer can drive any of them:
//!
//! *   [`buffer::JitterBuffer`]: reorders packets by playout timestamp,
//!     waits for a startup window of frames, then drains one frame per
//!     fixed-length cycle to its own downstream listener.
//! *   [`codec::h264::Depacketizer`]: turns single-NAL, FU-A, and STAP-A
//!     RTP payloads into Annex B access units and hands them to a
//!     [`codec::Decoder`].
//! *   [`trace::DelayTracer`]: writes a line per packet for offline delay
//!     analysis.
//!
//! The transport/session layer itself (sockets, RTCP, SDP) is out of scope;
//! callers parse datagrams with [`rtp::RawPacket`] and invoke the listener.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod buffer;
pub mod codec;
pub mod rtp;
pub mod trace;

#[cfg(test)]
mod testutil;

/// A wall time taken from the local machine's realtime clock.
///
/// Used in packet contexts and the trace sink; formatting via `Debug` and
/// `Display`.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }

    /// Returns milliseconds since the Unix epoch.
    #[inline]
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T%.3f"))
    }
}

/// Identity of the RTP session a packet belongs to.
///
/// This gives enough information to pick out the flow in a packet capture.
/// The jitter buffer records it when the first packet of a stream arrives.
#[derive(Copy, Clone, Debug)]
pub struct SessionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl SessionContext {
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }
}

impl Display for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)<-{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// The participant which sent a packet, as far as the transport layer knows.
#[derive(Clone, Debug)]
pub struct ParticipantInfo {
    pub ssrc: u32,
    pub cname: Option<String>,
}

impl ParticipantInfo {
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc, cname: None }
    }
}

impl Display for ParticipantInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cname.as_deref() {
            Some(cname) => write!(f, "{} (ssrc {:08x})", cname, self.ssrc),
            None => write!(f, "ssrc {:08x}", self.ssrc),
        }
    }
}

/// Context of one received packet: the wall time at which the transport
/// layer picked it up.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext {
    received_wall: WallTime,
}

impl PacketContext {
    pub fn now() -> Self {
        Self {
            received_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self::now()
    }

    #[inline]
    pub fn received_wall(&self) -> WallTime {
        self.received_wall
    }
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.received_wall, f)
    }
}

/// A consumer of received RTP data packets.
///
/// This is the seam between the transport layer and the pipeline, and between
/// pipeline stages: the transport invokes it once per received packet, and the
/// jitter buffer invokes its downstream listener once per packet of each
/// complete frame it releases. Each listener is driven by one caller at a
/// time, though not necessarily always the same thread.
///
/// Implementations handle malformed or unexpected data internally; nothing is
/// surfaced to the caller as a hard failure. See [`Error`] for the few
/// conditions that are fatal to pipeline construction or shutdown.
pub trait PacketListener {
    fn data_packet_received(
        &mut self,
        session: &SessionContext,
        participant: &ParticipantInfo,
        packet: rtp::ReceivedPacket,
    );
}
