// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTP packet model, as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::ops::Range;

use bytes::{Buf, Bytes};
use pretty_hex::PrettyHex;

use crate::PacketContext;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// How much payload to show in `Debug` output before truncating.
const DEBUG_PAYLOAD_MAX: usize = 64;

/// Raw packet without interpretation or metadata.
///
/// Primarily validates a raw buffer, then provides accessors for it. The
/// payload range is returned separately from construction so the containing
/// [`ReceivedPacket`] can keep it without padding this struct.
#[derive(Debug)]
pub struct RawPacket(
    /// Full packet data, including headers.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub Bytes,
);

impl RawPacket {
    /// Validates an RTP packet, returning a wrapper and the payload range.
    pub fn new(data: Bytes) -> Result<(Self, Range<u16>), RawPacketError> {
        // RTP doesn't have a defined maximum size but it's implied by the
        // transport: UDP payloads and interleaved data messages are both
        // under 65,536 bytes.
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => {
                return Err(RawPacketError {
                    reason: "too long",
                    data,
                })
            }
        };
        if len < MIN_HEADER_LEN {
            return Err(RawPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(RawPacketError {
                reason: "must be version 2",
                data,
            });
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = u16::from(data[0] & 0b0000_1111);
        let csrc_end = MIN_HEADER_LEN + 4 * csrc_count;
        let payload_start = if has_extension {
            // The extension starts with a 4-byte header whose second half is
            // its body length in 32-bit words.
            let ext_body_start = match csrc_end.checked_add(4) {
                Some(s) if usize::from(s) <= data.len() => s,
                _ => {
                    return Err(RawPacketError {
                        reason: "extension header is after end of packet",
                        data,
                    })
                }
            };
            let ext_words = u16::from_be_bytes([
                data[usize::from(csrc_end) + 2],
                data[usize::from(csrc_end) + 3],
            ]);
            match ext_words
                .checked_mul(4)
                .and_then(|b| ext_body_start.checked_add(b))
            {
                Some(s) => s,
                None => {
                    return Err(RawPacketError {
                        reason: "extension extends beyond maximum packet size",
                        data,
                    })
                }
            }
        } else {
            csrc_end
        };
        if len < payload_start {
            return Err(RawPacketError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        let payload_end = if has_padding {
            let padding_len = u16::from(data[data.len() - 1]);
            if padding_len == 0 {
                return Err(RawPacketError {
                    reason: "invalid padding length 0",
                    data,
                });
            }
            match len.checked_sub(padding_len) {
                Some(e) if e >= payload_start => e,
                _ => {
                    return Err(RawPacketError {
                        reason: "padding larger than payload",
                        data,
                    })
                }
            }
        } else {
            len
        };
        Ok((Self(data), payload_start..payload_end))
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.0[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

#[derive(Debug)]
pub struct RawPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

/// Builds a [`RawPacket`] from parts; for tests and benchmarks.
#[doc(hidden)]
pub struct RawPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl RawPacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<(RawPacket, Range<u16>), &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        let len = u16::try_from(data.len()).map_err(|_| "payload too long")?;
        Ok((RawPacket(data), MIN_HEADER_LEN..len))
    }
}

/// A received RTP packet: validated raw data plus a [`PacketContext`].
///
/// Immutable once constructed; everything downstream of the transport layer
/// consumes these.
pub struct ReceivedPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) raw: RawPacket,
    pub(crate) payload_range: Range<u16>,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let payload = self.payload();
        let shown = &payload[..std::cmp::min(payload.len(), DEBUG_PAYLOAD_MAX)];
        f.debug_struct("ReceivedPacket")
            .field("ctx", &self.ctx)
            .field("sequence_number", &self.raw.sequence_number())
            .field("timestamp", &self.raw.timestamp())
            .field("ssrc", &self.raw.ssrc())
            .field("mark", &self.raw.mark())
            .field("payload_len", &payload.len())
            .field("payload", &format_args!("{:?}", shown.hex_dump()))
            .finish()
    }
}

impl ReceivedPacket {
    /// Validates `data` as an RTP packet received now.
    pub fn parse(data: Bytes) -> Result<Self, RawPacketError> {
        let (raw, payload_range) = RawPacket::new(data)?;
        Ok(Self {
            ctx: PacketContext::now(),
            raw,
            payload_range,
        })
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.raw.sequence_number()
    }

    /// The RTP timestamp: 32-bit clock ticks at the stream's clock rate.
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.raw.timestamp()
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.raw.ssrc()
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.raw.mark()
    }

    /// The playout timestamp: the RTP timestamp converted to a millisecond
    /// bucket. `ticks_per_ms` is the stream clock rate divided by 1000, e.g.
    /// 90 for the 90 kHz video clock. Used as the jitter buffer's frame key.
    #[inline]
    pub fn playout_timestamp(&self, ticks_per_ms: u32) -> u64 {
        u64::from(self.raw.timestamp()) / u64::from(ticks_per_ms)
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw.0[usize::from(self.payload_range.start)..usize::from(self.payload_range.end)]
    }

    /// Consumes the packet and returns the payload as a [`Bytes`],
    /// without copying.
    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        let mut data = self.raw.0;
        data.truncate(usize::from(self.payload_range.end));
        data.advance(usize::from(self.payload_range.start));
        data
    }
}

/// Builds a [`ReceivedPacket`] from parts; for tests and benchmarks.
#[doc(hidden)]
pub struct ReceivedPacketBuilder {
    pub ctx: PacketContext,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl ReceivedPacketBuilder {
    pub fn new(sequence_number: u16, timestamp: u32) -> Self {
        Self {
            ctx: PacketContext::dummy(),
            sequence_number,
            timestamp,
            payload_type: 96,
            ssrc: 0,
            mark: false,
        }
    }

    pub fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<ReceivedPacket, &'static str> {
        let (raw, payload_range) = RawPacketBuilder {
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark: self.mark,
        }
        .build(payload)?;
        Ok(ReceivedPacket {
            ctx: self.ctx,
            raw,
            payload_range,
        })
    }
}
