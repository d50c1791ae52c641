// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Jitter-avoidance buffering: a timestamp-ordered frame map filled by the
//! ingest path and drained at a fixed cadence by a dedicated pacer thread.
//!
//! The buffer accumulates packets into [`Frame`]s keyed by playout timestamp
//! until a startup window of `frames_window` distinct frames exists, then
//! releases the earliest frame once per `sending_delay` cycle: forwarded to
//! the downstream listener if complete, silently discarded otherwise. Once
//! draining starts, packets older than the last drained timestamp are
//! dropped on arrival. The design trades strict playout timing for bounded
//! buffer growth: exactly one frame leaves per cycle as long as the pacer
//! runs.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};
use parking_lot::{Condvar, Mutex};

use crate::codec::NalKind;
use crate::error::ErrorInt;
use crate::rtp::ReceivedPacket;
use crate::{Error, PacketListener, ParticipantInfo, SessionContext};

/// One frame under reconstruction: every packet sharing a playout timestamp.
///
/// Created when the first packet of a new timestamp arrives, merged into by
/// later packets, and destroyed by the pacer after at most one drain cycle
/// as the earliest entry.
pub struct Frame {
    playout_timestamp: u64,
    rtp_timestamp: u32,
    packets: Vec<ReceivedPacket>,

    /// Sequence number of the first packet *observed*, not necessarily the
    /// lowest; later packets are tracked as wrapping offsets from it.
    first_seq: u16,
    min_rel: i32,
    max_rel: i32,

    has_start: bool,
    has_end: bool,
}

impl Frame {
    fn new(playout_timestamp: u64, packet: ReceivedPacket) -> Self {
        let kind = NalKind::classify(packet.payload());
        Frame {
            playout_timestamp,
            rtp_timestamp: packet.timestamp(),
            first_seq: packet.sequence_number(),
            min_rel: 0,
            max_rel: 0,
            has_start: kind.starts_unit(),
            has_end: kind.ends_unit(),
            packets: vec![packet],
        }
    }

    fn add_packet(&mut self, packet: ReceivedPacket) {
        let kind = NalKind::classify(packet.payload());
        let rel = i32::from(packet.sequence_number().wrapping_sub(self.first_seq) as i16);
        self.min_rel = self.min_rel.min(rel);
        self.max_rel = self.max_rel.max(rel);
        self.has_start = self.has_start || kind.starts_unit();
        self.has_end = self.has_end || kind.ends_unit();
        self.packets.push(packet);
    }

    /// The playout (millisecond-bucket) timestamp keying this frame.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.playout_timestamp
    }

    /// The RTP timestamp of the frame's first observed packet.
    #[inline]
    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Whether the frame can be handed to the depacketizer whole: it has an
    /// access-unit start and end, and no interior sequence gap.
    pub fn is_complete(&self) -> bool {
        let span = (self.max_rel - self.min_rel + 1) as usize;
        self.has_start && self.has_end && span == self.packets.len()
    }

    /// Consumes the frame, returning its packets in sequence order.
    fn into_packets(mut self) -> Vec<ReceivedPacket> {
        let first_seq = self.first_seq;
        self.packets
            .sort_by_key(|p| i32::from(p.sequence_number().wrapping_sub(first_seq) as i16));
        self.packets
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.playout_timestamp)
            .field("rtp_timestamp", &self.rtp_timestamp)
            .field("packets", &self.packets.len())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Position of a stream in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// No packet seen yet.
    Idle,
    /// Buffering until the startup window is full; the pacer is not running.
    Waiting,
    /// The pacer is draining one frame per cycle.
    Streaming,
}

/// Immutable jitter buffer configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    debugging: bool,
    frames_window: usize,
    sending_delay: Duration,
    clock_rate: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debugging: false,
            frames_window: 50,
            sending_delay: Duration::from_millis(28),
            clock_rate: 90_000,
        }
    }
}

impl BufferConfig {
    /// Enables verbose per-packet/per-frame diagnostics. Default false.
    pub fn debugging(mut self, debugging: bool) -> Self {
        self.debugging = debugging;
        self
    }

    /// Number of distinct frames to buffer before playback starts.
    /// Default 50.
    pub fn frames_window(mut self, frames_window: usize) -> Self {
        self.frames_window = frames_window;
        self
    }

    /// Target length of one pacer cycle. Default 28 ms.
    pub fn sending_delay(mut self, sending_delay: Duration) -> Self {
        self.sending_delay = sending_delay;
        self
    }

    /// The stream clock rate in Hz; must be a non-zero multiple of 1000.
    /// Default 90 000 (the H.264 video clock).
    pub fn clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }
}

/// Counter snapshot; see [`JitterBuffer::stats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames removed from the buffer, sent or not.
    pub frames_drained: u64,
    /// Frames forwarded downstream because they were complete.
    pub frames_sent: u64,
    /// Pacer cycles run.
    pub cycles: u64,
    /// Cycles whose drain work consumed the whole period.
    pub overruns: u64,
    /// Packets dropped for arriving below the watermark.
    pub late_drops: u64,
}

#[derive(Default)]
struct Counters {
    frames_drained: AtomicU64,
    frames_sent: AtomicU64,
    cycles: AtomicU64,
    overruns: AtomicU64,
    late_drops: AtomicU64,
}

struct StateInner {
    state: StreamState,
    session: Option<SessionContext>,
    participant: Option<ParticipantInfo>,
}

struct Inner<L> {
    config: BufferConfig,
    ticks_per_ms: u32,

    /// Frames ordered by playout timestamp. Insert/merge on the ingest path,
    /// take-minimum on the pacer path; each holds the lock only briefly, so
    /// the pacer can never observe a frame mid-merge.
    frames: Mutex<BTreeMap<u64, Frame>>,

    state: Mutex<StateInner>,

    /// Playout timestamp of the most recently drained frame, sent or
    /// discarded. Non-decreasing once streaming.
    last_timestamp: AtomicU64,

    shutdown: Mutex<bool>,
    shutdown_cond: Condvar,

    downstream: Mutex<L>,
    pacer: Mutex<Option<thread::JoinHandle<()>>>,
    counters: Counters,
}

impl<L> Inner<L> {
    /// Sleeps up to `timeout`, returning early (true) on shutdown.
    fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut shutdown = self.shutdown.lock();
        while !*shutdown {
            if self
                .shutdown_cond
                .wait_until(&mut shutdown, deadline)
                .timed_out()
            {
                break;
            }
        }
        *shutdown
    }
}

/// A [`PacketListener`] which absorbs network jitter before its downstream
/// listener sees any data.
///
/// Ingest is synchronous and non-blocking: each call locates or creates the
/// [`Frame`] for the packet's playout timestamp and returns. The first packet
/// records the stream's session and participant identity; when
/// `frames_window` distinct frames have accumulated, a pacer thread starts
/// and runs until [`JitterBuffer::stop`] (or drop).
///
/// Frames are drained in strictly non-decreasing timestamp order. Packets may
/// be processed in any arrival order; they merge into the right frame as long
/// as they beat the pacer to it.
pub struct JitterBuffer<L: PacketListener + Send + 'static> {
    inner: Arc<Inner<L>>,
}

impl<L: PacketListener + Send + 'static> JitterBuffer<L> {
    /// Creates a buffer draining into `downstream`, typically an
    /// [`crate::codec::h264::Depacketizer`].
    pub fn new(downstream: L, config: BufferConfig) -> Result<Self, Error> {
        if config.clock_rate == 0 || config.clock_rate % 1000 != 0 {
            bail!(ErrorInt::InvalidArgument(format!(
                "clock rate {} must be a non-zero multiple of 1000",
                config.clock_rate
            )));
        }
        if config.frames_window == 0 {
            bail!(ErrorInt::InvalidArgument(
                "frames window must be at least 1".to_owned()
            ));
        }
        if config.sending_delay.is_zero() {
            bail!(ErrorInt::InvalidArgument(
                "sending delay must be non-zero".to_owned()
            ));
        }
        info!("using jitter buffer with frames window {}", config.frames_window);
        let ticks_per_ms = config.clock_rate / 1000;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ticks_per_ms,
                frames: Mutex::new(BTreeMap::new()),
                state: Mutex::new(StateInner {
                    state: StreamState::Idle,
                    session: None,
                    participant: None,
                }),
                last_timestamp: AtomicU64::new(0),
                shutdown: Mutex::new(false),
                shutdown_cond: Condvar::new(),
                downstream: Mutex::new(downstream),
                pacer: Mutex::new(None),
                counters: Counters::default(),
            }),
        })
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.lock().state
    }

    /// Playout timestamp of the most recently drained frame; 0 before any
    /// drain.
    pub fn last_timestamp(&self) -> u64 {
        self.inner.last_timestamp.load(Ordering::Acquire)
    }

    /// Number of frames currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.frames.lock().len()
    }

    pub fn stats(&self) -> Stats {
        let c = &self.inner.counters;
        Stats {
            frames_drained: c.frames_drained.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            cycles: c.cycles.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
            late_drops: c.late_drops.load(Ordering::Relaxed),
        }
    }

    /// Stops the pacer after its current cycle and waits for it to exit.
    /// Idempotent; no new cycles start once this has been called.
    pub fn stop(&self) -> Result<(), Error> {
        {
            let mut shutdown = self.inner.shutdown.lock();
            *shutdown = true;
            self.inner.shutdown_cond.notify_all();
        }
        let handle = self.inner.pacer.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| wrap!(ErrorInt::Internal("pacer thread panicked".to_owned())))?;
        }
        Ok(())
    }

    fn on_packet(
        &self,
        session: &SessionContext,
        participant: &ParticipantInfo,
        packet: ReceivedPacket,
    ) {
        let inner = &*self.inner;
        if inner.config.debugging {
            trace!(
                "packet arriving: seq {:04x} rtp timestamp {}",
                packet.sequence_number(),
                packet.timestamp(),
            );
        }
        let timestamp = packet.playout_timestamp(inner.ticks_per_ms);

        let late = {
            let mut state = inner.state.lock();
            if state.state == StreamState::Idle {
                state.session = Some(*session);
                state.participant = Some(participant.clone());
                inner.last_timestamp.store(timestamp, Ordering::Release);
                state.state = StreamState::Waiting;
                info!("first packet from {participant} on {session}; buffering");
            }
            state.state == StreamState::Streaming
                && timestamp < inner.last_timestamp.load(Ordering::Acquire)
        };
        if late {
            inner.counters.late_drops.fetch_add(1, Ordering::Relaxed);
            if inner.config.debugging {
                debug!(
                    "discarded packet with timestamp {timestamp}, buffer size: {}",
                    inner.frames.lock().len(),
                );
            }
            return;
        }

        let buffered = {
            let mut frames = inner.frames.lock();
            match frames.entry(timestamp) {
                Entry::Occupied(mut e) => e.get_mut().add_packet(packet),
                Entry::Vacant(e) => {
                    e.insert(Frame::new(timestamp, packet));
                }
            }
            frames.len()
        };

        let start_pacer = {
            let mut state = inner.state.lock();
            if state.state == StreamState::Waiting && buffered >= inner.config.frames_window {
                state.state = StreamState::Streaming;
                true
            } else {
                false
            }
        };
        if start_pacer {
            info!("{buffered} frames buffered; start consuming");
            self.start_pacer();
        }
    }

    fn start_pacer(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("pacer".to_owned())
            .spawn(move || pacer_loop(&inner));
        match spawned {
            Ok(handle) => *self.inner.pacer.lock() = Some(handle),
            Err(e) => {
                // Back to Waiting so a later packet retries the transition.
                error!("unable to start pacer thread: {e}");
                self.inner.state.lock().state = StreamState::Waiting;
            }
        }
    }
}

impl<L: PacketListener + Send + 'static> PacketListener for JitterBuffer<L> {
    fn data_packet_received(
        &mut self,
        session: &SessionContext,
        participant: &ParticipantInfo,
        packet: ReceivedPacket,
    ) {
        self.on_packet(session, participant, packet);
    }
}

impl<L: PacketListener + Send + 'static> Drop for JitterBuffer<L> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn pacer_loop<L: PacketListener>(inner: &Inner<L>) {
    let period = inner.config.sending_delay;
    loop {
        // The shutdown flag is observed once per cycle; an in-progress drain
        // is never interrupted.
        if *inner.shutdown.lock() {
            break;
        }
        let cycle_start = Instant::now();
        drain_one(inner);
        inner.counters.cycles.fetch_add(1, Ordering::Relaxed);
        let remaining = period.saturating_sub(cycle_start.elapsed());
        if remaining.is_zero() {
            // Overrun: start the next cycle immediately, without catch-up.
            inner.counters.overruns.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if inner.wait_for_shutdown(remaining) {
            break;
        }
    }
    debug!("pacer loop exited");
}

/// One drain step: takes the earliest frame, forwards it if complete,
/// discards it otherwise, and advances the watermark either way.
fn drain_one<L: PacketListener>(inner: &Inner<L>) {
    let Some((timestamp, frame)) = inner.frames.lock().pop_first() else {
        return;
    };
    let drained = inner.counters.frames_drained.fetch_add(1, Ordering::Relaxed) + 1;
    if frame.is_complete() {
        let (session, participant) = {
            let state = inner.state.lock();
            (
                state
                    .session
                    .expect("session is recorded before any frame is buffered"),
                state
                    .participant
                    .clone()
                    .expect("participant is recorded before any frame is buffered"),
            )
        };
        let mut downstream = inner.downstream.lock();
        for packet in frame.into_packets() {
            downstream.data_packet_received(&session, &participant, packet);
        }
        inner.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    } else if inner.config.debugging {
        debug!("discarded frame at {timestamp}; it was not completed");
    }
    inner.last_timestamp.store(timestamp, Ordering::Release);

    if inner.config.debugging && drained % 100 == 0 {
        let sent = inner.counters.frames_sent.load(Ordering::Relaxed);
        let overruns = inner.counters.overruns.load(Ordering::Relaxed);
        let cycles = inner.counters.cycles.load(Ordering::Relaxed);
        info!(
            "total frames: {drained} - sent ones: {sent} - ratio: {:.3}; \
             total cycles: {cycles} - overrun ones: {overruns}",
            sent as f64 / drained as f64,
        );
    }
}
