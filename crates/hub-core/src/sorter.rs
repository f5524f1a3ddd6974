//! Channel sort engine — N producers, one globally time-ordered consumer.
//!
//! Producers enqueue raw buffers on a bounded channel; a single worker
//! thread projects them, feeds the tournament tree, and forwards every
//! popped minimum to the downstream consumer. The queue bound is the only
//! producer-visible blocking point: when the worker falls behind, `consume`
//! blocks rather than dropping.
//!
//! The tree yields only when every registered channel has at least one
//! buffered value, so one silent channel stalls the whole kind. That is by
//! design — global time ordering cannot be traded per channel — and is
//! relieved by every channel eventually emitting data or its end-of-stream
//! sentinel.
//!
//! Shutdown is cooperative: there is no cancel. Once the worker has popped
//! a sentinel from every channel it seals the downstream consumer and
//! exits. Any error inside the loop (malformed header, consumer failure)
//! aborts the worker; the error surfaces on `join`.

use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::buffer::{eos_sentinel, BufferError, DaqBuffer};
use crate::consumer::{ConsumerError, StreamConsumer};
use crate::stats::{now_ns, SorterSnapshot, SorterStats};
use crate::tree::TournamentTree;

pub const DEFAULT_QUEUE_BOUND: usize = 100_000;

#[derive(Debug, Error)]
pub enum SorterError {
    #[error("buffer parse failed: {0}")]
    Buffer(#[from] BufferError),
    #[error("downstream consumer failed: {0}")]
    Consumer(#[from] ConsumerError),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("cannot register channel {mbid:#018x} after start")]
    RegisterAfterStart { mbid: u64 },
    #[error("channel {mbid:#018x} registered twice")]
    DuplicateChannel { mbid: u64 },
    #[error("no channels registered")]
    NoChannels,
    #[error("engine not started")]
    NotStarted,
    #[error("engine worker is gone")]
    WorkerGone,
    #[error("engine worker panicked")]
    WorkerPanicked,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Cheap clonable producer handle. `consume` blocks while the engine's
/// bounded queue is full.
#[derive(Clone)]
pub struct SorterInput {
    tx: Sender<Vec<u8>>,
}

impl SorterInput {
    pub fn consume(&self, raw: Vec<u8>) -> Result<(), SorterError> {
        self.tx.send(raw).map_err(|_| SorterError::WorkerGone)
    }

    /// Enqueue the end-of-stream sentinel for `mbid`.
    pub fn end_of_stream(&self, mbid: u64) -> Result<(), SorterError> {
        self.consume(eos_sentinel(mbid))
    }
}

pub struct ChannelSorter {
    kind: &'static str,
    queue_bound: usize,
    /// Registration order assigns leaf indices.
    channels: Vec<u64>,
    stats: Arc<SorterStats>,
    tx: Option<Sender<Vec<u8>>>,
    handle: Option<JoinHandle<Result<(), SorterError>>>,
}

impl ChannelSorter {
    pub fn new(kind: &'static str, queue_bound: usize) -> Self {
        Self {
            kind,
            queue_bound,
            channels: Vec::new(),
            stats: SorterStats::new(kind),
            tx: None,
            handle: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Register a producer channel. All registrations must happen before
    /// `start`.
    pub fn register(&mut self, mbid: u64) -> Result<(), SorterError> {
        if self.handle.is_some() {
            return Err(SorterError::RegisterAfterStart { mbid });
        }
        if self.channels.contains(&mbid) {
            return Err(SorterError::DuplicateChannel { mbid });
        }
        self.channels.push(mbid);
        Ok(())
    }

    /// Spawn the worker over the registered channels. Rejected after the
    /// first call.
    pub fn start(&mut self, consumer: Box<dyn StreamConsumer>) -> Result<(), SorterError> {
        if self.handle.is_some() {
            return Err(SorterError::AlreadyStarted);
        }
        if self.channels.is_empty() {
            return Err(SorterError::NoChannels);
        }

        let (tx, rx) = crossbeam_channel::bounded(self.queue_bound);
        let channel_map: HashMap<u64, usize> = self
            .channels
            .iter()
            .enumerate()
            .map(|(leaf, &mbid)| (mbid, leaf))
            .collect();
        let tree = TournamentTree::new(self.channels.len());
        let stats = self.stats.clone();

        let handle = std::thread::Builder::new()
            .name(format!("{}-sort", self.kind))
            .spawn(move || run_worker(rx, channel_map, tree, consumer, stats))?;

        info!("{} sort engine started with {} channel(s)", self.kind, self.channels.len());
        self.tx = Some(tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Producer handle for this engine.
    pub fn input(&self) -> Result<SorterInput, SorterError> {
        match &self.tx {
            Some(tx) => Ok(SorterInput { tx: tx.clone() }),
            None => Err(SorterError::NotStarted),
        }
    }

    /// Thread-safe enqueue; blocks while the queue is full.
    pub fn consume(&self, raw: Vec<u8>) -> Result<(), SorterError> {
        self.input()?.consume(raw)
    }

    pub fn end_of_stream(&self, mbid: u64) -> Result<(), SorterError> {
        self.input()?.end_of_stream(mbid)
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> Arc<SorterStats> {
        self.stats.clone()
    }

    pub fn snapshot(&self) -> SorterSnapshot {
        self.stats.snapshot(self.queue_depth())
    }

    /// Await worker termination and surface its fatal error, if any.
    pub fn join(&mut self) -> Result<(), SorterError> {
        let handle = self.handle.take().ok_or(SorterError::NotStarted)?;
        drop(self.tx.take());
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(SorterError::WorkerPanicked),
        }
    }
}

fn run_worker(
    rx: Receiver<Vec<u8>>,
    channels: HashMap<u64, usize>,
    mut tree: TournamentTree,
    mut consumer: Box<dyn StreamConsumer>,
    stats: Arc<SorterStats>,
) -> Result<(), SorterError> {
    let n_leaves = tree.n_leaves();
    let mut eos_count = 0usize;
    let mut last_out = i64::MIN;

    for raw in &rx {
        stats.last_take_wall_ns.store(now_ns(), Relaxed);
        let buf = DaqBuffer::parse(raw)?;
        stats.last_in_timestamp.store(buf.timestamp(), Relaxed);

        let Some(&leaf) = channels.get(&buf.mbid()) else {
            error!(
                "{}: buffer from unregistered channel {:#018x} dropped",
                stats.kind,
                buf.mbid()
            );
            stats.unknown_dropped.fetch_add(1, Relaxed);
            continue;
        };

        if buf.is_eos() {
            stats.eos_seen.fetch_add(1, Relaxed);
        } else {
            stats.records_in.fetch_add(1, Relaxed);
            stats.bytes_in.fetch_add(buf.len() as u64, Relaxed);
        }
        tree.push(leaf, buf);

        while let Some(v) = tree.pop() {
            // Cross-channel regression should be impossible while producers
            // stay per-channel monotone; detect, report, forward anyway.
            if v.timestamp() < last_out {
                warn!(
                    "{}: out-of-order output from {:#018x}: {} < {}",
                    stats.kind,
                    v.mbid(),
                    v.timestamp(),
                    last_out
                );
                stats.out_of_order.fetch_add(1, Relaxed);
            }
            last_out = v.timestamp();
            stats.last_out_timestamp.store(last_out, Relaxed);

            if v.is_eos() {
                eos_count += 1;
                if eos_count == n_leaves {
                    consumer.end_of_stream(v.mbid())?;
                    info!("{}: all channels at end of stream", stats.kind);
                    return Ok(());
                }
            } else {
                stats.records_out.fetch_add(1, Relaxed);
                stats.bytes_out.fetch_add(v.len() as u64, Relaxed);
                consumer.consume(v.into_bytes())?;
            }
        }
    }

    info!("{}: input queue closed before end of stream", stats.kind);
    Ok(())
}
