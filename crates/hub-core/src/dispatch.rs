//! Stream processor dispatch — one sort engine per stream kind, plus the
//! run lifecycle that ties them together.
//!
//! The hub owns four engines (hit, monitoring, supernova, time
//! calibration). Channels are registered on all of them at configure time;
//! `start_run` wires the downstream consumers — the TCAL engine always
//! feeds the [`TcalProcessor`] — and spawns every worker. The engines run
//! in parallel with no cross-kind ordering guarantee.
//!
//! Run-level transitions arrive from run control and are published through
//! a shared cell the TCAL processor polls; only RUNNING opens its dispatch
//! path. Stopping the hub enqueues an end-of-stream sentinel for every
//! channel on every engine and reaps the workers.

use std::sync::atomic::{AtomicU8, Ordering::Relaxed};
use std::sync::Arc;
use tracing::{info, warn};

use crate::consumer::StreamConsumer;
use crate::gps::GpsSource;
use crate::rapcal::{RapCal, UtcTranslator};
use crate::sorter::{ChannelSorter, SorterError, SorterInput, DEFAULT_QUEUE_BOUND};
use crate::stats::SorterSnapshot;
use crate::tcal::{TcalProcessor, TcalSnapshot, TcalStats};

/// Run-control state as signalled from outside. Only RUNNING is
/// distinguished by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLevel {
    Idle,
    Configuring,
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
    Zombie,
}

impl RunLevel {
    fn as_u8(self) -> u8 {
        match self {
            RunLevel::Idle => 0,
            RunLevel::Configuring => 1,
            RunLevel::Configured => 2,
            RunLevel::Starting => 3,
            RunLevel::Running => 4,
            RunLevel::Stopping => 5,
            RunLevel::Stopped => 6,
            RunLevel::Zombie => 7,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunLevel::Idle,
            1 => RunLevel::Configuring,
            2 => RunLevel::Configured,
            3 => RunLevel::Starting,
            4 => RunLevel::Running,
            5 => RunLevel::Stopping,
            6 => RunLevel::Stopped,
            _ => RunLevel::Zombie,
        }
    }
}

/// Run level shared between run control and the worker-side processors.
#[derive(Clone)]
pub struct SharedRunLevel(Arc<AtomicU8>);

impl SharedRunLevel {
    pub fn new(level: RunLevel) -> Self {
        Self(Arc::new(AtomicU8::new(level.as_u8())))
    }

    pub fn set(&self, level: RunLevel) {
        self.0.store(level.as_u8(), Relaxed);
    }

    pub fn get(&self) -> RunLevel {
        RunLevel::from_u8(self.0.load(Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Hit,
    Moni,
    Sn,
    Tcal,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] =
        [StreamKind::Hit, StreamKind::Moni, StreamKind::Sn, StreamKind::Tcal];

    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Hit => "hit",
            StreamKind::Moni => "moni",
            StreamKind::Sn => "sn",
            StreamKind::Tcal => "tcal",
        }
    }
}

/// Hit-spool parameters handed through to the spooling collaborator.
#[derive(Debug, Clone)]
pub struct HitSpoolOptions {
    pub dir: String,
    pub interval_ns: u64,
    pub num_files: u32,
}

/// Options consumed by the dispatch layer. Collector-facing values
/// (`tcal_prescale`, `enable_intervals`, `sn_distance`) are recorded here
/// and surfaced to the producer side; they do not change the merge itself.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub queue_bound: usize,
    pub tcal_prescale: u32,
    pub enable_intervals: bool,
    pub hit_spool: Option<HitSpoolOptions>,
    pub sn_distance: Option<f64>,
    pub use_priority_sort: bool,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_bound: DEFAULT_QUEUE_BOUND,
            tcal_prescale: 10,
            enable_intervals: false,
            hit_spool: None,
            sn_distance: None,
            use_priority_sort: false,
        }
    }
}

/// Downstream consumers wired at run start. The formatted-calibration
/// consumer is optional; without one the TCAL processor only drives RAPCal.
pub struct HubConsumers {
    pub hit: Box<dyn StreamConsumer>,
    pub moni: Box<dyn StreamConsumer>,
    pub sn: Box<dyn StreamConsumer>,
    pub tcal_out: Option<Box<dyn StreamConsumer>>,
}

pub struct HubDispatch {
    hub_id: u64,
    options: HubOptions,
    hit: ChannelSorter,
    moni: ChannelSorter,
    sn: ChannelSorter,
    tcal: ChannelSorter,
    /// Present until `start_run` hands it to the TCAL processor.
    rapcal: Option<RapCal>,
    translator: Arc<UtcTranslator>,
    gps: Option<Box<dyn GpsSource>>,
    tcal_stats: Option<Arc<TcalStats>>,
    run_level: SharedRunLevel,
    channels: Vec<u64>,
}

impl HubDispatch {
    pub fn new(hub_id: u64, options: HubOptions, gps: Box<dyn GpsSource>) -> Self {
        let rapcal = RapCal::new();
        let translator = rapcal.translator();
        let bound = options.queue_bound;
        Self {
            hub_id,
            options,
            hit: ChannelSorter::new("hit", bound),
            moni: ChannelSorter::new("moni", bound),
            sn: ChannelSorter::new("sn", bound),
            tcal: ChannelSorter::new("tcal", bound),
            rapcal: Some(rapcal),
            translator,
            gps: Some(gps),
            tcal_stats: None,
            run_level: SharedRunLevel::new(RunLevel::Idle),
            channels: Vec::new(),
        }
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// Shared clock-translation handle for hit-path consumers.
    pub fn translator(&self) -> Arc<UtcTranslator> {
        self.translator.clone()
    }

    /// Register every channel with every engine. Must complete before
    /// `start_run`.
    pub fn configure(&mut self, channels: &[u64]) -> Result<(), SorterError> {
        if self.options.use_priority_sort {
            info!("priority sort requested; tournament merge is the only implementation");
        }
        for &mbid in channels {
            for sorter in self.sorters_mut() {
                sorter.register(mbid)?;
            }
            self.channels.push(mbid);
        }
        info!("hub configured with {} channel(s)", self.channels.len());
        Ok(())
    }

    /// Wire the downstream consumers and spawn all four workers.
    pub fn start_run(&mut self, consumers: HubConsumers) -> Result<(), SorterError> {
        let rapcal = self.rapcal.take().ok_or(SorterError::AlreadyStarted)?;
        let gps = self.gps.take().ok_or(SorterError::AlreadyStarted)?;
        let processor = TcalProcessor::new(self.hub_id, rapcal, gps, consumers.tcal_out)
            .with_shared_run_level(self.run_level.clone());
        self.tcal_stats = Some(processor.stats());

        self.hit.start(consumers.hit)?;
        self.moni.start(consumers.moni)?;
        self.sn.start(consumers.sn)?;
        self.tcal.start(Box::new(processor))?;
        info!("hub {:#x}: run started on {} channel(s)", self.hub_id, self.channels.len());
        Ok(())
    }

    /// Forward a run-level transition to the worker-side processors.
    pub fn set_run_level(&self, level: RunLevel) {
        info!("run level -> {:?}", level);
        self.run_level.set(level);
    }

    pub fn run_level(&self) -> RunLevel {
        self.run_level.get()
    }

    pub fn input(&self, kind: StreamKind) -> Result<SorterInput, SorterError> {
        self.sorter(kind).input()
    }

    /// Thread-safe enqueue onto the engine for `kind`; blocks on a full
    /// queue.
    pub fn consume(&self, kind: StreamKind, raw: Vec<u8>) -> Result<(), SorterError> {
        self.sorter(kind).consume(raw)
    }

    /// Enqueue end-of-stream for every channel on every engine, then await
    /// all workers. The first failure is reported after every worker has
    /// been reaped.
    pub fn stop(&mut self) -> Result<(), SorterError> {
        for kind in StreamKind::ALL {
            let sorter = self.sorter(kind);
            for &mbid in &self.channels {
                if sorter.end_of_stream(mbid).is_err() {
                    // Worker already gone; its error surfaces in join below.
                    break;
                }
            }
        }
        let mut first_err = None;
        for sorter in self.sorters_mut() {
            if let Err(e) = sorter.join() {
                warn!("engine worker failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn snapshots(&self) -> Vec<SorterSnapshot> {
        StreamKind::ALL.iter().map(|&k| self.sorter(k).snapshot()).collect()
    }

    pub fn tcal_snapshot(&self) -> Option<TcalSnapshot> {
        self.tcal_stats.as_ref().map(|s| s.snapshot())
    }

    fn sorter(&self, kind: StreamKind) -> &ChannelSorter {
        match kind {
            StreamKind::Hit => &self.hit,
            StreamKind::Moni => &self.moni,
            StreamKind::Sn => &self.sn,
            StreamKind::Tcal => &self.tcal,
        }
    }

    fn sorters_mut(&mut self) -> [&mut ChannelSorter; 4] {
        [&mut self.hit, &mut self.moni, &mut self.sn, &mut self.tcal]
    }
}
