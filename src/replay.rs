//! `stringhub replay` — synthetic end-to-end run with a JSON report.
//!
//! Spawns one producer thread per configured module. Each producer emits a
//! monotone hit stream plus periodic monitoring, supernova and
//! time-calibration records; the GPS source is a fixed snapshot consistent
//! with the simulated cable geometry, so the clock translation converges to
//! the identity map and can be checked in the report. When every producer
//! has finished, the hub is stopped (end-of-stream on every channel of
//! every engine) and per-engine snapshots are collected.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use hub_core::{
    build_raw, ConsumerError, DaqBuffer, FixedGps, GpsInfo, HubConsumers, HubDispatch,
    RunLevel, SorterError, SorterSnapshot, StreamConsumer, StreamKind, TcalMeasurement,
    TcalSnapshot,
};

use crate::config::HubConfig;

const FMT_HIT: u32 = 2;
const FMT_MONI: u32 = 3;
const FMT_TCAL: u32 = 4;
const FMT_SN: u32 = 5;

// Simulated geometry: DOM clock equals UTC, the DOR clock leads the module
// by 2.5 µs, one-way cable delay 2 µs, 100 ns module round trip.
const DOR_LEAD: i64 = 25_000;
const CABLE: u64 = 20_000;
const BASE_TIMESTAMP: i64 = 1_000_000;

#[derive(Default)]
struct StreamTally {
    records: AtomicU64,
    bytes: AtomicU64,
    order_violations: AtomicU64,
    eos_count: AtomicU64,
    last_timestamp: AtomicI64,
}

#[derive(Debug, Serialize)]
struct StreamReport {
    kind: &'static str,
    records: u64,
    bytes: u64,
    order_violations: u64,
    eos_count: u64,
    last_timestamp: i64,
}

impl StreamTally {
    fn report(&self, kind: &'static str) -> StreamReport {
        StreamReport {
            kind,
            records: self.records.load(Relaxed),
            bytes: self.bytes.load(Relaxed),
            order_violations: self.order_violations.load(Relaxed),
            eos_count: self.eos_count.load(Relaxed),
            last_timestamp: self.last_timestamp.load(Relaxed),
        }
    }
}

/// Downstream consumer that parses each DAQ record and verifies the merged
/// stream never goes backwards in time.
struct OrderedTally {
    tally: Arc<StreamTally>,
    last: i64,
}

impl OrderedTally {
    fn new(tally: Arc<StreamTally>) -> Self {
        Self { tally, last: i64::MIN }
    }
}

impl StreamConsumer for OrderedTally {
    fn consume(&mut self, bytes: Vec<u8>) -> Result<(), ConsumerError> {
        let buf = DaqBuffer::parse(bytes)?;
        if buf.timestamp() < self.last {
            self.tally.order_violations.fetch_add(1, Relaxed);
        }
        self.last = buf.timestamp();
        self.tally.last_timestamp.store(self.last, Relaxed);
        self.tally.records.fetch_add(1, Relaxed);
        self.tally.bytes.fetch_add(buf.len() as u64, Relaxed);
        Ok(())
    }

    fn end_of_stream(&mut self, _mbid: u64) -> Result<(), ConsumerError> {
        self.tally.eos_count.fetch_add(1, Relaxed);
        Ok(())
    }
}

/// Counts formatted calibration records (not DAQ-framed, so no ordering
/// check).
struct CountingTally {
    tally: Arc<StreamTally>,
}

impl StreamConsumer for CountingTally {
    fn consume(&mut self, bytes: Vec<u8>) -> Result<(), ConsumerError> {
        self.tally.records.fetch_add(1, Relaxed);
        self.tally.bytes.fetch_add(bytes.len() as u64, Relaxed);
        Ok(())
    }

    fn end_of_stream(&mut self, _mbid: u64) -> Result<(), ConsumerError> {
        self.tally.eos_count.fetch_add(1, Relaxed);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub started_at: String,
    pub duration_secs: f64,
    pub hub_id: u64,
    pub channels: usize,
    /// Collector-side calibration prescale in effect for this hub.
    pub tcal_prescale: u32,
    pub translation_ready: bool,
    /// UTC of DOM tick 1 000 000 under the converged map; equals
    /// 250 000 000 in the identity geometry.
    pub sample_translation: Option<i64>,
    pub engines: Vec<SorterSnapshot>,
    pub tcal: Option<TcalSnapshot>,
    pub streams: Vec<StreamReport>,
}

fn tcal_record(mbid: u64, dom_mid: i64) -> Vec<u8> {
    let dor_mid = (dom_mid + DOR_LEAD) as u64;
    let dom_mid_u = dom_mid as u64;
    let meas = TcalMeasurement {
        dor_tx: dor_mid - CABLE - 500,
        dor_rx: dor_mid + CABLE + 500,
        dom_rx: dom_mid_u - 500,
        dom_tx: dom_mid_u + 500,
    };
    build_raw(mbid, FMT_TCAL, dom_mid, &meas.encode())
}

pub fn run(config: &HubConfig, output: Option<PathBuf>) -> Result<()> {
    let channels = config.parsed_channels()?;
    if channels.is_empty() {
        anyhow::bail!(
            "no channels configured — run `stringhub init > hub.toml` to create a config"
        );
    }

    eprintln!(
        "stringhub replay — {} channel(s) × {} hits...",
        channels.len(),
        config.replay.hits_per_channel
    );

    let started_at = chrono::Utc::now().to_rfc3339();

    // GPS snapshot consistent with the geometry: offset −DOR_LEAD.
    let gps = FixedGps(Some(GpsInfo::new(1, 0, 0, 0, b' ', (DOR_LEAD / 500) as u64)));
    let mut hub = HubDispatch::new(config.hub_id, config.options(), Box::new(gps));
    hub.configure(&channels)?;

    let hit_tally = Arc::new(StreamTally::default());
    let moni_tally = Arc::new(StreamTally::default());
    let sn_tally = Arc::new(StreamTally::default());
    let fmt_tally = Arc::new(StreamTally::default());

    hub.start_run(HubConsumers {
        hit: Box::new(OrderedTally::new(hit_tally.clone())),
        moni: Box::new(OrderedTally::new(moni_tally.clone())),
        sn: Box::new(OrderedTally::new(sn_tally.clone())),
        tcal_out: Some(Box::new(CountingTally { tally: fmt_tally.clone() })),
    })?;
    hub.set_run_level(RunLevel::Running);

    let start = Instant::now();
    let mut producers = Vec::new();
    for (i, &mbid) in channels.iter().enumerate() {
        let hit_in = hub.input(StreamKind::Hit)?;
        let moni_in = hub.input(StreamKind::Moni)?;
        let sn_in = hub.input(StreamKind::Sn)?;
        let tcal_in = hub.input(StreamKind::Tcal)?;
        let cfg = config.replay.clone();
        // Stagger channels so the merged streams genuinely interleave.
        let phase = BASE_TIMESTAMP + i as i64 * 1_000;

        producers.push(
            std::thread::Builder::new()
                .name(format!("module-{mbid:x}"))
                .spawn(move || -> Result<(), SorterError> {
                    for n in 0..cfg.hits_per_channel {
                        let ts = phase + n as i64 * cfg.hit_spacing;
                        hit_in.consume(build_raw(mbid, FMT_HIT, ts, &[0u8; 22]))?;
                        if n % cfg.tcal_every == 0 {
                            tcal_in.consume(tcal_record(mbid, ts))?;
                        }
                        if n % cfg.moni_every == 0 {
                            moni_in.consume(build_raw(mbid, FMT_MONI, ts, b"replay"))?;
                        }
                        if n % cfg.sn_every == 0 {
                            sn_in.consume(build_raw(mbid, FMT_SN, ts, &[0u8; 64]))?;
                        }
                    }
                    Ok(())
                })?,
        );
    }

    for p in producers {
        p.join().map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    }
    hub.stop()?;
    hub.set_run_level(RunLevel::Stopped);
    tracing::info!(
        "replay drained in {:.2}s, translation ready: {}",
        start.elapsed().as_secs_f64(),
        hub.translator().ready()
    );

    let report = ReplayReport {
        started_at,
        duration_secs: start.elapsed().as_secs_f64(),
        hub_id: config.hub_id,
        channels: channels.len(),
        tcal_prescale: hub.options().tcal_prescale,
        translation_ready: hub.translator().ready(),
        sample_translation: hub.translator().dom_to_utc(1_000_000),
        engines: hub.snapshots(),
        tcal: hub.tcal_snapshot(),
        streams: vec![
            hit_tally.report("hit"),
            moni_tally.report("moni"),
            sn_tally.report("sn"),
            fmt_tally.report("tcal-formatted"),
        ],
    };

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(&path, &json)
                .with_context(|| format!("failed to write report: {}", path.display()))?;
            eprintln!("report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
