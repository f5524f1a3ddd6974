//! TCAL processor — the consumer on the time-calibration stream.
//!
//! Every merged TCAL record drives [`RapCal`]; in the running dispatch state
//! each record is additionally reformatted and handed to the secondary
//! consumer. The two concerns move through two independent mode slots:
//!
//! * processing mode starts `Primordial` and becomes `Established` after the
//!   second accepted RAPCal update, never reverting. Until then the
//!   processor reports [`UTC_UNDEFINED`] instead of a translated time.
//! * dispatch mode follows the externally signalled run level: `Running`
//!   while the run level is RUNNING, `Null` otherwise. In `Null` nothing
//!   leaves the processor.
//!
//! RAPCal rejections are expected occasionally and are logged and
//! suppressed; they never take the pipeline down.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tracing::warn;

use crate::buffer::DaqBuffer;
use crate::consumer::{ConsumerError, StreamConsumer};
use crate::dispatch::{RunLevel, SharedRunLevel};
use crate::gps::{GpsInfo, GpsSource, GPS_PLACEHOLDER};
use crate::rapcal::{RapCal, TcalMeasurement, UtcTranslator, DOM_TICK_UTC};

/// Format id of the dispatched time-calibration record.
pub const MAGIC_TCAL_FMTID: i32 = 202;

/// Returned while the clock translation is still undefined.
pub const UTC_UNDEFINED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Primordial { valid_updates: u8 },
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Null,
    Running,
}

/// Atomic observables of one TCAL processor.
pub struct TcalStats {
    pub processed: AtomicU64,
    pub dispatched: AtomicU64,
    /// RAPCal rejections, logged and suppressed.
    pub rapcal_errors: AtomicU64,
    /// Records processed with no GPS snapshot available.
    pub missing_gps: AtomicU64,
    /// Records dispatched carrying the epoch-zero GPS placeholder.
    pub missing_gps_dispatched: AtomicU64,
    pub established: AtomicBool,
    pub last_utc: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TcalSnapshot {
    pub processed: u64,
    pub dispatched: u64,
    pub rapcal_errors: u64,
    pub missing_gps: u64,
    pub missing_gps_dispatched: u64,
    pub established: bool,
    pub last_utc: i64,
}

impl TcalStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processed: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            rapcal_errors: AtomicU64::new(0),
            missing_gps: AtomicU64::new(0),
            missing_gps_dispatched: AtomicU64::new(0),
            established: AtomicBool::new(false),
            last_utc: AtomicI64::new(UTC_UNDEFINED),
        })
    }

    pub fn snapshot(&self) -> TcalSnapshot {
        TcalSnapshot {
            processed: self.processed.load(Relaxed),
            dispatched: self.dispatched.load(Relaxed),
            rapcal_errors: self.rapcal_errors.load(Relaxed),
            missing_gps: self.missing_gps.load(Relaxed),
            missing_gps_dispatched: self.missing_gps_dispatched.load(Relaxed),
            established: self.established.load(Relaxed),
            last_utc: self.last_utc.load(Relaxed),
        }
    }
}

pub struct TcalProcessor {
    /// The hub's own source id, used to seal the formatted stream.
    mbid: u64,
    rapcal: RapCal,
    gps: Box<dyn GpsSource>,
    consumer: Option<Box<dyn StreamConsumer>>,
    /// Run-level cell written by the dispatch layer; polled before each
    /// record when attached.
    shared_run_level: Option<SharedRunLevel>,
    processing: ProcessingMode,
    dispatch: DispatchMode,
    stats: Arc<TcalStats>,
}

impl TcalProcessor {
    pub fn new(
        mbid: u64,
        rapcal: RapCal,
        gps: Box<dyn GpsSource>,
        consumer: Option<Box<dyn StreamConsumer>>,
    ) -> Self {
        Self {
            mbid,
            rapcal,
            gps,
            consumer,
            shared_run_level: None,
            processing: ProcessingMode::Primordial { valid_updates: 0 },
            dispatch: DispatchMode::Null,
            stats: TcalStats::new(),
        }
    }

    pub fn with_shared_run_level(mut self, cell: SharedRunLevel) -> Self {
        self.shared_run_level = Some(cell);
        self
    }

    pub fn stats(&self) -> Arc<TcalStats> {
        self.stats.clone()
    }

    pub fn translator(&self) -> Arc<UtcTranslator> {
        self.rapcal.translator()
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.is_some()
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.processing
    }

    /// Externally signalled run-level transition. Only RUNNING opens the
    /// dispatch path.
    pub fn run_level(&mut self, level: RunLevel) {
        self.dispatch = if level == RunLevel::Running {
            DispatchMode::Running
        } else {
            DispatchMode::Null
        };
    }

    /// Process one merged TCAL record. Returns the translated UTC of the
    /// module's transmit stamp, or [`UTC_UNDEFINED`] while primordial.
    ///
    /// The first defined UTC is computed right after the second accepted
    /// sample and is returned for continuity; downstream users should not
    /// treat it as converged yet.
    pub fn process(&mut self, raw: Vec<u8>) -> Result<i64, ConsumerError> {
        if let Some(cell) = &self.shared_run_level {
            let level = cell.get();
            self.run_level(level);
        }

        let buf = DaqBuffer::parse(raw)?;
        let tcal = TcalMeasurement::parse(buf.payload())?;
        let gps = self.gps.snapshot();
        if gps.is_none() {
            self.stats.missing_gps.fetch_add(1, Relaxed);
        }

        let dom_ticks = tcal.dom_tx / DOM_TICK_UTC as u64;

        let utc = match self.processing {
            ProcessingMode::Primordial { valid_updates } => match &gps {
                None => UTC_UNDEFINED,
                Some(g) => match self.rapcal.update(&tcal, g.offset) {
                    Ok(()) => {
                        let n = valid_updates + 1;
                        if n > 1 {
                            self.processing = ProcessingMode::Established;
                            self.stats.established.store(true, Relaxed);
                            self.rapcal.dom_to_utc(dom_ticks).unwrap_or(UTC_UNDEFINED)
                        } else {
                            self.processing = ProcessingMode::Primordial { valid_updates: n };
                            UTC_UNDEFINED
                        }
                    }
                    Err(e) => {
                        warn!("rapcal update from {:#018x} rejected: {}", buf.mbid(), e);
                        self.stats.rapcal_errors.fetch_add(1, Relaxed);
                        UTC_UNDEFINED
                    }
                },
            },
            ProcessingMode::Established => {
                if let Some(g) = &gps {
                    if let Err(e) = self.rapcal.update(&tcal, g.offset) {
                        warn!("rapcal update from {:#018x} rejected: {}", buf.mbid(), e);
                        self.stats.rapcal_errors.fetch_add(1, Relaxed);
                    }
                }
                self.rapcal.dom_to_utc(dom_ticks).unwrap_or(UTC_UNDEFINED)
            }
        };

        if self.dispatch == DispatchMode::Running {
            if let Some(consumer) = self.consumer.as_mut() {
                if gps.is_none() {
                    self.stats.missing_gps_dispatched.fetch_add(1, Relaxed);
                }
                let record = format_record(buf.mbid(), dom_ticks, buf.payload(), gps.as_ref());
                consumer.consume(record)?;
                self.stats.dispatched.fetch_add(1, Relaxed);
            }
        }

        self.stats.processed.fetch_add(1, Relaxed);
        self.stats.last_utc.store(utc, Relaxed);
        Ok(utc)
    }

    /// Seal the formatted stream with the processor's own sentinel.
    pub fn eos(&mut self) -> Result<(), ConsumerError> {
        match self.consumer.as_mut() {
            Some(c) => c.end_of_stream(self.mbid),
            None => Ok(()),
        }
    }
}

impl StreamConsumer for TcalProcessor {
    fn consume(&mut self, bytes: Vec<u8>) -> Result<(), ConsumerError> {
        self.process(bytes).map(|_| ())
    }

    fn end_of_stream(&mut self, _mbid: u64) -> Result<(), ConsumerError> {
        self.eos()
    }
}

/// Assemble the dispatched record: total length (patched last), format id,
/// source mbid, a zero pad, the module tick count, the measurement block
/// verbatim, and the 22-byte GPS block or its epoch-zero placeholder.
fn format_record(
    mbid: u64,
    dom_ticks: u64,
    tcal_block: &[u8],
    gps: Option<&GpsInfo>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + tcal_block.len() + GPS_PLACEHOLDER.len());
    out.extend_from_slice(&0i32.to_be_bytes());
    out.extend_from_slice(&MAGIC_TCAL_FMTID.to_be_bytes());
    out.extend_from_slice(&mbid.to_be_bytes());
    out.extend_from_slice(&0i64.to_be_bytes());
    out.extend_from_slice(&(dom_ticks as i64).to_be_bytes());
    out.extend_from_slice(tcal_block);
    match gps {
        Some(g) => out.extend_from_slice(&g.wire),
        None => out.extend_from_slice(&GPS_PLACEHOLDER),
    }
    let len = out.len() as i32;
    out[0..4].copy_from_slice(&len.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::build_raw;
    use crate::gps::FixedGps;
    use crate::rapcal::TCAL_BLOCK_LEN;
    use std::sync::Mutex;

    const TCAL_FMT: u32 = 4;
    const DOM_A: u64 = 0x0001_0203_0405_0607;

    // Same geometry as the rapcal tests: DOM clock == UTC.
    const DOR_LEAD: i64 = 25_000;
    const CABLE: u64 = 20_000;

    fn tcal_raw(dom_mid: u64) -> Vec<u8> {
        let dor_mid = (dom_mid as i64 + DOR_LEAD) as u64;
        let meas = TcalMeasurement {
            dor_tx: dor_mid - CABLE - 500,
            dor_rx: dor_mid + CABLE + 500,
            dom_rx: dom_mid - 500,
            dom_tx: dom_mid + 500,
        };
        build_raw(DOM_A, TCAL_FMT, dom_mid as i64, &meas.encode())
    }

    fn gps() -> Box<FixedGps> {
        // offset == -DOR_LEAD: day 1 00:00:00 with the DOR latch at
        // DOR_LEAD worth of ticks.
        Box::new(FixedGps(Some(GpsInfo::new(1, 0, 0, 0, b' ', (DOR_LEAD / 500) as u64))))
    }

    /// Captures everything handed downstream.
    #[derive(Clone, Default)]
    struct Capture {
        records: Arc<Mutex<Vec<Vec<u8>>>>,
        eos: Arc<Mutex<Vec<u64>>>,
    }

    impl StreamConsumer for Capture {
        fn consume(&mut self, bytes: Vec<u8>) -> Result<(), ConsumerError> {
            self.records.lock().unwrap().push(bytes);
            Ok(())
        }
        fn end_of_stream(&mut self, mbid: u64) -> Result<(), ConsumerError> {
            self.eos.lock().unwrap().push(mbid);
            Ok(())
        }
    }

    #[test]
    fn test_established_after_two_accepted_updates() {
        let mut proc = TcalProcessor::new(1, RapCal::new(), gps(), None);
        let utc1 = proc.process(tcal_raw(10_000_000)).unwrap();
        assert_eq!(utc1, UTC_UNDEFINED);
        assert!(matches!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 1 }
        ));

        // Second accepted update crosses into Established and already
        // returns a translated time.
        let utc2 = proc.process(tcal_raw(20_000_000)).unwrap();
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);
        // dom_tx = dom_mid + 500, truncated to whole ticks, back to 0.1 ns.
        let expect = (20_000_500u64 / 250 * 250) as i64;
        assert_eq!(utc2, expect);

        let utc3 = proc.process(tcal_raw(30_000_000)).unwrap();
        assert_eq!(utc3, (30_000_500u64 / 250 * 250) as i64);
    }

    #[test]
    fn test_gps_null_stays_primordial() {
        let mut proc =
            TcalProcessor::new(1, RapCal::new(), Box::new(FixedGps(None)), None);
        for i in 1..=3u64 {
            let utc = proc.process(tcal_raw(i * 10_000_000)).unwrap();
            assert_eq!(utc, UTC_UNDEFINED);
        }
        assert!(matches!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 0 }
        ));
        assert_eq!(proc.stats().snapshot().missing_gps, 3);
    }

    #[test]
    fn test_gps_null_after_established_still_translates() {
        let mut proc = TcalProcessor::new(1, RapCal::new(), gps(), None);
        proc.process(tcal_raw(10_000_000)).unwrap();
        proc.process(tcal_raw(20_000_000)).unwrap();
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);

        // GPS drops out; translation keeps working off the last fit.
        proc.gps = Box::new(FixedGps(None));
        let utc = proc.process(tcal_raw(30_000_000)).unwrap();
        assert_eq!(utc, (30_000_500u64 / 250 * 250) as i64);
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);
    }

    #[test]
    fn test_rejected_update_suppressed_in_primordial() {
        let mut proc = TcalProcessor::new(1, RapCal::new(), gps(), None);
        proc.process(tcal_raw(20_000_000)).unwrap();
        // Going backwards is rejected; the processor stays primordial.
        let utc = proc.process(tcal_raw(10_000_000)).unwrap();
        assert_eq!(utc, UTC_UNDEFINED);
        assert!(matches!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 1 }
        ));
        assert_eq!(proc.stats().snapshot().rapcal_errors, 1);
    }

    #[test]
    fn test_dispatch_gating() {
        let capture = Capture::default();
        let mut proc =
            TcalProcessor::new(1, RapCal::new(), gps(), Some(Box::new(capture.clone())));

        // Null mode: nothing leaves.
        proc.process(tcal_raw(10_000_000)).unwrap();
        assert!(capture.records.lock().unwrap().is_empty());

        proc.run_level(RunLevel::Running);
        proc.process(tcal_raw(20_000_000)).unwrap();
        {
            let records = capture.records.lock().unwrap();
            assert_eq!(records.len(), 1);
            let rec = &records[0];
            let len = i32::from_be_bytes(rec[0..4].try_into().unwrap());
            assert_eq!(len as usize, rec.len());
            let magic = i32::from_be_bytes(rec[4..8].try_into().unwrap());
            assert_eq!(magic, MAGIC_TCAL_FMTID);
            let mbid = u64::from_be_bytes(rec[8..16].try_into().unwrap());
            assert_eq!(mbid, DOM_A);
            let ticks = i64::from_be_bytes(rec[24..32].try_into().unwrap());
            assert_eq!(ticks, (20_000_500u64 / 250) as i64);
            // Measurement block verbatim, then the live GPS wire block.
            assert_eq!(rec.len(), 32 + TCAL_BLOCK_LEN + 22);
            assert_eq!(rec[32 + TCAL_BLOCK_LEN], 0x01);
        }

        // Any other run level closes the path again.
        proc.run_level(RunLevel::Stopping);
        proc.process(tcal_raw(30_000_000)).unwrap();
        assert_eq!(capture.records.lock().unwrap().len(), 1);
        assert_eq!(proc.stats().snapshot().dispatched, 1);
    }

    #[test]
    fn test_missing_gps_dispatches_placeholder() {
        let capture = Capture::default();
        let mut proc = TcalProcessor::new(
            1,
            RapCal::new(),
            Box::new(FixedGps(None)),
            Some(Box::new(capture.clone())),
        );
        proc.run_level(RunLevel::Running);
        proc.process(tcal_raw(10_000_000)).unwrap();

        let records = capture.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        let gps_block = &rec[rec.len() - 22..];
        assert_eq!(gps_block, &GPS_PLACEHOLDER);
        drop(records);
        assert_eq!(proc.stats().snapshot().missing_gps_dispatched, 1);
    }

    #[test]
    fn test_eos_seals_with_own_mbid() {
        let capture = Capture::default();
        let mut proc =
            TcalProcessor::new(0x99, RapCal::new(), gps(), Some(Box::new(capture.clone())));
        proc.end_of_stream(DOM_A).unwrap();
        assert_eq!(*capture.eos.lock().unwrap(), vec![0x99]);
    }

    #[test]
    fn test_shared_run_level_polled() {
        let capture = Capture::default();
        let cell = SharedRunLevel::new(RunLevel::Idle);
        let mut proc =
            TcalProcessor::new(1, RapCal::new(), gps(), Some(Box::new(capture.clone())))
                .with_shared_run_level(cell.clone());

        proc.process(tcal_raw(10_000_000)).unwrap();
        assert!(capture.records.lock().unwrap().is_empty());

        cell.set(RunLevel::Running);
        proc.process(tcal_raw(20_000_000)).unwrap();
        assert_eq!(capture.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_record_is_fatal() {
        let mut proc = TcalProcessor::new(1, RapCal::new(), gps(), None);
        // Header is fine but the payload is too short for a measurement.
        let raw = build_raw(DOM_A, TCAL_FMT, 0, &[0u8; 8]);
        assert!(matches!(
            proc.process(raw),
            Err(ConsumerError::Malformed(_))
        ));
    }
}
