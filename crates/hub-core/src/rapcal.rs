//! RAPCal — module-clock to UTC translation.
//!
//! Every time-calibration round trip yields four stamps: DOR-side transmit
//! and receive, DOM-side receive and transmit. Pairing the DOR midpoint
//! (converted to UTC with the GPS 1PPS offset) with the DOM midpoint gives
//! one point on the module-clock→UTC line; the two most recent accepted
//! points fit the affine map `utc = a·t + b` that all timestamp translation
//! uses until the next accepted sample.
//!
//! The fitted map is published as an immutable [`Isochron`] snapshot behind
//! a sequence counter so hit-path readers never take a lock against the
//! calibration writer. Before two samples have been accepted the map is
//! undefined and the translator reports `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::Acquire, Ordering::Release};
use std::sync::Arc;
use thiserror::Error;

use crate::buffer::BufferError;

/// One DOM clock tick in 0.1-ns units (40 MHz module oscillator).
pub const DOM_TICK_UTC: i64 = 250;

/// One-way cable delay bound, 0.1-ns units (500 µs).
const MAX_CABLE_DELAY_UTC: i64 = 5_000_000;

/// Largest credible step of the GPS 1PPS offset between consecutive
/// calibrations, 0.1-ns units (100 ns).
const GPS_JUMP_LIMIT_UTC: i64 = 1_000;

/// Largest credible deviation of the DOM/UTC clock ratio from nominal.
const MAX_FREQUENCY_OFFSET: f64 = 1.0e-3;

/// Accepted-sample window bound.
const WINDOW_CAP: usize = 16;

// ---------------------------------------------------------------------------
// TCAL measurement block
//
//   Bytes   0 ..  7 = dor_tx (u64 BE, 0.1 ns, DOR clock domain)
//   Bytes   8 .. 15 = dor_rx (u64 BE, 0.1 ns, DOR clock domain)
//   Bytes  16 .. 23 = dom_rx (u64 BE, 0.1 ns, DOM clock domain)
//   Bytes  24 .. 31 = dom_tx (u64 BE, 0.1 ns, DOM clock domain)
//   Bytes  32 .. 159 = DOR feedback waveform (64 × u16 BE)
//   Bytes 160 .. 287 = DOM feedback waveform (64 × u16 BE)
//
// The waveforms ride along for the formatted record; the fit uses midpoints
// only.
// ---------------------------------------------------------------------------

pub const TCAL_WAVEFORM_SAMPLES: usize = 64;
pub const TCAL_BLOCK_LEN: usize = 32 + 2 * TCAL_WAVEFORM_SAMPLES * 2;

/// The four round-trip stamps of one time calibration.
#[derive(Debug, Clone, Copy)]
pub struct TcalMeasurement {
    pub dor_tx: u64,
    pub dor_rx: u64,
    pub dom_rx: u64,
    pub dom_tx: u64,
}

impl TcalMeasurement {
    /// Parse the stamps out of a TCAL record payload. The payload must hold
    /// the full measurement block (stamps plus both waveforms).
    pub fn parse(payload: &[u8]) -> Result<Self, BufferError> {
        if payload.len() < TCAL_BLOCK_LEN {
            return Err(BufferError::Malformed { len: payload.len() });
        }
        Ok(Self {
            dor_tx: u64::from_be_bytes(payload[0..8].try_into().unwrap()),
            dor_rx: u64::from_be_bytes(payload[8..16].try_into().unwrap()),
            dom_rx: u64::from_be_bytes(payload[16..24].try_into().unwrap()),
            dom_tx: u64::from_be_bytes(payload[24..32].try_into().unwrap()),
        })
    }

    /// Encode a full measurement block with flat baseline waveforms.
    /// The simulated producers and tests use this; real waveforms come off
    /// the wire and are never rebuilt here.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TCAL_BLOCK_LEN);
        out.extend_from_slice(&self.dor_tx.to_be_bytes());
        out.extend_from_slice(&self.dor_rx.to_be_bytes());
        out.extend_from_slice(&self.dom_rx.to_be_bytes());
        out.extend_from_slice(&self.dom_tx.to_be_bytes());
        for _ in 0..2 * TCAL_WAVEFORM_SAMPLES {
            out.extend_from_slice(&512u16.to_be_bytes());
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum RapCalError {
    #[error("negative round-trip: cable delay {delay_utc} (0.1 ns)")]
    NegativeCableDelay { delay_utc: i64 },
    #[error("cable delay {delay_utc} (0.1 ns) beyond {MAX_CABLE_DELAY_UTC}")]
    CableDelayOutOfRange { delay_utc: i64 },
    #[error("gps offset jumped from {prev} to {cur} (0.1 ns)")]
    StaleGps { prev: i64, cur: i64 },
    #[error("calibration went backwards on the {domain} clock")]
    NonMonotonic { domain: &'static str },
    #[error("implausible clock ratio {slope}")]
    WildSlope { slope: f64 },
}

// ---------------------------------------------------------------------------
// Published affine map
// ---------------------------------------------------------------------------

/// Immutable snapshot of the fitted map, anchored at the newest accepted
/// sample so the interpolation term stays small.
#[derive(Debug, Clone, Copy)]
pub struct Isochron {
    pub slope: f64,
    pub dom_anchor: f64,
    pub utc_anchor: f64,
}

impl Isochron {
    /// Translate a DOM clock tick count (25-ns ticks, i.e. `domtx / 250`)
    /// into UTC 0.1-ns units.
    pub fn dom_to_utc(&self, dom_ticks: u64) -> i64 {
        let t = dom_ticks as f64 * DOM_TICK_UTC as f64;
        (self.utc_anchor + self.slope * (t - self.dom_anchor)).round() as i64
    }
}

/// Lock-free single-writer map cell shared with every translating reader.
///
/// Writer protocol: bump the sequence odd, store the three fields, bump it
/// even. Readers retry on an odd or changed sequence. A sequence of zero
/// means no map has ever been published (the primordial regime).
pub struct UtcTranslator {
    seq: AtomicU64,
    slope_bits: AtomicU64,
    dom_anchor_bits: AtomicU64,
    utc_anchor_bits: AtomicU64,
}

impl UtcTranslator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seq: AtomicU64::new(0),
            slope_bits: AtomicU64::new(0),
            dom_anchor_bits: AtomicU64::new(0),
            utc_anchor_bits: AtomicU64::new(0),
        })
    }

    fn publish(&self, iso: Isochron) {
        let s0 = self.seq.load(Acquire);
        self.seq.store(s0 + 1, Release);
        self.slope_bits.store(iso.slope.to_bits(), Release);
        self.dom_anchor_bits.store(iso.dom_anchor.to_bits(), Release);
        self.utc_anchor_bits.store(iso.utc_anchor.to_bits(), Release);
        self.seq.store(s0 + 2, Release);
    }

    /// `true` once at least one map has been published.
    pub fn ready(&self) -> bool {
        self.seq.load(Acquire) != 0
    }

    /// A consistent copy of the current map, or `None` in the primordial
    /// regime.
    pub fn snapshot(&self) -> Option<Isochron> {
        loop {
            let s1 = self.seq.load(Acquire);
            if s1 == 0 {
                return None;
            }
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let iso = Isochron {
                slope: f64::from_bits(self.slope_bits.load(Acquire)),
                dom_anchor: f64::from_bits(self.dom_anchor_bits.load(Acquire)),
                utc_anchor: f64::from_bits(self.utc_anchor_bits.load(Acquire)),
            };
            let s2 = self.seq.load(Acquire);
            if s1 == s2 {
                return Some(iso);
            }
            std::hint::spin_loop();
        }
    }

    /// Translate a DOM tick count, or `None` before calibration converged.
    pub fn dom_to_utc(&self, dom_ticks: u64) -> Option<i64> {
        self.snapshot().map(|iso| iso.dom_to_utc(dom_ticks))
    }
}

// ---------------------------------------------------------------------------
// RapCal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CalSample {
    dom_mid: f64,
    utc_mid: f64,
}

/// Sliding window of accepted calibrations plus the published map.
///
/// Single writer (the TCAL processor); any number of readers through the
/// [`UtcTranslator`] handle. A rejected sample leaves all state untouched.
pub struct RapCal {
    window: VecDeque<CalSample>,
    last_gps_offset: Option<i64>,
    translator: Arc<UtcTranslator>,
}

impl RapCal {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAP),
            last_gps_offset: None,
            translator: UtcTranslator::new(),
        }
    }

    /// Shared read handle for timestamp translation off the hit path.
    pub fn translator(&self) -> Arc<UtcTranslator> {
        self.translator.clone()
    }

    pub fn n_samples(&self) -> usize {
        self.window.len()
    }

    /// `true` once two samples have been accepted and the map is defined.
    pub fn ready(&self) -> bool {
        self.translator.ready()
    }

    /// Ingest one calibration round trip together with the current GPS
    /// 1PPS offset (0.1 ns). On success the window advances and the map is
    /// refit from the two newest samples; on failure nothing changes.
    pub fn update(
        &mut self,
        tcal: &TcalMeasurement,
        gps_offset: i64,
    ) -> Result<(), RapCalError> {
        let dor_interval = tcal.dor_rx as i64 - tcal.dor_tx as i64;
        if dor_interval <= 0 {
            return Err(RapCalError::NonMonotonic { domain: "dor" });
        }
        let dom_interval = tcal.dom_tx as i64 - tcal.dom_rx as i64;
        if dom_interval <= 0 {
            return Err(RapCalError::NonMonotonic { domain: "dom" });
        }

        let cable_delay = (dor_interval - dom_interval) / 2;
        if cable_delay < 0 {
            return Err(RapCalError::NegativeCableDelay { delay_utc: cable_delay });
        }
        if cable_delay > MAX_CABLE_DELAY_UTC {
            return Err(RapCalError::CableDelayOutOfRange { delay_utc: cable_delay });
        }

        if let Some(prev) = self.last_gps_offset {
            if (gps_offset - prev).abs() > GPS_JUMP_LIMIT_UTC {
                return Err(RapCalError::StaleGps { prev, cur: gps_offset });
            }
        }

        let dor_mid = (tcal.dor_tx as f64 + tcal.dor_rx as f64) / 2.0;
        let dom_mid = (tcal.dom_rx as f64 + tcal.dom_tx as f64) / 2.0;
        let utc_mid = dor_mid + gps_offset as f64;

        if let Some(prev) = self.window.back() {
            if dom_mid <= prev.dom_mid {
                return Err(RapCalError::NonMonotonic { domain: "dom" });
            }
            if utc_mid <= prev.utc_mid {
                return Err(RapCalError::NonMonotonic { domain: "utc" });
            }
            let slope = (utc_mid - prev.utc_mid) / (dom_mid - prev.dom_mid);
            if (slope - 1.0).abs() > MAX_FREQUENCY_OFFSET {
                return Err(RapCalError::WildSlope { slope });
            }
        }

        self.last_gps_offset = Some(gps_offset);
        self.window.push_back(CalSample { dom_mid, utc_mid });
        if self.window.len() > WINDOW_CAP {
            self.window.pop_front();
        }

        if self.window.len() >= 2 {
            let b = self.window[self.window.len() - 1];
            let a = self.window[self.window.len() - 2];
            let slope = (b.utc_mid - a.utc_mid) / (b.dom_mid - a.dom_mid);
            self.translator.publish(Isochron {
                slope,
                dom_anchor: b.dom_mid,
                utc_anchor: b.utc_mid,
            });
        }
        Ok(())
    }

    /// Translate a DOM tick count (25-ns ticks). `None` before two accepted
    /// samples; callers in that regime must not rely on it.
    pub fn dom_to_utc(&self, dom_ticks: u64) -> Option<i64> {
        self.translator.dom_to_utc(dom_ticks)
    }
}

impl Default for RapCal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Synthetic geometry: DOM clock equals UTC exactly, DOR runs
    // 2.5 µs ahead of the module, cable one-way delay 2 µs, round trip on
    // the module 100 ns. The GPS offset that makes it consistent is −2.5 µs.
    const DOR_LEAD: i64 = 25_000;
    const CABLE: u64 = 20_000;
    const GPS_OFFSET: i64 = -DOR_LEAD;

    fn sample_at(dom_mid: u64) -> TcalMeasurement {
        let dor_mid = (dom_mid as i64 + DOR_LEAD) as u64;
        TcalMeasurement {
            dor_tx: dor_mid - CABLE - 500,
            dor_rx: dor_mid + CABLE + 500,
            dom_rx: dom_mid - 500,
            dom_tx: dom_mid + 500,
        }
    }

    #[test]
    fn test_primordial_regime_undefined() {
        let mut rapcal = RapCal::new();
        assert!(!rapcal.ready());
        assert!(rapcal.dom_to_utc(1000).is_none());
        rapcal.update(&sample_at(10_000_000), GPS_OFFSET).unwrap();
        // One sample is not enough for a fit.
        assert!(!rapcal.ready());
        assert!(rapcal.dom_to_utc(1000).is_none());
    }

    #[test]
    fn test_identity_fit_after_two_samples() {
        let mut rapcal = RapCal::new();
        rapcal.update(&sample_at(10_000_000), GPS_OFFSET).unwrap();
        rapcal.update(&sample_at(20_000_000), GPS_OFFSET).unwrap();
        assert!(rapcal.ready());
        // UTC == DOM in this geometry: a tick count maps to tick × 250.
        assert_eq!(rapcal.dom_to_utc(60_000).unwrap(), 15_000_000);
        assert_eq!(rapcal.dom_to_utc(100_000).unwrap(), 25_000_000);
    }

    #[test]
    fn test_translator_shared_with_readers() {
        let mut rapcal = RapCal::new();
        let translator = rapcal.translator();
        assert!(translator.snapshot().is_none());
        rapcal.update(&sample_at(10_000_000), GPS_OFFSET).unwrap();
        rapcal.update(&sample_at(20_000_000), GPS_OFFSET).unwrap();
        let iso = translator.snapshot().unwrap();
        assert!((iso.slope - 1.0).abs() < 1e-9);
        assert_eq!(translator.dom_to_utc(60_000).unwrap(), 15_000_000);
    }

    #[test]
    fn test_negative_cable_delay_rejected() {
        let mut rapcal = RapCal::new();
        // DOR interval shorter than the DOM interval: signals travelled
        // backwards in time.
        let tcal = TcalMeasurement {
            dor_tx: 1_000_000,
            dor_rx: 1_000_100,
            dom_rx: 2_000_000,
            dom_tx: 2_001_000,
        };
        let err = rapcal.update(&tcal, 0).unwrap_err();
        assert!(matches!(err, RapCalError::NegativeCableDelay { .. }));
        assert_eq!(rapcal.n_samples(), 0);
    }

    #[test]
    fn test_cable_delay_bound() {
        let mut rapcal = RapCal::new();
        let dom_mid = 100_000_000u64;
        let huge = 50_000_000u64; // 5 ms one way
        let tcal = TcalMeasurement {
            dor_tx: dom_mid - huge,
            dor_rx: dom_mid + huge,
            dom_rx: dom_mid - 500,
            dom_tx: dom_mid + 500,
        };
        let err = rapcal.update(&tcal, 0).unwrap_err();
        assert!(matches!(err, RapCalError::CableDelayOutOfRange { .. }));
    }

    #[test]
    fn test_gps_jump_rejected_and_state_unchanged() {
        let mut rapcal = RapCal::new();
        rapcal.update(&sample_at(10_000_000), GPS_OFFSET).unwrap();
        rapcal.update(&sample_at(20_000_000), GPS_OFFSET).unwrap();
        let before = rapcal.dom_to_utc(80_000).unwrap();

        let err = rapcal
            .update(&sample_at(30_000_000), GPS_OFFSET + 50_000)
            .unwrap_err();
        assert!(matches!(err, RapCalError::StaleGps { .. }));
        assert_eq!(rapcal.n_samples(), 2);
        assert_eq!(rapcal.dom_to_utc(80_000).unwrap(), before);
    }

    #[test]
    fn test_non_monotone_sample_rejected() {
        let mut rapcal = RapCal::new();
        rapcal.update(&sample_at(20_000_000), GPS_OFFSET).unwrap();
        let err = rapcal.update(&sample_at(10_000_000), GPS_OFFSET).unwrap_err();
        assert!(matches!(err, RapCalError::NonMonotonic { .. }));
        assert_eq!(rapcal.n_samples(), 1);
    }

    #[test]
    fn test_wild_slope_rejected() {
        let mut rapcal = RapCal::new();
        rapcal.update(&sample_at(10_000_000), GPS_OFFSET).unwrap();
        // DOR advanced twice as far as DOM: apparent clock ratio 2.
        let dom_mid = 11_000_000u64;
        let dor_mid = (10_000_000 + DOR_LEAD + 2_000_000) as u64;
        let tcal = TcalMeasurement {
            dor_tx: dor_mid - CABLE - 500,
            dor_rx: dor_mid + CABLE + 500,
            dom_rx: dom_mid - 500,
            dom_tx: dom_mid + 500,
        };
        let err = rapcal.update(&tcal, GPS_OFFSET).unwrap_err();
        assert!(matches!(err, RapCalError::WildSlope { .. }));
        assert_eq!(rapcal.n_samples(), 1);
        assert!(!rapcal.ready());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut rapcal = RapCal::new();
        for i in 0..40u64 {
            rapcal
                .update(&sample_at(10_000_000 + i * 1_000_000), GPS_OFFSET)
                .unwrap();
        }
        assert!(rapcal.n_samples() <= WINDOW_CAP);
        assert!(rapcal.ready());
    }

    #[test]
    fn test_measurement_block_round_trip() {
        let tcal = sample_at(10_000_000);
        let block = tcal.encode();
        assert_eq!(block.len(), TCAL_BLOCK_LEN);
        let parsed = TcalMeasurement::parse(&block).unwrap();
        assert_eq!(parsed.dor_tx, tcal.dor_tx);
        assert_eq!(parsed.dom_tx, tcal.dom_tx);
    }

    #[test]
    fn test_short_measurement_block_rejected() {
        assert!(TcalMeasurement::parse(&[0u8; TCAL_BLOCK_LEN - 1]).is_err());
    }
}
