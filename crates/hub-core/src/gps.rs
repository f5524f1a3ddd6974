//! GPS 1PPS snapshots.
//!
//! Each DOR card latches its clock counter on the GPS pulse-per-second and
//! pairs it with the satellite time string. The difference, scaled to 0.1-ns
//! units, is the offset that moves DOR-clock readings onto UTC. Card polling
//! belongs to the driver layer; this module only defines the snapshot type,
//! the source trait the TCAL processors consume, and the shared per-card
//! registry the poller writes into.

use chrono::{Datelike, NaiveDateTime, Timelike};
use dashmap::DashMap;
use std::sync::Arc;

/// One DOR clock tick in 0.1-ns units (20 MHz card oscillator).
pub const DOR_TICK_UTC: i64 = 500;

pub const GPS_WIRE_LEN: usize = 22;

/// Wire block sent when a record must carry a GPS slot but no snapshot was
/// available: GPS epoch zero with a zeroed clock latch.
pub const GPS_PLACEHOLDER: [u8; GPS_WIRE_LEN] =
    *b"\x01001:00:00:00 \0\0\0\0\0\0\0\0";

// Wire layout:
//   Byte   0        = SOH (0x01)
//   Bytes  1 .. 12  = "DDD:HH:MM:SS" (ASCII, day-of-year is 1-based)
//   Byte  13        = quality character (' ' = locked)
//   Bytes 14 .. 21  = DOR clock latch at the pulse (u64 BE)

/// A single 1PPS snapshot: the UTC↔DOR offset plus its 22-byte wire form.
#[derive(Debug, Clone, Copy)]
pub struct GpsInfo {
    /// `UTC − DOR` in 0.1-ns units.
    pub offset: i64,
    pub wire: [u8; GPS_WIRE_LEN],
}

impl GpsInfo {
    /// Build a snapshot from the satellite time string fields and the DOR
    /// clock latch. `day` is the 1-based day of year.
    pub fn new(day: u32, hour: u32, minute: u32, second: u32, quality: u8, dor_clock: u64) -> Self {
        let secs =
            (((day as i64 - 1) * 24 + hour as i64) * 60 + minute as i64) * 60 + second as i64;
        let offset = secs * 10_000_000_000 - dor_clock as i64 * DOR_TICK_UTC;

        let mut wire = [0u8; GPS_WIRE_LEN];
        wire[0] = 0x01;
        let text = format!("{:03}:{:02}:{:02}:{:02}", day, hour, minute, second);
        wire[1..13].copy_from_slice(text.as_bytes());
        wire[13] = quality;
        wire[14..22].copy_from_slice(&dor_clock.to_be_bytes());
        Self { offset, wire }
    }

    pub fn from_datetime(dt: &NaiveDateTime, quality: u8, dor_clock: u64) -> Self {
        Self::new(dt.ordinal(), dt.hour(), dt.minute(), dt.second(), quality, dor_clock)
    }

    pub fn dor_clock(&self) -> u64 {
        u64::from_be_bytes(self.wire[14..22].try_into().unwrap())
    }

    pub fn quality(&self) -> u8 {
        self.wire[13]
    }
}

/// Yields the current 1PPS snapshot for one card, or `None` when no
/// snapshot is available this cycle. Callers must tolerate `None`.
pub trait GpsSource: Send {
    fn snapshot(&self) -> Option<GpsInfo>;
}

/// A source that always returns the same snapshot (or none). Used by the
/// replay harness and tests in place of a live card poller.
pub struct FixedGps(pub Option<GpsInfo>);

impl GpsSource for FixedGps {
    fn snapshot(&self) -> Option<GpsInfo> {
        self.0
    }
}

/// Process-wide registry of the latest snapshot per DOR card. The driver
/// poller overwrites entries; any number of processors read concurrently.
pub struct GpsRegistry {
    cards: DashMap<u8, GpsInfo>,
}

impl GpsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { cards: DashMap::new() })
    }

    pub fn update(&self, card: u8, info: GpsInfo) {
        self.cards.insert(card, info);
    }

    pub fn get(&self, card: u8) -> Option<GpsInfo> {
        self.cards.get(&card).map(|e| *e.value())
    }

    /// A [`GpsSource`] view pinned to one card.
    pub fn card_source(self: &Arc<Self>, card: u8) -> CardGps {
        CardGps { registry: self.clone(), card }
    }
}

pub struct CardGps {
    registry: Arc<GpsRegistry>,
    card: u8,
}

impl GpsSource for CardGps {
    fn snapshot(&self) -> Option<GpsInfo> {
        self.registry.get(self.card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let info = GpsInfo::new(123, 4, 5, 6, b' ', 0x0001_0203_0405_0607);
        assert_eq!(info.wire.len(), 22);
        assert_eq!(info.wire[0], 0x01);
        assert_eq!(&info.wire[1..13], b"123:04:05:06");
        assert_eq!(info.wire[13], b' ');
        assert_eq!(info.dor_clock(), 0x0001_0203_0405_0607);
    }

    #[test]
    fn test_offset_math() {
        // Day 1, 00:00:10 with the DOR clock at exactly 10 s worth of ticks:
        // the clocks agree and the offset is zero.
        let ticks_10s = (10 * 10_000_000_000i64 / DOR_TICK_UTC) as u64;
        let info = GpsInfo::new(1, 0, 0, 10, b' ', ticks_10s);
        assert_eq!(info.offset, 0);

        // A card whose clock lags by one tick puts UTC ahead by one tick.
        let info = GpsInfo::new(1, 0, 0, 10, b' ', ticks_10s - 1);
        assert_eq!(info.offset, DOR_TICK_UTC);
    }

    #[test]
    fn test_placeholder_block() {
        assert_eq!(GPS_PLACEHOLDER.len(), GPS_WIRE_LEN);
        assert_eq!(GPS_PLACEHOLDER[0], 0x01);
        assert_eq!(&GPS_PLACEHOLDER[1..13], b"001:00:00:00");
        assert_eq!(GPS_PLACEHOLDER[13], b' ');
        assert_eq!(&GPS_PLACEHOLDER[14..22], &[0u8; 8]);
    }

    #[test]
    fn test_registry_card_source() {
        let registry = GpsRegistry::new();
        let source = registry.card_source(3);
        assert!(source.snapshot().is_none());
        registry.update(3, GpsInfo::new(2, 0, 0, 0, b' ', 99));
        let snap = source.snapshot().unwrap();
        assert_eq!(snap.dor_clock(), 99);
        // Other cards are unaffected.
        assert!(registry.card_source(4).snapshot().is_none());
    }

    #[test]
    fn test_from_datetime() {
        let dt = chrono::NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let info = GpsInfo::from_datetime(&dt, b' ', 0);
        assert_eq!(&info.wire[1..13], b"002:03:04:05");
    }
}
