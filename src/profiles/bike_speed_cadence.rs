//! Bike speed and cadence sensors (device types 121, 122, 123). These report
//! cumulative counters; rates come from the wrapped deltas between samples.

use super::common::{decode_common_page, CommonData};
use super::{PageData, ProfileDecoder};

/// Default wheel circumference in mm (700x25c)
pub const DEFAULT_WHEEL_CIRCUMFERENCE_MM: u32 = 2105;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Device type 122, cadence counters in bytes 4-7
    Cadence,
    /// Device type 123, wheel counters in bytes 4-7
    Speed,
    /// Device type 121, no page byte: cadence in bytes 0-3, wheel in 4-7
    Combined,
}

#[derive(Debug, Default)]
struct CounterState {
    prev_event_time: u16,
    prev_revolutions: u16,
    initialized: bool,
}

impl CounterState {
    /// Wrapped deltas since the previous sample; None on the first one.
    fn advance(&mut self, event_time: u16, revolutions: u16) -> Option<(u16, u16)> {
        if !self.initialized {
            self.prev_event_time = event_time;
            self.prev_revolutions = revolutions;
            self.initialized = true;
            return None;
        }
        let time_diff = event_time.wrapping_sub(self.prev_event_time);
        let rev_diff = revolutions.wrapping_sub(self.prev_revolutions);
        self.prev_event_time = event_time;
        self.prev_revolutions = revolutions;
        if time_diff == 0 || rev_diff == 0 {
            return None;
        }
        Some((time_diff, rev_diff))
    }
}

#[derive(Debug)]
pub struct BikeSpeedCadenceDecoder {
    common: CommonData,
    kind: SensorKind,
    wheel_circumference_mm: u32,
    cadence: CounterState,
    speed: CounterState,
}

impl BikeSpeedCadenceDecoder {
    pub fn new(kind: SensorKind) -> Self {
        Self::with_wheel(kind, DEFAULT_WHEEL_CIRCUMFERENCE_MM)
    }

    pub fn with_wheel(kind: SensorKind, wheel_circumference_mm: u32) -> Self {
        Self {
            common: CommonData::default(),
            kind,
            wheel_circumference_mm,
            cadence: CounterState::default(),
            speed: CounterState::default(),
        }
    }

    /// Event time is in 1/1024 s units.
    fn decode_cadence(&mut self, event_time: u16, revolutions: u16) -> Option<PageData> {
        let (time_diff, rev_diff) = self.cadence.advance(event_time, revolutions)?;
        let rpm = (rev_diff as f32 / (time_diff as f32 / 1024.0)) * 60.0;
        if !(0.0..=200.0).contains(&rpm) {
            return None;
        }
        Some(PageData::Cadence { rpm })
    }

    fn decode_speed(&mut self, event_time: u16, revolutions: u16) -> Option<PageData> {
        let (time_diff, rev_diff) = self.speed.advance(event_time, revolutions)?;
        let time_secs = time_diff as f64 / 1024.0;
        let distance_m = rev_diff as f64 * self.wheel_circumference_mm as f64 / 1000.0;
        let kmh = (distance_m / time_secs) * 3.6;
        if !(0.0..=120.0).contains(&kmh) {
            return None;
        }
        Some(PageData::Speed { kmh: kmh as f32 })
    }
}

impl ProfileDecoder for BikeSpeedCadenceDecoder {
    fn common(&self) -> &CommonData {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonData {
        &mut self.common
    }

    fn decode_device_page(&mut self, _page: u8, data: &[u8; 8]) -> Vec<PageData> {
        match self.kind {
            SensorKind::Cadence => self
                .decode_cadence(
                    u16::from_le_bytes([data[4], data[5]]),
                    u16::from_le_bytes([data[6], data[7]]),
                )
                .into_iter()
                .collect(),
            SensorKind::Speed => self
                .decode_speed(
                    u16::from_le_bytes([data[4], data[5]]),
                    u16::from_le_bytes([data[6], data[7]]),
                )
                .into_iter()
                .collect(),
            SensorKind::Combined => {
                let cadence = self.decode_cadence(
                    u16::from_le_bytes([data[0], data[1]]),
                    u16::from_le_bytes([data[2], data[3]]),
                );
                let speed = self.decode_speed(
                    u16::from_le_bytes([data[4], data[5]]),
                    u16::from_le_bytes([data[6], data[7]]),
                );
                cadence.into_iter().chain(speed).collect()
            }
        }
    }

    fn decode(&mut self, data: &[u8; 8]) -> Vec<PageData> {
        // The combined sensor has no page byte at all; every frame is raw
        // counters and common pages never appear
        if self.kind == SensorKind::Combined {
            return self.decode_device_page(0, data);
        }
        let page = data[0];
        if decode_common_page(page, data, &mut self.common) {
            return Vec::new();
        }
        self.decode_device_page(page, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpm(pages: &[PageData]) -> f32 {
        match pages {
            [PageData::Cadence { rpm }] => *rpm,
            other => panic!("expected one Cadence page, got {:?}", other),
        }
    }

    fn kmh(pages: &[PageData]) -> f32 {
        match pages {
            [PageData::Speed { kmh }] => *kmh,
            other => panic!("expected one Speed page, got {:?}", other),
        }
    }

    #[test]
    fn first_cadence_sample_initializes() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Cadence);
        let data: [u8; 8] = [0x00, 0, 0, 0, 0, 0, 0, 0];
        assert!(decoder.decode(&data).is_empty());
    }

    #[test]
    fn cadence_one_rev_per_second_is_60_rpm() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Cadence);
        decoder.decode(&[0x00, 0, 0, 0, 0, 0, 0, 0]);
        // 1 revolution in 1024 ticks (1 second)
        let pages = decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x04, 0x01, 0x00]);
        assert!((rpm(&pages) - 60.0).abs() < 1.0);
    }

    #[test]
    fn cadence_u16_counter_wraparound() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Cadence);
        decoder.decode(&[0x00, 0, 0, 0, 0xF0, 0xFF, 0xF0, 0xFF]);
        // time wraps to 0x0400 (delta 0x0410 = 1040 ticks), revs to 0xFFF1 (delta 1)
        let pages = decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x04, 0xF1, 0xFF]);
        assert!((rpm(&pages) - 59.077).abs() < 0.1);
    }

    #[test]
    fn cadence_above_200_rpm_discarded() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Cadence);
        decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x00, 0x00, 0x00]);
        // 50 revs in 1 tick
        assert!(decoder
            .decode(&[0x00, 0, 0, 0, 0x01, 0x00, 0x32, 0x00])
            .is_empty());
    }

    #[test]
    fn speed_from_wheel_circumference() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Speed);
        decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x00, 0x00, 0x00]);
        // 1 rev in 1 second with a 2105 mm wheel = 7.578 km/h
        let pages = decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x04, 0x01, 0x00]);
        assert!((kmh(&pages) - 7.578).abs() < 0.01);
    }

    #[test]
    fn speed_with_other_wheel_size() {
        let mut decoder = BikeSpeedCadenceDecoder::with_wheel(SensorKind::Speed, 2290);
        decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x00, 0x00, 0x00]);
        // 1 rev in 1 second with a 2290 mm wheel = 8.244 km/h
        let pages = decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x04, 0x01, 0x00]);
        assert!((kmh(&pages) - 8.244).abs() < 0.01);
    }

    #[test]
    fn speed_zero_time_diff_discarded() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Speed);
        decoder.decode(&[0x00, 0, 0, 0, 0x00, 0x04, 0x01, 0x00]);
        assert!(decoder
            .decode(&[0x00, 0, 0, 0, 0x00, 0x04, 0x02, 0x00])
            .is_empty());
    }

    #[test]
    fn combined_sensor_emits_both() {
        let mut decoder = BikeSpeedCadenceDecoder::new(SensorKind::Combined);
        decoder.decode(&[0, 0, 0, 0, 0, 0, 0, 0]);
        // cadence: 1 rev / 1 s, speed: 2 revs / 1 s
        let pages = decoder.decode(&[0x00, 0x04, 0x01, 0x00, 0x00, 0x04, 0x02, 0x00]);
        assert_eq!(pages.len(), 2);
        assert!(matches!(pages[0], PageData::Cadence { .. }));
        assert!(matches!(pages[1], PageData::Speed { .. }));
    }
}
