//! Heart rate profile (device type 120). Every page carries the computed
//! heart rate in byte 7; the page number cycles 0-7 under a toggle bit.

use super::common::CommonData;
use super::{PageData, ProfileDecoder};

#[derive(Debug, Default)]
pub struct HeartRateDecoder {
    common: CommonData,
}

impl HeartRateDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileDecoder for HeartRateDecoder {
    fn common(&self) -> &CommonData {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonData {
        &mut self.common
    }

    fn decode_device_page(&mut self, page: u8, data: &[u8; 8]) -> Vec<PageData> {
        // Bit 7 is the page-change toggle
        if page & 0x7F > 7 {
            return Vec::new();
        }
        let bpm = data[7];
        if bpm == 0 {
            return Vec::new();
        }
        vec![PageData::HeartRate { bpm }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_hr_in_byte_7() {
        let mut decoder = HeartRateDecoder::new();
        let data: [u8; 8] = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 142];
        assert_eq!(decoder.decode(&data), vec![PageData::HeartRate { bpm: 142 }]);
    }

    #[test]
    fn toggle_bit_is_ignored() {
        let mut decoder = HeartRateDecoder::new();
        let data: [u8; 8] = [0x84, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 97];
        assert_eq!(decoder.decode(&data), vec![PageData::HeartRate { bpm: 97 }]);
    }

    #[test]
    fn zero_bpm_is_invalid() {
        let mut decoder = HeartRateDecoder::new();
        let data: [u8; 8] = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0];
        assert!(decoder.decode(&data).is_empty());
    }

    #[test]
    fn common_page_updates_common_data_only() {
        let mut decoder = HeartRateDecoder::new();
        let data: [u8; 8] = [0x50, 0xFF, 0xFF, 3, 0x89, 0x00, 0x34, 0x12];
        assert!(decoder.decode(&data).is_empty());
        assert_eq!(decoder.common().manufacturer_id, Some(137));
    }
}
