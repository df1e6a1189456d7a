//! ANT+ common data pages (80-83), interleaved by every profile on the same
//! channel regardless of the device-specific page numbers.

use chrono::{DateTime, TimeZone, Utc};

pub const PAGE_MANUFACTURER_INFO: u8 = 80;
pub const PAGE_PRODUCT_INFO: u8 = 81;
pub const PAGE_BATTERY_STATUS: u8 = 82;
pub const PAGE_DATE_TIME: u8 = 83;

/// Battery condition reported in page 82.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryStatus {
    New,
    Good,
    Ok,
    Low,
    Critical,
    Charging,
    Invalid,
    Unknown,
}

impl BatteryStatus {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::New,
            2 => Self::Good,
            3 => Self::Ok,
            4 => Self::Low,
            5 => Self::Critical,
            6 => Self::Charging,
            7 => Self::Invalid,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteryData {
    pub battery_id: u8,
    pub voltage: f32,
    pub status: BatteryStatus,
    pub operating_time_secs: u32,
}

/// Accumulated common-page data for one device.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommonData {
    pub manufacturer_id: Option<u16>,
    pub model_number: Option<u16>,
    pub hardware_revision: Option<u8>,
    pub software_revision: Option<String>,
    pub serial_number: Option<u32>,
    pub battery: Option<BatteryData>,
    pub last_time: Option<DateTime<Utc>>,
}

impl CommonData {
    /// Page 80 payload for a master's TX rotation.
    pub fn manufacturer_page_payload(&self) -> [u8; 8] {
        let manufacturer = self.manufacturer_id.unwrap_or(0xFFFF).to_le_bytes();
        let model = self.model_number.unwrap_or(0xFFFF).to_le_bytes();
        [
            PAGE_MANUFACTURER_INFO,
            0xFF,
            0xFF,
            self.hardware_revision.unwrap_or(0x00),
            manufacturer[0],
            manufacturer[1],
            model[0],
            model[1],
        ]
    }

    /// Page 81 payload for a master's TX rotation.
    pub fn product_info_page_payload(&self) -> [u8; 8] {
        let main = self
            .software_revision
            .as_deref()
            .and_then(|rev| rev.split('.').next())
            .and_then(|main| main.parse::<u8>().ok())
            .unwrap_or(0);
        let serial = self.serial_number.unwrap_or(0xFFFF_FFFF).to_le_bytes();
        [
            PAGE_PRODUCT_INFO,
            0xFF,
            0xFF,
            main,
            serial[0],
            serial[1],
            serial[2],
            serial[3],
        ]
    }
}

/// Decode ANT+ Common Data Page 80: Manufacturer's Information
/// Byte 3: HW revision
/// Bytes 4-5: Manufacturer ID (u16 LE)
/// Bytes 6-7: Model number (u16 LE)
fn decode_manufacturer_info(data: &[u8; 8], common: &mut CommonData) {
    common.hardware_revision = Some(data[3]);
    common.manufacturer_id = Some(u16::from_le_bytes([data[4], data[5]]));
    common.model_number = Some(u16::from_le_bytes([data[6], data[7]]));
}

/// Decode ANT+ Common Data Page 81: Product Information
/// Byte 2: SW revision supplemental (0xFF = not used)
/// Byte 3: SW revision main
/// Bytes 4-7: Serial number (u32 LE, 0xFFFFFFFF = not available)
fn decode_product_info(data: &[u8; 8], common: &mut CommonData) {
    let supplemental = data[2];
    let main = data[3];
    if supplemental != 0xFF && supplemental != 0 {
        common.software_revision = Some(format!("{}.{}", main, supplemental));
    } else {
        common.software_revision = Some(format!("{}", main));
    }
    let serial = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if serial != 0xFFFF_FFFF && serial != 0 {
        common.serial_number = Some(serial);
    }
}

/// Decode ANT+ Common Data Page 82: Battery Status
/// Byte 2: battery identifier (0xFF = single battery)
/// Bytes 3-4: cumulative operating time
/// Byte 6: fractional voltage (1/256 V)
/// Byte 7: coarse voltage (bits 0-3), status (bits 4-6), time resolution (bit 7)
fn decode_battery_status(data: &[u8; 8], common: &mut CommonData) {
    let fractional = data[6] as f32 / 256.0;
    let coarse = (data[7] & 0x0F) as f32;
    let status = BatteryStatus::from_bits((data[7] & 0x70) >> 4);
    let battery_id = if data[2] != 0xFF { (data[2] & 0xF0) >> 4 } else { 0 };

    let ticks = u16::from_le_bytes([data[3], data[4]]) as u32;
    let operating_time_secs = if data[7] & 0x80 != 0 {
        ticks * 2
    } else {
        ticks * 16
    };

    common.battery = Some(BatteryData {
        battery_id,
        voltage: coarse + fractional,
        status,
        operating_time_secs,
    });
}

/// Decode ANT+ Common Data Page 83: Date and Time
/// Byte 2: seconds, byte 3: minutes, byte 4: hours
/// Byte 5: day of month (bits 0-4), byte 6: month, byte 7: years since 2000
fn decode_date_time(data: &[u8; 8], common: &mut CommonData) {
    let timedate = Utc
        .with_ymd_and_hms(
            data[7] as i32 + 2000,
            data[6] as u32,
            (data[5] & 0x1F) as u32,
            data[4] as u32,
            data[3] as u32,
            data[2] as u32,
        )
        .single();
    if timedate.is_some() {
        common.last_time = timedate;
    }
}

/// Fold a common page into `common`. Returns false when `page` is not a
/// common page, leaving it to the device-specific decoder.
pub fn decode_common_page(page: u8, data: &[u8; 8], common: &mut CommonData) -> bool {
    match page {
        PAGE_MANUFACTURER_INFO => decode_manufacturer_info(data, common),
        PAGE_PRODUCT_INFO => decode_product_info(data, common),
        PAGE_BATTERY_STATUS => decode_battery_status(data, common),
        PAGE_DATE_TIME => decode_date_time(data, common),
        _ => return false,
    }
    true
}
