//! ANT+ device profile support: the decoder interface, the page data
//! variants decoders emit, and the channel parameters each profile uses.
//!
//! Decoders are collaborators of the core: an application creates a channel
//! with a profile's parameters, feeds the 8-byte pages from the broadcast
//! callback into a decoder, and receives typed [`PageData`] values. Common
//! pages 80-83 are peeled off and folded into [`common::CommonData`] before
//! device-specific decoding runs.

pub mod bike_speed_cadence;
pub mod common;
pub mod fitness_equipment;
pub mod heart_rate;
pub mod power;

use crate::channel::ChannelConfig;
use common::{decode_common_page, CommonData};

/// A decoded data page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageData {
    HeartRate { bpm: u8 },
    Power { watts: u16, pedal_balance: Option<u8> },
    Cadence { rpm: f32 },
    Speed { kmh: f32 },
}

/// A device profile's page decoder. Implementations keep whatever state the
/// profile's cumulative counters need.
pub trait ProfileDecoder: Send {
    fn common(&self) -> &CommonData;
    fn common_mut(&mut self) -> &mut CommonData;

    /// Decode a device-specific page. Common pages never reach this.
    fn decode_device_page(&mut self, page: u8, data: &[u8; 8]) -> Vec<PageData>;

    /// Decode one received page, routing common pages into the shared
    /// [`CommonData`] first.
    fn decode(&mut self, data: &[u8; 8]) -> Vec<PageData> {
        let page = data[0];
        if decode_common_page(page, data, self.common_mut()) {
            return Vec::new();
        }
        self.decode_device_page(page, data)
    }
}

/// ANT+ device profile identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    PowerMeter,
    FitnessEquipment,
    ControlsDevice,
    BloodPressure,
    Geocache,
    Environment,
    TirePressureMonitor,
    WeightScale,
    HeartRate,
    BikeSpeedCadence,
    BikeCadence,
    BikeSpeed,
    StrideSpeed,
    Lev,
    Radar,
    Shifting,
    DropperSeatpost,
    Unknown,
}

impl DeviceType {
    pub fn from_id(id: u8) -> Self {
        match id {
            11 => Self::PowerMeter,
            16 => Self::ControlsDevice,
            17 => Self::FitnessEquipment,
            18 => Self::BloodPressure,
            19 => Self::Geocache,
            20 => Self::Lev,
            25 => Self::Environment,
            34 => Self::Shifting,
            40 => Self::Radar,
            48 => Self::TirePressureMonitor,
            115 => Self::DropperSeatpost,
            119 => Self::WeightScale,
            120 => Self::HeartRate,
            121 => Self::BikeSpeedCadence,
            122 => Self::BikeCadence,
            123 => Self::BikeSpeed,
            124 => Self::StrideSpeed,
            _ => Self::Unknown,
        }
    }
}

/// Channel parameters for one ANT+ profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub device_type: u8,
    pub period: u16,
    pub rf_frequency: u8,
}

impl Profile {
    /// A slave channel configuration for this profile. Device number 0
    /// searches for any master.
    pub fn channel_config(&self, device_number: u16, transmission_type: u8) -> ChannelConfig {
        ChannelConfig {
            device_number,
            device_type: self.device_type,
            transmission_type,
            period: self.period,
            rf_frequency: self.rf_frequency,
            ..ChannelConfig::default()
        }
    }
}

pub const HEART_RATE: Profile = Profile {
    device_type: 120,
    period: 8070,
    rf_frequency: 57,
};

pub const POWER_METER: Profile = Profile {
    device_type: 11,
    period: 8182,
    rf_frequency: 57,
};

pub const BIKE_SPEED_CADENCE: Profile = Profile {
    device_type: 121,
    period: 8086,
    rf_frequency: 57,
};

pub const BIKE_CADENCE: Profile = Profile {
    device_type: 122,
    period: 8102,
    rf_frequency: 57,
};

pub const BIKE_SPEED: Profile = Profile {
    device_type: 123,
    period: 8118,
    rf_frequency: 57,
};

pub const FITNESS_EQUIPMENT: Profile = Profile {
    device_type: 17,
    period: 8192,
    rf_frequency: 57,
};
