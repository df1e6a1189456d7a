//! Radio capability and identity data, populated from the CAPABILITIES,
//! SERIAL_NUMBER and ANT_VERSION responses requested at startup.

/// Standard options bitfield (capabilities byte 2).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StandardOptions {
    pub no_rx_channels: bool,
    pub no_tx_channels: bool,
    pub no_rx_messages: bool,
    pub no_tx_messages: bool,
    pub no_ack_messages: bool,
    pub no_burst_messages: bool,
}

impl StandardOptions {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            no_rx_channels: byte & 0x01 != 0,
            no_tx_channels: byte & 0x02 != 0,
            no_rx_messages: byte & 0x04 != 0,
            no_tx_messages: byte & 0x08 != 0,
            no_ack_messages: byte & 0x10 != 0,
            no_burst_messages: byte & 0x20 != 0,
        }
    }
}

/// Advanced options bitfield (capabilities byte 3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdvancedOptions {
    pub network_enabled: bool,
    pub serial_number_enabled: bool,
    pub per_channel_tx_power_enabled: bool,
    pub low_priority_search_enabled: bool,
    pub script_enabled: bool,
    pub search_list_enabled: bool,
}

impl AdvancedOptions {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_enabled: byte & 0x01 != 0,
            serial_number_enabled: byte & 0x08 != 0,
            per_channel_tx_power_enabled: byte & 0x10 != 0,
            low_priority_search_enabled: byte & 0x20 != 0,
            script_enabled: byte & 0x40 != 0,
            search_list_enabled: byte & 0x80 != 0,
        }
    }
}

/// Second advanced options bitfield (capabilities byte 4).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdvancedOptionsTwo {
    pub led_enabled: bool,
    pub ext_message_enabled: bool,
    pub scan_mode_enabled: bool,
    pub proximity_search_enabled: bool,
    pub ext_assign_enabled: bool,
    pub antfs_enabled: bool,
    pub fit1_enabled: bool,
}

impl AdvancedOptionsTwo {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            led_enabled: byte & 0x01 != 0,
            ext_message_enabled: byte & 0x02 != 0,
            scan_mode_enabled: byte & 0x04 != 0,
            proximity_search_enabled: byte & 0x10 != 0,
            ext_assign_enabled: byte & 0x20 != 0,
            antfs_enabled: byte & 0x40 != 0,
            fit1_enabled: byte & 0x80 != 0,
        }
    }
}

/// Third advanced options bitfield (capabilities byte 6, when present).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdvancedOptionsThree {
    pub advanced_burst_enabled: bool,
    pub event_filtering_enabled: bool,
    pub high_duty_search_enabled: bool,
    pub search_sharing_enabled: bool,
    pub selective_data_update_enabled: bool,
    pub encrypted_channel_enabled: bool,
}

impl AdvancedOptionsThree {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            advanced_burst_enabled: byte & 0x01 != 0,
            event_filtering_enabled: byte & 0x02 != 0,
            high_duty_search_enabled: byte & 0x04 != 0,
            search_sharing_enabled: byte & 0x10 != 0,
            selective_data_update_enabled: byte & 0x40 != 0,
            encrypted_channel_enabled: byte & 0x80 != 0,
        }
    }
}

/// Decoded CAPABILITIES response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_channels: u8,
    pub max_networks: u8,
    pub standard_options: StandardOptions,
    pub advanced_options: AdvancedOptions,
    pub advanced_options_two: AdvancedOptionsTwo,
    pub advanced_options_three: AdvancedOptionsThree,
    pub max_sensrcore_channels: u8,
}

impl Capabilities {
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        Some(Self {
            max_channels: data[0],
            max_networks: data[1],
            standard_options: StandardOptions::from_byte(data[2]),
            advanced_options: AdvancedOptions::from_byte(data[3]),
            advanced_options_two: AdvancedOptionsTwo::from_byte(data[4]),
            max_sensrcore_channels: data[5],
            advanced_options_three: if data.len() >= 7 {
                AdvancedOptionsThree::from_byte(data[6])
            } else {
                AdvancedOptionsThree::default()
            },
        })
    }
}

/// Identity and capability data for one radio, filled in asynchronously as
/// the startup responses arrive.
#[derive(Debug, Default, Clone)]
pub struct NodeInfo {
    pub capabilities: Option<Capabilities>,
    pub serial: Option<u32>,
    pub ant_version: Option<String>,
}

impl NodeInfo {
    /// Channel count the radio reports, or the usual 8 until it has.
    pub fn max_channels(&self) -> u8 {
        self.capabilities.map_or(8, |c| c.max_channels)
    }

    /// Network count the radio reports, or the usual 8 until it has.
    pub fn max_networks(&self) -> u8 {
        self.capabilities.map_or(8, |c| c.max_networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capabilities_response() {
        // 8 channels, 8 networks, no standard limits, network+serial advanced,
        // ext messages + scan mode + ANT-FS, no sensrcore
        let caps = Capabilities::parse(&[8, 8, 0x00, 0x09, 0x46, 0x00]).unwrap();
        assert_eq!(caps.max_channels, 8);
        assert_eq!(caps.max_networks, 8);
        assert!(!caps.standard_options.no_burst_messages);
        assert!(caps.advanced_options.network_enabled);
        assert!(caps.advanced_options.serial_number_enabled);
        assert!(caps.advanced_options_two.ext_message_enabled);
        assert!(caps.advanced_options_two.scan_mode_enabled);
        assert!(caps.advanced_options_two.antfs_enabled);
        assert_eq!(caps.max_sensrcore_channels, 0);
    }

    #[test]
    fn parse_capabilities_with_third_options_byte() {
        let caps = Capabilities::parse(&[15, 8, 0, 0, 0, 0, 0x01]).unwrap();
        assert!(caps.advanced_options_three.advanced_burst_enabled);
    }

    #[test]
    fn parse_capabilities_too_short() {
        assert!(Capabilities::parse(&[8, 8]).is_none());
    }

    #[test]
    fn node_info_defaults_before_response() {
        let info = NodeInfo::default();
        assert_eq!(info.max_channels(), 8);
        assert_eq!(info.max_networks(), 8);
    }
}
