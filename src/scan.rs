//! Promiscuous scanning: one channel opened in RX scan mode with a wildcard
//! ID and extended messages enabled harvests the identity of every nearby
//! master from the extended receive headers.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::StoreError;
use crate::message::EXT_FLAG_CHANNEL_ID;
use crate::profiles::common::{decode_common_page, CommonData, PAGE_MANUFACTURER_INFO, PAGE_PRODUCT_INFO};
use crate::profiles::DeviceType;

/// `(device_number, device_type, transmission_type)` as carried in the
/// extended receive header.
pub type DeviceTuple = (u16, u8, u8);

type FoundCallback = Box<dyn FnMut(DeviceTuple) + Send>;
type UpdateCallback = Box<dyn FnMut(DeviceTuple, &CommonData) + Send>;

/// De-duplicating harvester of extended broadcasts. Feed it the payloads
/// from a scan channel's broadcast callback:
///
/// ```ignore
/// let mut scanner = Scanner::new();
/// scanner.set_on_found(|dev| println!("found {:?}", dev));
/// channel.on_broadcast(move |data| scanner.handle(data));
/// channel.open_rx_scan_mode()?;
/// ```
#[derive(Default)]
pub struct Scanner {
    found: HashSet<DeviceTuple>,
    common: HashMap<String, CommonData>,
    on_found: Option<FoundCallback>,
    on_update: Option<UpdateCallback>,
}

fn device_key(device_number: u16, device_type: u8) -> String {
    format!("{}:{}", device_number, device_type)
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback fired exactly once per newly observed device.
    pub fn set_on_found(&mut self, f: impl FnMut(DeviceTuple) + Send + 'static) {
        self.on_found = Some(Box::new(f));
    }

    /// Callback fired whenever a device's common pages change what we know.
    pub fn set_on_update(&mut self, f: impl FnMut(DeviceTuple, &CommonData) + Send + 'static) {
        self.on_update = Some(Box::new(f));
    }

    /// Process one broadcast payload: the 8-byte page plus the extended
    /// header. Payloads without an extended channel-ID header are ignored.
    pub fn handle(&mut self, data: &[u8]) {
        if data.len() < 13 || data[8] & EXT_FLAG_CHANNEL_ID == 0 {
            return;
        }
        let device_number = u16::from_le_bytes([data[9], data[10]]);
        let device_type = data[11];
        let transmission_type = data[12];
        let device = (device_number, device_type, transmission_type);

        let key = device_key(device_number, device_type);
        if self.found.insert(device) {
            info!(
                "found new device {:?} ({:?})",
                device,
                DeviceType::from_id(device_type)
            );
            self.common.insert(key.clone(), CommonData::default());
            if let Some(callback) = self.on_found.as_mut() {
                callback(device);
            }
        }

        let page = data[0];
        if page != PAGE_MANUFACTURER_INFO && page != PAGE_PRODUCT_INFO {
            return;
        }
        let Ok(page_bytes) = <[u8; 8]>::try_from(&data[..8]) else {
            return;
        };
        let entry = self.common.entry(key).or_default();
        let before = entry.clone();
        decode_common_page(page, &page_bytes, entry);
        if *entry != before {
            info!("device {:?} common info updated: {:?}", device, entry);
            if let Some(callback) = self.on_update.as_mut() {
                callback(device, entry);
            }
        }
    }

    /// Devices observed so far.
    pub fn found(&self) -> impl Iterator<Item = &DeviceTuple> {
        self.found.iter()
    }

    /// Last known common info for a device.
    pub fn common(&self, device_number: u16, device_type: u8) -> Option<&CommonData> {
        self.common.get(&device_key(device_number, device_type))
    }

    /// Save the session's devices into `path`, merging with any devices
    /// already recorded there.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let mut store = if path.exists() {
            DeviceStore::load(path)?
        } else {
            DeviceStore::default()
        };

        for &(device_number, device_type, transmission_type) in &self.found {
            let key = device_key(device_number, device_type);
            if store.devices.iter().any(|d| d.key() == key) {
                continue;
            }
            let serial = self
                .common
                .get(&key)
                .and_then(|common| common.serial_number);
            store.devices.push(DeviceRecord {
                device: format!("{:?}", DeviceType::from_id(device_type)),
                id: device_number,
                device_type,
                transmission_type,
                serial,
            });
        }

        store.save(path)
    }
}

/// One persisted device, keyed by `device_id:device_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device: String,
    pub id: u16,
    #[serde(rename = "type")]
    pub device_type: u8,
    pub transmission_type: u8,
    pub serial: Option<u32>,
}

impl DeviceRecord {
    pub fn key(&self) -> String {
        device_key(self.id, self.device_type)
    }
}

/// The on-disk scanner store.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStore {
    pub devices: Vec<DeviceRecord>,
}

impl DeviceStore {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!("device store {} unreadable: {}", path.display(), e);
                Err(e.into())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// 8-byte page + extended header for a device.
    fn extended_payload(page: [u8; 8], device: DeviceTuple) -> Vec<u8> {
        let mut data = page.to_vec();
        data.push(0x80);
        data.extend_from_slice(&device.0.to_le_bytes());
        data.push(device.1);
        data.push(device.2);
        data
    }

    #[test]
    fn on_found_fires_exactly_once() {
        let mut scanner = Scanner::new();
        let (tx, rx) = mpsc::channel();
        scanner.set_on_found(move |dev| tx.send(dev).unwrap());

        // Trailing bytes 80 12 34 78 05: device 0x3412, type 0x78, trans 0x05
        let payload = extended_payload([0, 0, 0, 0, 0, 0, 0, 0], (0x3412, 0x78, 0x05));
        scanner.handle(&payload);
        scanner.handle(&payload);
        scanner.handle(&payload);

        assert_eq!(rx.try_recv().unwrap(), (0x3412, 0x78, 0x05));
        assert!(rx.try_recv().is_err(), "repeat frames must not re-fire");
        assert_eq!(scanner.found().count(), 1);
    }

    #[test]
    fn distinct_devices_each_fire() {
        let mut scanner = Scanner::new();
        scanner.handle(&extended_payload([0; 8], (100, 120, 1)));
        scanner.handle(&extended_payload([0; 8], (100, 121, 1)));
        scanner.handle(&extended_payload([0; 8], (101, 120, 1)));
        assert_eq!(scanner.found().count(), 3);
    }

    #[test]
    fn short_or_plain_broadcasts_ignored() {
        let mut scanner = Scanner::new();
        scanner.handle(&[0, 0, 0, 0, 0, 0, 0, 0]);
        let mut no_flag = extended_payload([0; 8], (1, 2, 3));
        no_flag[8] = 0x00;
        scanner.handle(&no_flag);
        assert_eq!(scanner.found().count(), 0);
    }

    #[test]
    fn common_pages_update_device_info() {
        let mut scanner = Scanner::new();
        let (tx, rx) = mpsc::channel();
        scanner.set_on_update(move |dev, common| {
            tx.send((dev, common.clone())).unwrap();
        });

        let device = (500, 120, 5);
        scanner.handle(&extended_payload([0x04, 0, 0, 0, 0, 0, 0, 90], device));

        // Manufacturer info page
        scanner.handle(&extended_payload(
            [0x50, 0xFF, 0xFF, 3, 0x89, 0x00, 0x34, 0x12],
            device,
        ));
        let (dev, common) = rx.try_recv().unwrap();
        assert_eq!(dev, device);
        assert_eq!(common.manufacturer_id, Some(137));

        // Same page again: no change, no callback
        scanner.handle(&extended_payload(
            [0x50, 0xFF, 0xFF, 3, 0x89, 0x00, 0x34, 0x12],
            device,
        ));
        assert!(rx.try_recv().is_err());

        // Product info page adds the serial
        scanner.handle(&extended_payload(
            [0x51, 0xFF, 5, 3, 0x78, 0x56, 0x34, 0x12],
            device,
        ));
        let (_, common) = rx.try_recv().unwrap();
        assert_eq!(common.serial_number, Some(0x12345678));
        assert_eq!(
            scanner.common(500, 120).unwrap().serial_number,
            Some(0x12345678)
        );
    }

    #[test]
    fn save_and_reload_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        let mut scanner = Scanner::new();
        let device = (4660, 120, 5);
        scanner.handle(&extended_payload([0x04, 0, 0, 0, 0, 0, 0, 80], device));
        scanner.handle(&extended_payload(
            [0x51, 0xFF, 5, 3, 0x78, 0x56, 0x34, 0x12],
            device,
        ));
        scanner.save(&path).unwrap();

        let store = DeviceStore::load(&path).unwrap();
        assert_eq!(store.devices.len(), 1);
        assert_eq!(store.devices[0].device, "HeartRate");
        assert_eq!(store.devices[0].id, 4660);
        assert_eq!(store.devices[0].device_type, 120);
        assert_eq!(store.devices[0].serial, Some(0x12345678));

        // Saving a different session merges instead of clobbering
        let mut second = Scanner::new();
        second.handle(&extended_payload([0; 8], (777, 11, 1)));
        second.save(&path).unwrap();

        let store = DeviceStore::load(&path).unwrap();
        assert_eq!(store.devices.len(), 2);
        assert!(store.devices.iter().any(|d| d.id == 4660));
        assert!(store.devices.iter().any(|d| d.id == 777 && d.device == "PowerMeter"));
    }
}
