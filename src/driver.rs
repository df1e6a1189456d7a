use rusb::{DeviceHandle, GlobalContext};
use std::time::Duration;

use crate::error::DriverError;

const DYNASTREAM_VENDOR_ID: u16 = 0x0FCF;
const ANTUSB_M_PRODUCT_ID: u16 = 0x1009;
const ANTUSB_2_PRODUCT_ID: u16 = 0x1008;

const USB_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
const USB_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Byte-level access to an ANT radio. The transport reader thread owns all
/// `read` calls and the writer side all `write` calls; implementations must
/// allow the two to run concurrently.
pub trait Driver: Send + Sync {
    /// Read whatever bytes the radio has ready into `buf` within a short
    /// timeout. Returning `Ok(0)` on timeout is normal, not an error.
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError>;

    /// Blocking write of a complete frame.
    fn write(&self, data: &[u8]) -> Result<(), DriverError>;

    /// Release the device. Safe to call more than once.
    fn close(&self);
}

/// USB bulk driver for Dynastream ANT sticks (ANTUSB2 / ANTUSB-m).
///
/// libusb is thread-safe for concurrent operations on different endpoints,
/// so read_bulk (reader thread) and write_bulk (caller threads) can run in
/// parallel without a lock.
pub struct UsbDriver {
    handle: DeviceHandle<GlobalContext>,
    endpoint_in: u8,
    endpoint_out: u8,
}

impl UsbDriver {
    /// Find and open the first ANT USB stick.
    pub fn open() -> Result<Self, DriverError> {
        let devices = rusb::devices()?;

        for device in devices.iter() {
            let desc = device.device_descriptor()?;

            if desc.vendor_id() != DYNASTREAM_VENDOR_ID
                || (desc.product_id() != ANTUSB_M_PRODUCT_ID
                    && desc.product_id() != ANTUSB_2_PRODUCT_ID)
            {
                continue;
            }

            let handle = device.open()?;

            // Detach kernel driver if attached
            if handle.kernel_driver_active(0).unwrap_or(false) {
                handle.detach_kernel_driver(0)?;
            }
            handle.claim_interface(0)?;

            // Find bulk endpoints
            let config = device.active_config_descriptor()?;
            let interface = config
                .interfaces()
                .next()
                .ok_or_else(|| DriverError::Io("no USB interfaces found".into()))?;
            let setting = interface
                .descriptors()
                .next()
                .ok_or_else(|| DriverError::Io("no interface descriptors".into()))?;

            let mut ep_in = 0u8;
            let mut ep_out = 0u8;
            for ep in setting.endpoint_descriptors() {
                match ep.direction() {
                    rusb::Direction::In => ep_in = ep.address(),
                    rusb::Direction::Out => ep_out = ep.address(),
                }
            }
            if ep_in == 0 || ep_out == 0 {
                return Err(DriverError::Io("could not find bulk endpoints".into()));
            }

            handle.reset()?;

            // Re-claim after reset
            if handle.kernel_driver_active(0).unwrap_or(false) {
                let _ = handle.detach_kernel_driver(0);
            }
            handle.claim_interface(0)?;

            log::info!(
                "opened ANT stick {:04x}:{:04x} (in {:#04x}, out {:#04x})",
                desc.vendor_id(),
                desc.product_id(),
                ep_in,
                ep_out
            );

            return Ok(Self {
                handle,
                endpoint_in: ep_in,
                endpoint_out: ep_out,
            });
        }

        Err(DriverError::NotFound)
    }

    /// Check if an ANT USB stick is present without opening it.
    pub fn is_available() -> bool {
        let Ok(devices) = rusb::devices() else {
            return false;
        };
        devices.iter().any(|d| {
            d.device_descriptor().map_or(false, |desc| {
                desc.vendor_id() == DYNASTREAM_VENDOR_ID
                    && (desc.product_id() == ANTUSB_M_PRODUCT_ID
                        || desc.product_id() == ANTUSB_2_PRODUCT_ID)
            })
        })
    }
}

impl Driver for UsbDriver {
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError> {
        match self.handle.read_bulk(self.endpoint_in, buf, USB_READ_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> Result<(), DriverError> {
        match self
            .handle
            .write_bulk(self.endpoint_out, data, USB_WRITE_TIMEOUT)
        {
            Ok(_) => Ok(()),
            Err(rusb::Error::Timeout) => Err(DriverError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        let _ = self.handle.release_interface(0);
        let _ = self.handle.attach_kernel_driver(0);
    }
}

impl Drop for UsbDriver {
    fn drop(&mut self) {
        self.close();
    }
}
