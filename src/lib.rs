//! Host-side ANT / ANT+ / ANT-FS library.
//!
//! Talks to a Dynastream USB radio (ANTUSB2 / ANTUSB-m) and exposes logical
//! channels to ANT+ sensors, master-side broadcasting, promiscuous scanning,
//! and ANT-FS file-transfer sessions.
//!
//! ```no_run
//! use antlink::{ChannelType, Node};
//! use antlink::profiles::{heart_rate::HeartRateDecoder, ProfileDecoder, HEART_RATE};
//!
//! # fn main() -> Result<(), antlink::AntError> {
//! let node = Node::open()?;
//! node.set_network_key(0, &[0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45])?;
//!
//! let channel = node.new_channel(ChannelType::BidirectionalReceive, 0, None)?;
//! channel.configure(&HEART_RATE.channel_config(0, 0))?;
//!
//! let mut decoder = HeartRateDecoder::new();
//! channel.on_broadcast(move |data| {
//!     if let Ok(page) = <[u8; 8]>::try_from(&data[..8]) {
//!         for reading in decoder.decode(&page) {
//!             println!("{:?}", reading);
//!         }
//!     }
//! });
//! channel.open()?;
//!
//! node.start(); // dispatch loop, returns after node.stop()
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod channel;
pub mod driver;
pub mod error;
pub mod fs;
pub mod message;
pub mod node;
pub mod profiles;
pub mod scan;
mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use capabilities::{Capabilities, NodeInfo};
pub use channel::{Channel, ChannelConfig, ChannelType};
pub use driver::{Driver, UsbDriver};
pub use error::{AntError, AntFsError, DriverError, StoreError};
pub use message::AntMessage;
pub use node::Node;
pub use scan::Scanner;
pub use transport::{ChannelEvent, ChannelState, Response};
