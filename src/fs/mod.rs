//! ANT-FS: the file-transfer protocol layered on one ANT channel.
//!
//! [`beacon`] and [`command`] cover the wire frames, [`commandpipe`] the
//! packets tunneled through file index 0xFFFE, [`file`] the directory
//! format, and [`session`] the state machine that drives it all.

pub mod beacon;
pub mod command;
pub mod commandpipe;
pub mod crc;
pub mod file;
pub mod session;

pub use beacon::{Beacon, ClientDeviceState};
pub use command::{Command, CommandResponse};
pub use file::{Directory, File};
pub use session::{Session, SessionConfig};
