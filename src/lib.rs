//! Host-side client for the ScientISST Sense biosignal acquisition device.
//!
//! This crate speaks the Sense command/response protocol over a Bluetooth
//! RFCOMM link: version query, live/simulated acquisition, channel/rate
//! configuration, trigger and DAC control, and the CRC-4-checked frame
//! stream produced while acquiring. The device must already be paired and
//! trusted; this crate does not perform discovery or pairing.
//!
//! [`Session`] is the entry point. It is generic over any [`transport::Transport`]
//! implementor, so the real [`bluetooth::BluetoothConnector`]-backed RFCOMM
//! link and an in-memory test double share the same state machine.

mod bluetooth;
mod codec;
mod errors;
mod session;
mod transport;

pub use bluetooth::{BluetoothConnector, RfcommStream};
pub use codec::{ApiMode, Channel, Frame};
pub use errors::{BluetoothError, Result, SenseError};
pub use session::{find, BondedDevice, Session};
pub use transport::{DuplexStream, ScientisstTransport, Transport};
