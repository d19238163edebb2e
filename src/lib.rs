//! Client library for Tuya Bluetooth Low Energy devices.
//!
//! Discovery decrypts the device identity carried in BLE advertisements;
//! [`Device`] then drives the encrypted session over GATT: pairing, typed
//! data-point reads/writes and device-initiated requests.

pub mod assembler;
pub mod datapoint;
pub mod device;
pub mod discovery;
pub mod packet;
pub mod store;
pub mod transaction;
pub mod varint;

pub use datapoint::{DataPoint, DataPointError, DpType, DpValue};
pub use device::{Device, DeviceError};
pub use discovery::{DiscoveredDevice, Discoverer, DiscoveryError};
pub use packet::{Packet, PacketError, SecurityFlag};
pub use store::{Credential, CredentialStore, StoreError, TomlStore};
pub use transaction::Transaction;
