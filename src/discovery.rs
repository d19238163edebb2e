use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use btleplug::api::{BDAddr, Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Service-data record UUID carried by Tuya advertisements (16-bit 0xA201).
pub const SERVICE_DATA_UUID: Uuid = Uuid::from_u128(0x0000a201_0000_1000_8000_00805f9b34fb);
/// Tuya company identifier in manufacturer-specific data.
pub const MANUFACTURER_ID: u16 = 0x07D0;

// Manufacturer data layout: flags(1) | version(1) | reserved(4) | encrypted uuid(16)
const ENCRYPTED_UUID_OFFSET: usize = 6;
const UUID_LEN: usize = 16;

// -- Data types --

/// Identity extracted from a Tuya advertisement during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub local_name: String,
    pub address: BDAddr,
    pub is_bound: bool,
    pub protocol_version: u8,
    pub uuid: [u8; UUID_LEN],
    pub rssi: Option<i16>,
}

#[derive(Debug)]
pub enum DiscoveryError {
    Adapter(btleplug::Error),
    DeviceNotFound(BDAddr),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Adapter(e) => write!(f, "Bluetooth adapter error: {e}"),
            DiscoveryError::DeviceNotFound(addr) => write!(f, "Device {addr} not found"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<btleplug::Error> for DiscoveryError {
    fn from(e: btleplug::Error) -> Self {
        DiscoveryError::Adapter(e)
    }
}

// -- Pure functions: advertisement decoding --

/// Decrypt the device UUID carried in manufacturer data. The key is
/// MD5 of the advertised product id and doubles as the IV.
fn decrypt_uuid(product_id: &[u8], ciphertext: &[u8]) -> Option<[u8; UUID_LEN]> {
    let key = Md5::digest(product_id);
    let mut block = [0u8; UUID_LEN];
    block.copy_from_slice(ciphertext);
    Aes128CbcDec::new_from_slices(&key, &key)
        .ok()?
        .decrypt_padded_mut::<NoPadding>(&mut block)
        .ok()?;
    Some(block)
}

/// Extract a Tuya device from advertisement properties. Returns `None` for
/// non-Tuya or malformed advertisements; scanning filters, it never fails.
pub fn parse_advertisement(
    properties: &btleplug::api::PeripheralProperties,
) -> Option<DiscoveredDevice> {
    let service_data = properties.service_data.get(&SERVICE_DATA_UUID)?;
    if service_data.is_empty() {
        return None;
    }
    let product_id = &service_data[1..];

    let manufacturer_data = properties.manufacturer_data.get(&MANUFACTURER_ID)?;
    if manufacturer_data.len() < ENCRYPTED_UUID_OFFSET + UUID_LEN {
        return None;
    }

    let ciphertext = &manufacturer_data[ENCRYPTED_UUID_OFFSET..ENCRYPTED_UUID_OFFSET + UUID_LEN];
    let uuid = decrypt_uuid(product_id, ciphertext)?;

    Some(DiscoveredDevice {
        local_name: properties.local_name.clone().unwrap_or_default(),
        address: properties.address,
        is_bound: manufacturer_data[0] & 0x80 != 0,
        protocol_version: manufacturer_data[1],
        uuid,
        rssi: properties.rssi,
    })
}

// -- Discoverer --

/// Scans for Tuya devices on a given Bluetooth adapter. Devices seen during
/// the session are cached by address.
pub struct Discoverer {
    adapter: Adapter,
    cache: Arc<Mutex<HashMap<BDAddr, DiscoveredDevice>>>,
}

impl Discoverer {
    pub fn new(adapter: Adapter) -> Self {
        Discoverer {
            adapter,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start scanning and return a lazy stream of discoveries. Each device
    /// is yielded at most once per call; dropping the stream stops the
    /// pump (the scan itself keeps running until [`stop`](Self::stop)).
    pub async fn discover(&self) -> Result<ReceiverStream<DiscoveredDevice>, DiscoveryError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let mut events = self.adapter.events().await?;

        let adapter = self.adapter.clone();
        let cache = Arc::clone(&self.cache);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut seen: HashSet<BDAddr> = HashSet::new();
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. } => id,
                    _ => continue,
                };

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let Some(device) = parse_advertisement(&properties) else {
                    continue;
                };

                cache
                    .lock()
                    .expect("discovery cache lock poisoned")
                    .insert(device.address, device.clone());

                if !seen.insert(device.address) {
                    continue;
                }

                tracing::debug!(
                    address = %device.address,
                    local_name = %device.local_name,
                    "Discovered device"
                );

                if tx.send(device).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Stop the underlying scan.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    /// Last discovery record seen for `address`, if any.
    pub fn cached(&self, address: BDAddr) -> Option<DiscoveredDevice> {
        self.cache
            .lock()
            .expect("discovery cache lock poisoned")
            .get(&address)
            .cloned()
    }

    /// Scan until `address` is seen or `deadline` expires.
    pub async fn find(
        &self,
        address: BDAddr,
        deadline: Duration,
    ) -> Result<DiscoveredDevice, DiscoveryError> {
        if let Some(device) = self.cached(address) {
            return Ok(device);
        }

        let mut stream = self.discover().await?;
        let result = tokio::time::timeout(deadline, async {
            while let Some(device) = stream.next().await {
                if device.address == address {
                    return Some(device);
                }
            }
            None
        })
        .await;

        if let Err(e) = self.stop().await {
            tracing::debug!(error = %e, "Failed to stop scan after find");
        }

        match result {
            Ok(Some(device)) => Ok(device),
            _ => Err(DiscoveryError::DeviceNotFound(address)),
        }
    }

    /// Resolve a known address to a connectable peripheral handle.
    pub async fn peripheral(&self, address: BDAddr) -> Result<Peripheral, DiscoveryError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == address {
                return Ok(peripheral);
            }
        }
        Err(DiscoveryError::DeviceNotFound(address))
    }
}
