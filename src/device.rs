use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use btleplug::api::{Characteristic, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::{Stream, StreamExt};
use md5::{Digest, Md5};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use uuid::Uuid;

use crate::assembler::Assembler;
use crate::datapoint::{self, DataPoint, DataPointError};
use crate::packet::{self, Packet, PacketError, SecurityFlag};
use crate::varint;

pub const BLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(25);
pub const RESPONSE_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fixed GATT MTU; the protocol does not negotiate it.
pub const GATT_MTU: usize = 20;

pub const CHARACTERISTIC_NOTIFY: Uuid = Uuid::from_u128(0x00002b10_0000_1000_8000_00805f9b34fb);
pub const CHARACTERISTIC_WRITE: Uuid = Uuid::from_u128(0x00002b11_0000_1000_8000_00805f9b34fb);

const LOCAL_KEY_LEN: usize = 6;
const PAIR_PAYLOAD_LEN: usize = 44;
const DEVICE_INFO_MIN_LEN: usize = 46;

// -- Errors --

#[derive(Debug)]
pub enum DeviceError {
    NotConnected,
    AlreadyConnected,
    AlreadyPaired,
    SessionFailed,
    Disconnected,
    ConnectTimeout,
    MissingCharacteristic,
    InvalidLocalKey(usize),
    MissingKey(SecurityFlag),
    MalformedDeviceInfo(usize),
    PairingRejected(u8),
    CommandFailed(u8),
    ShortResponse,
    ResponseTimeout(u32),
    Transport(btleplug::Error),
    Packet(PacketError),
    DataPoint(DataPointError),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotConnected => write!(f, "Device is not connected"),
            DeviceError::AlreadyConnected => write!(f, "Device is already connected"),
            DeviceError::AlreadyPaired => write!(f, "Device is already paired"),
            DeviceError::SessionFailed => {
                write!(f, "Session has failed; reconnect to recover")
            }
            DeviceError::Disconnected => write!(f, "Connection lost while waiting for response"),
            DeviceError::ConnectTimeout => write!(f, "Connection attempt timed out"),
            DeviceError::MissingCharacteristic => {
                write!(f, "Required characteristics not found")
            }
            DeviceError::InvalidLocalKey(len) => {
                write!(f, "Local key must be at least {LOCAL_KEY_LEN} bytes, got {len}")
            }
            DeviceError::MissingKey(flag) => {
                write!(f, "No key available for security flag {flag:?}")
            }
            DeviceError::MalformedDeviceInfo(len) => {
                write!(f, "Device info response too short: {len} bytes")
            }
            DeviceError::PairingRejected(code) => {
                write!(f, "Pairing failed with error code: {code}")
            }
            DeviceError::CommandFailed(code) => {
                write!(f, "Command failed with error code: {code}")
            }
            DeviceError::ShortResponse => write!(f, "Response too short"),
            DeviceError::ResponseTimeout(seq) => {
                write!(f, "Timeout waiting for response to seq {seq}")
            }
            DeviceError::Transport(e) => write!(f, "BLE transport error: {e}"),
            DeviceError::Packet(e) => write!(f, "Packet error: {e}"),
            DeviceError::DataPoint(e) => write!(f, "Data point error: {e}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<btleplug::Error> for DeviceError {
    fn from(e: btleplug::Error) -> Self {
        DeviceError::Transport(e)
    }
}

impl From<PacketError> for DeviceError {
    fn from(e: PacketError) -> Self {
        DeviceError::Packet(e)
    }
}

impl From<DataPointError> for DeviceError {
    fn from(e: DataPointError) -> Self {
        DeviceError::DataPoint(e)
    }
}

// -- Correlation table --

// One single-shot delivery slot per outbound sequence number. The slot is
// removed on fulfilment or timeout, whichever comes first; duplicate
// fulfilment finds no slot and is discarded.
#[derive(Debug, Default)]
struct ResponseTable {
    slots: std::sync::Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
}

impl ResponseTable {
    fn insert(&self, seq_num: u32) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.slots
            .lock()
            .expect("response table lock poisoned")
            .insert(seq_num, tx);
        rx
    }

    fn fulfill(&self, seq_num: u32, payload: Vec<u8>) -> bool {
        let sender = self
            .slots
            .lock()
            .expect("response table lock poisoned")
            .remove(&seq_num);
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    fn remove(&self, seq_num: u32) {
        self.slots
            .lock()
            .expect("response table lock poisoned")
            .remove(&seq_num);
    }

    // Dropping the senders wakes every waiter with a channel-closed error.
    fn cancel_all(&self) {
        self.slots
            .lock()
            .expect("response table lock poisoned")
            .clear();
    }
}

// -- Session state --

#[derive(Debug, Default)]
struct SessionKeys {
    session_key: Option<[u8; 16]>,
    auth_key: Option<[u8; 32]>,
}

struct Shared {
    peripheral: Peripheral,
    uuid: String,
    device_id: String,
    local_key: [u8; LOCAL_KEY_LEN],
    login_key: [u8; 16],
    keys: std::sync::Mutex<SessionKeys>,
    write_char: std::sync::Mutex<Option<Characteristic>>,
    notify_char: std::sync::Mutex<Option<Characteristic>>,
    seq_num: AtomicU32,
    send_lock: AsyncMutex<()>,
    responses: ResponseTable,
    datapoints: std::sync::Mutex<HashMap<u8, DataPoint>>,
    connected: AtomicBool,
    paired: AtomicBool,
    failed: AtomicBool,
    protocol_version: AtomicU8,
    flags: AtomicU8,
    is_bound: AtomicBool,
}

/// A Tuya BLE device session: owns the GATT link, the pairing state machine
/// and the request/response correlation over it.
pub struct Device {
    shared: Arc<Shared>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.shared.device_id)
            .field("connected", &self.shared.connected.load(Ordering::SeqCst))
            .field("paired", &self.shared.paired.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// -- Pure functions: key derivation --

fn derive_login_key(local_key: &[u8; LOCAL_KEY_LEN]) -> [u8; 16] {
    Md5::digest(local_key).into()
}

fn derive_session_key(local_key: &[u8; LOCAL_KEY_LEN], srand: &[u8; 6]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(local_key);
    md5.update(srand);
    md5.finalize().into()
}

// -- Pure functions: handshake payloads --

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceInfo {
    protocol_version: u8,
    flags: u8,
    is_bound: bool,
    srand: [u8; 6],
    auth_key: [u8; 32],
}

fn parse_device_info(data: &[u8]) -> Result<DeviceInfo, DeviceError> {
    if data.len() < DEVICE_INFO_MIN_LEN {
        return Err(DeviceError::MalformedDeviceInfo(data.len()));
    }
    let mut srand = [0u8; 6];
    srand.copy_from_slice(&data[6..12]);
    let mut auth_key = [0u8; 32];
    auth_key.copy_from_slice(&data[14..46]);
    Ok(DeviceInfo {
        protocol_version: data[2],
        flags: data[4],
        is_bound: data[5] != 0,
        srand,
        auth_key,
    })
}

/// Pairing request payload: `uuid_ascii(16) || local_key(6) || device_id(20)`
/// zero-padded to 44 bytes. The UUID travels in its ASCII form.
fn pair_payload(uuid: &str, local_key: &[u8; LOCAL_KEY_LEN], device_id: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAIR_PAYLOAD_LEN);
    payload.extend_from_slice(uuid.as_bytes());
    payload.extend_from_slice(local_key);
    payload.extend_from_slice(device_id.as_bytes());
    while payload.len() < PAIR_PAYLOAD_LEN {
        payload.push(0x00);
    }
    payload
}

fn check_pair_response(payload: &[u8]) -> Result<(), DeviceError> {
    match payload.first() {
        None => Err(DeviceError::ShortResponse),
        Some(0) | Some(2) => Ok(()),
        Some(code) => Err(DeviceError::PairingRejected(*code)),
    }
}

fn check_result(payload: &[u8]) -> Result<(), DeviceError> {
    match payload.first() {
        None => Err(DeviceError::ShortResponse),
        Some(0) => Ok(()),
        Some(code) => Err(DeviceError::CommandFailed(*code)),
    }
}

/// Timestamp response to a TIME1 request: the milliseconds since the epoch
/// in ASCII, then the UTC offset in units of 36 seconds as a big-endian i16.
fn time1_payload(timestamp_ms: i64, utc_offset_seconds: i32) -> Vec<u8> {
    let mut payload = timestamp_ms.to_string().into_bytes();
    let timezone = (utc_offset_seconds / 36) as i16;
    payload.extend_from_slice(&timezone.to_be_bytes());
    payload
}

// -- Pure functions: outbound fragmentation --

/// Split an encrypted packet into GATT-MTU-sized fragments. Fragment 0 is
/// prefixed with `varint(0) || varint(total_len) || version << 4`, later
/// fragments with their varint fragment number.
fn split_fragments(data: &[u8], protocol_version: u8) -> Vec<Vec<u8>> {
    let mut fragments = Vec::new();
    let mut fragment_num = 0usize;
    let mut pos = 0usize;

    while pos < data.len() {
        let mut fragment = varint::pack(fragment_num);
        if fragment_num == 0 {
            fragment.extend_from_slice(&varint::pack(data.len()));
            fragment.push(protocol_version << 4);
        }

        let remaining = GATT_MTU.saturating_sub(fragment.len());
        if remaining == 0 {
            break;
        }
        let end = (pos + remaining).min(data.len());
        fragment.extend_from_slice(&data[pos..end]);
        pos = end;
        fragments.push(fragment);
        fragment_num += 1;
    }

    fragments
}

// -- Device --

impl Device {
    /// Create a session for a device. `uuid` is the 16-character device
    /// UUID, `device_id` the 20-character device id; at least the first 6
    /// bytes of `local_key` are required.
    pub fn new(
        peripheral: Peripheral,
        uuid: &str,
        device_id: &str,
        local_key: &str,
    ) -> Result<Self, DeviceError> {
        let key_bytes = local_key.as_bytes();
        if key_bytes.len() < LOCAL_KEY_LEN {
            return Err(DeviceError::InvalidLocalKey(key_bytes.len()));
        }
        let mut local = [0u8; LOCAL_KEY_LEN];
        local.copy_from_slice(&key_bytes[..LOCAL_KEY_LEN]);

        Ok(Device {
            shared: Arc::new(Shared {
                peripheral,
                uuid: uuid.to_owned(),
                device_id: device_id.to_owned(),
                login_key: derive_login_key(&local),
                local_key: local,
                keys: std::sync::Mutex::new(SessionKeys::default()),
                write_char: std::sync::Mutex::new(None),
                notify_char: std::sync::Mutex::new(None),
                seq_num: AtomicU32::new(1),
                send_lock: AsyncMutex::new(()),
                responses: ResponseTable::default(),
                datapoints: std::sync::Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                paired: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                protocol_version: AtomicU8::new(3),
                flags: AtomicU8::new(0),
                is_bound: AtomicBool::new(false),
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_paired(&self) -> bool {
        self.shared.paired.load(Ordering::SeqCst)
    }

    pub fn is_bound(&self) -> bool {
        self.shared.is_bound.load(Ordering::SeqCst)
    }

    pub fn protocol_version(&self) -> u8 {
        self.shared.protocol_version.load(Ordering::SeqCst)
    }

    /// Capability flags from the device-info response.
    pub fn flags(&self) -> u8 {
        self.shared.flags.load(Ordering::SeqCst)
    }

    /// Open the GATT link, discover the write/notify characteristics,
    /// subscribe and start the inbound pipeline.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let shared = &self.shared;
        if shared.connected.load(Ordering::SeqCst) {
            if !shared.failed.load(Ordering::SeqCst) {
                return Err(DeviceError::AlreadyConnected);
            }
            // A failed session may leave the link half-open; tear it down
            // before reconnecting.
            self.disconnect().await?;
        }

        tracing::info!(address = %shared.peripheral.address(), "Connecting to device");
        tokio::time::timeout(BLE_CONNECT_TIMEOUT, shared.peripheral.connect())
            .await
            .map_err(|_| DeviceError::ConnectTimeout)??;

        tracing::info!("Discovering services");
        match self.setup_link().await {
            Ok(notifications) => {
                shared.seq_num.store(1, Ordering::SeqCst);
                shared.failed.store(false, Ordering::SeqCst);
                shared.connected.store(true, Ordering::SeqCst);
                self.start_pipeline(notifications);
                Ok(())
            }
            Err(e) => {
                // Leave no half-open link behind.
                if let Err(disconnect_err) = shared.peripheral.disconnect().await {
                    tracing::debug!(error = %disconnect_err, "Cleanup disconnect failed");
                }
                Err(e)
            }
        }
    }

    async fn setup_link(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>, DeviceError> {
        let shared = &self.shared;

        shared.peripheral.discover_services().await?;
        let characteristics = shared.peripheral.characteristics();
        let write = characteristics
            .iter()
            .find(|c| c.uuid == CHARACTERISTIC_WRITE)
            .cloned();
        let notify = characteristics
            .iter()
            .find(|c| c.uuid == CHARACTERISTIC_NOTIFY)
            .cloned();
        let (Some(write), Some(notify)) = (write, notify) else {
            return Err(DeviceError::MissingCharacteristic);
        };

        tracing::info!("Subscribing to notifications");
        let notifications = shared.peripheral.notifications().await?;
        shared.peripheral.subscribe(&notify).await?;

        *shared.write_char.lock().expect("characteristic lock poisoned") = Some(write);
        *shared.notify_char.lock().expect("characteristic lock poisoned") = Some(notify);

        Ok(notifications)
    }

    fn start_pipeline(&self, notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>) {
        // Tasks from an earlier session have long since exited; drop their
        // handles so the list does not grow across reconnects.
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }

        let (incoming_tx, incoming_rx) = mpsc::channel::<Vec<u8>>(100);
        let (assembled_tx, mut assembled_rx) = mpsc::channel::<Vec<u8>>(100);

        // Notification pump: raw fragments into the assembler, in arrival
        // order. The stream ending means the link is gone.
        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(notification) = notifications.next().await {
                if notification.uuid != CHARACTERISTIC_NOTIFY {
                    continue;
                }
                if incoming_tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            if shared.connected.swap(false, Ordering::SeqCst) {
                tracing::warn!("Link dropped");
                shared.failed.store(true, Ordering::SeqCst);
                shared.responses.cancel_all();
            }
        });

        let driver = tokio::spawn(Assembler::new().run(incoming_rx, assembled_tx));

        let shared = Arc::clone(&self.shared);
        let dispatcher = tokio::spawn(async move {
            while let Some(message) = assembled_rx.recv().await {
                dispatch(&shared, &message);
            }
        });

        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .extend([pump, driver, dispatcher]);
    }

    /// Execute the pairing handshake and run an initial status sync.
    pub async fn pair(&self) -> Result<(), DeviceError> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::NotConnected);
        }
        if shared.paired.load(Ordering::SeqCst) {
            return Err(DeviceError::AlreadyPaired);
        }

        tracing::info!("Starting pairing process");

        let response =
            send_request(shared, packet::CMD_DEVICE_INFO, Vec::new(), SecurityFlag::Login).await?;
        let info = match parse_device_info(&response) {
            Ok(info) => info,
            Err(e) => {
                shared.failed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        shared.protocol_version.store(info.protocol_version, Ordering::SeqCst);
        shared.flags.store(info.flags, Ordering::SeqCst);
        shared.is_bound.store(info.is_bound, Ordering::SeqCst);
        {
            let mut keys = shared.keys.lock().expect("key lock poisoned");
            keys.session_key = Some(derive_session_key(&shared.local_key, &info.srand));
            keys.auth_key = Some(info.auth_key);
        }

        let payload = pair_payload(&shared.uuid, &shared.local_key, &shared.device_id);
        let response =
            send_request(shared, packet::CMD_PAIR, payload, SecurityFlag::Session).await?;
        if let Err(e) = check_pair_response(&response) {
            shared.failed.store(true, Ordering::SeqCst);
            return Err(e);
        }

        shared.paired.store(true, Ordering::SeqCst);
        tracing::info!("Pairing successful, syncing datapoints");

        self.update().await
    }

    /// Request a status refresh. Data-point values arrive asynchronously as
    /// DP reports once the device acks the request.
    pub async fn update(&self) -> Result<(), DeviceError> {
        send_request(
            &self.shared,
            packet::CMD_STATUS,
            Vec::new(),
            SecurityFlag::Session,
        )
        .await?;
        Ok(())
    }

    /// Last value reported for a data point, if any.
    pub fn get_datapoint(&self, id: u8) -> Option<DataPoint> {
        self.shared
            .datapoints
            .lock()
            .expect("datapoint cache lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Snapshot of all cached data points, ordered by id.
    pub fn datapoints(&self) -> Vec<DataPoint> {
        let mut datapoints: Vec<DataPoint> = self
            .shared
            .datapoints
            .lock()
            .expect("datapoint cache lock poisoned")
            .values()
            .cloned()
            .collect();
        datapoints.sort_by_key(|dp| dp.id);
        datapoints
    }

    /// Write a single data point and wait for the device to report success.
    pub async fn set_datapoint(&self, datapoint: DataPoint) -> Result<(), DeviceError> {
        self.set_datapoints(std::slice::from_ref(&datapoint)).await
    }

    /// Write several data points in one request. An empty slice is a no-op.
    pub async fn set_datapoints(&self, datapoints: &[DataPoint]) -> Result<(), DeviceError> {
        if datapoints.is_empty() {
            return Ok(());
        }
        let payload = datapoint::encode_all(datapoints)?;
        let response =
            send_request(&self.shared, packet::CMD_SET_DPS, payload, SecurityFlag::Session).await?;
        check_result(&response)
    }

    /// Close the GATT link, stop the inbound pipeline and cancel pending
    /// response waits. Idempotent.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let shared = &self.shared;
        if !shared.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Disconnecting from device");
        shared.paired.store(false, Ordering::SeqCst);
        *shared.keys.lock().expect("key lock poisoned") = SessionKeys::default();
        shared.responses.cancel_all();

        let notify = shared
            .notify_char
            .lock()
            .expect("characteristic lock poisoned")
            .take();
        *shared.write_char.lock().expect("characteristic lock poisoned") = None;

        if let Some(notify) = notify {
            if let Err(e) = shared.peripheral.unsubscribe(&notify).await {
                tracing::debug!(error = %e, "Failed to unsubscribe");
            }
        }
        shared.peripheral.disconnect().await?;

        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }

        Ok(())
    }
}

// -- Session internals --

fn key_for(shared: &Shared, flag: SecurityFlag) -> Result<Vec<u8>, DeviceError> {
    let keys = shared.keys.lock().expect("key lock poisoned");
    match flag {
        SecurityFlag::Login => Ok(shared.login_key.to_vec()),
        SecurityFlag::Session => keys
            .session_key
            .map(|k| k.to_vec())
            .ok_or(DeviceError::MissingKey(flag)),
        SecurityFlag::Auth => keys
            .auth_key
            .map(|k| k.to_vec())
            .ok_or(DeviceError::MissingKey(flag)),
    }
}

/// Send a request packet and wait for the matching response.
async fn send_request(
    shared: &Arc<Shared>,
    command: u16,
    payload: Vec<u8>,
    security_flag: SecurityFlag,
) -> Result<Vec<u8>, DeviceError> {
    if shared.failed.load(Ordering::SeqCst) {
        return Err(DeviceError::SessionFailed);
    }
    if !shared.connected.load(Ordering::SeqCst) {
        return Err(DeviceError::NotConnected);
    }

    let seq_num = shared.seq_num.fetch_add(1, Ordering::SeqCst);
    let receiver = shared.responses.insert(seq_num);

    let pkt = Packet::new(seq_num, 0, command, payload, security_flag);
    tracing::debug!(seq_num, command, "Sending request");

    if let Err(e) = write_packet(shared, &pkt).await {
        shared.responses.remove(seq_num);
        return Err(e);
    }

    match tokio::time::timeout(RESPONSE_WAIT_TIMEOUT, receiver).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(DeviceError::Disconnected),
        Err(_) => {
            shared.responses.remove(seq_num);
            Err(DeviceError::ResponseTimeout(seq_num))
        }
    }
}

/// Send a response to a device-initiated request. Consumes a sequence
/// number like any other outbound packet.
async fn send_response(
    shared: &Arc<Shared>,
    response_to: u32,
    command: u16,
    payload: Vec<u8>,
) -> Result<(), DeviceError> {
    let seq_num = shared.seq_num.fetch_add(1, Ordering::SeqCst);
    let pkt = Packet::new(seq_num, response_to, command, payload, SecurityFlag::Session);
    tracing::debug!(seq_num, response_to, command, "Sending response");
    write_packet(shared, &pkt).await
}

/// Encrypt, fragment and write one packet. The send lock is held across all
/// fragments so packets are never interleaved on the wire.
async fn write_packet(shared: &Arc<Shared>, pkt: &Packet) -> Result<(), DeviceError> {
    let key = key_for(shared, pkt.security_flag)?;
    let wire = packet::build_and_encrypt(pkt, &key)?;
    let fragments = split_fragments(&wire, shared.protocol_version.load(Ordering::SeqCst));

    let write_char = shared
        .write_char
        .lock()
        .expect("characteristic lock poisoned")
        .clone()
        .ok_or(DeviceError::NotConnected)?;

    let _guard = shared.send_lock.lock().await;
    for (i, fragment) in fragments.iter().enumerate() {
        tracing::trace!(fragment = i, total = fragments.len(), "Writing fragment");
        if let Err(e) = shared
            .peripheral
            .write(&write_char, fragment, WriteType::WithResponse)
            .await
        {
            shared.failed.store(true, Ordering::SeqCst);
            return Err(DeviceError::Transport(e));
        }
    }
    Ok(())
}

/// Route one reassembled logical packet: responses to their correlation
/// slot, device-initiated requests to their handlers.
fn dispatch(shared: &Arc<Shared>, data: &[u8]) {
    let flag = match packet::security_flag(data) {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping packet");
            return;
        }
    };
    let key = match key_for(shared, flag) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping packet without a usable key");
            return;
        }
    };
    let pkt = match packet::decrypt_and_parse(data, &key) {
        Ok(pkt) => pkt,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping undecodable packet");
            return;
        }
    };

    tracing::debug!(
        seq_num = pkt.seq_num,
        response_to = pkt.response_to,
        command = pkt.command,
        payload_len = pkt.payload.len(),
        "Parsed packet"
    );

    if pkt.response_to != 0 {
        if !shared.responses.fulfill(pkt.response_to, pkt.payload) {
            tracing::debug!(
                response_to = pkt.response_to,
                "Discarding late or unmatched response"
            );
        }
        return;
    }

    match pkt.command {
        packet::CMD_DP_REPORT => {
            match datapoint::parse_report(&pkt.payload) {
                Ok(datapoints) => {
                    let mut cache = shared
                        .datapoints
                        .lock()
                        .expect("datapoint cache lock poisoned");
                    for dp in datapoints {
                        tracing::debug!(id = dp.id, value = ?dp.value, "Received datapoint");
                        cache.insert(dp.id, dp);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to parse datapoints"),
            }
            spawn_response(shared, pkt.seq_num, packet::CMD_DP_REPORT, Vec::new());
        }
        packet::CMD_TIME1 => {
            let now = chrono::Local::now();
            let payload = time1_payload(now.timestamp_millis(), now.offset().local_minus_utc());
            spawn_response(shared, pkt.seq_num, packet::CMD_TIME1, payload);
        }
        packet::CMD_TIME2 => {
            tracing::debug!("Ignoring TIME2 request");
        }
        command => {
            tracing::debug!(command, "Ignoring unknown command");
        }
    }
}

fn spawn_response(shared: &Arc<Shared>, response_to: u32, command: u16, payload: Vec<u8>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(e) = send_response(&shared, response_to, command, payload).await {
            tracing::error!(error = %e, response_to, "Failed to send response");
        }
    });
}
