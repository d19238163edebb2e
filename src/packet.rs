use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use rand::RngCore;
use std::fmt;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const AES_BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

// Sizes of the cleartext layout: seq(4) + response_to(4) + cmd(2) + plen(2)
pub const HEADER_SIZE: usize = 12;
pub const CRC_SIZE: usize = 2;

// Command codes
pub const CMD_DEVICE_INFO: u16 = 0x0000;
pub const CMD_PAIR: u16 = 0x0001;
pub const CMD_SET_DPS: u16 = 0x0002;
pub const CMD_STATUS: u16 = 0x0003;
pub const CMD_DP_REPORT: u16 = 0x8001;
pub const CMD_TIME1: u16 = 0x8011;
pub const CMD_TIME2: u16 = 0x8012;

/// One-byte wire prefix selecting which key encrypts a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecurityFlag {
    Auth = 0x01,
    Login = 0x04,
    Session = 0x05,
}

impl SecurityFlag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SecurityFlag::Auth),
            0x04 => Some(SecurityFlag::Login),
            0x05 => Some(SecurityFlag::Session),
            _ => None,
        }
    }
}

// -- Data types --

/// A logical Tuya BLE packet, before encryption / after decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq_num: u32,
    pub response_to: u32,
    pub command: u16,
    pub payload: Vec<u8>,
    pub security_flag: SecurityFlag,
}

impl Packet {
    pub fn new(
        seq_num: u32,
        response_to: u32,
        command: u16,
        payload: Vec<u8>,
        security_flag: SecurityFlag,
    ) -> Self {
        Packet {
            seq_num,
            response_to,
            command,
            payload,
            security_flag,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    ShortPacket(usize),
    BadBlockSize(usize),
    CrcMismatch { received: u16, calculated: u16 },
    UnknownSecurityFlag(u8),
    BadKeyLength(usize),
    PayloadTooLarge(usize),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::ShortPacket(len) => write!(f, "Packet too short: {len} bytes"),
            PacketError::BadBlockSize(len) => {
                write!(f, "Ciphertext length {len} is not a positive multiple of 16")
            }
            PacketError::CrcMismatch {
                received,
                calculated,
            } => {
                write!(f, "CRC mismatch: received {received:#06x}, calculated {calculated:#06x}")
            }
            PacketError::UnknownSecurityFlag(b) => write!(f, "Unknown security flag: {b:#04x}"),
            PacketError::BadKeyLength(len) => write!(f, "Unsupported key length: {len} bytes"),
            PacketError::PayloadTooLarge(len) => {
                write!(f, "Payload of {len} bytes exceeds the 16-bit length field")
            }
        }
    }
}

impl std::error::Error for PacketError {}

// -- Pure functions: checksum --

/// CRC-16/MODBUS over `data` (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

// -- Pure functions: encryption --

// Session and login keys are 16 bytes (AES-128); the device-supplied auth
// key is 32 bytes (AES-256). Dispatch on length covers both.
fn cbc_encrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), PacketError> {
    let len = buf.len();
    match key.len() {
        16 => {
            Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(|_| PacketError::BadKeyLength(key.len()))?
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map_err(|_| PacketError::BadBlockSize(len))?;
        }
        32 => {
            Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|_| PacketError::BadKeyLength(key.len()))?
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map_err(|_| PacketError::BadBlockSize(len))?;
        }
        other => return Err(PacketError::BadKeyLength(other)),
    }
    Ok(())
}

fn cbc_decrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), PacketError> {
    let len = buf.len();
    match key.len() {
        16 => {
            Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|_| PacketError::BadKeyLength(key.len()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| PacketError::BadBlockSize(len))?;
        }
        32 => {
            Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| PacketError::BadKeyLength(key.len()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| PacketError::BadBlockSize(len))?;
        }
        other => return Err(PacketError::BadKeyLength(other)),
    }
    Ok(())
}

// -- Pure functions: framing --

/// Build the on-wire byte string for a packet:
/// `security_flag(1) || iv(16) || AES-CBC(seq || response_to || cmd || plen || payload || crc || zero-pad)`.
pub fn build_and_encrypt(packet: &Packet, key: &[u8]) -> Result<Vec<u8>, PacketError> {
    if packet.payload.len() > u16::MAX as usize {
        return Err(PacketError::PayloadTooLarge(packet.payload.len()));
    }

    let mut raw = Vec::with_capacity(HEADER_SIZE + packet.payload.len() + CRC_SIZE + AES_BLOCK_SIZE);
    raw.extend_from_slice(&packet.seq_num.to_be_bytes());
    raw.extend_from_slice(&packet.response_to.to_be_bytes());
    raw.extend_from_slice(&packet.command.to_be_bytes());
    raw.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());
    raw.extend_from_slice(&packet.payload);

    let crc = crc16(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());

    while raw.len() % AES_BLOCK_SIZE != 0 {
        raw.push(0x00);
    }

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    cbc_encrypt(key, &iv, &mut raw)?;

    let mut out = Vec::with_capacity(1 + IV_SIZE + raw.len());
    out.push(packet.security_flag as u8);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&raw);

    Ok(out)
}

/// Read the security flag prefix of an assembled wire packet, so the caller
/// can pick the decryption key before parsing.
pub fn security_flag(data: &[u8]) -> Result<SecurityFlag, PacketError> {
    let byte = *data.first().ok_or(PacketError::ShortPacket(0))?;
    SecurityFlag::from_byte(byte).ok_or(PacketError::UnknownSecurityFlag(byte))
}

/// Decrypt and parse an assembled wire packet. Validates block alignment and
/// the CRC over the header and payload; zero padding past the CRC is ignored.
pub fn decrypt_and_parse(data: &[u8], key: &[u8]) -> Result<Packet, PacketError> {
    if data.len() < 1 + IV_SIZE {
        return Err(PacketError::ShortPacket(data.len()));
    }
    let flag = security_flag(data)?;
    let iv = &data[1..1 + IV_SIZE];

    let mut plain = data[1 + IV_SIZE..].to_vec();
    if plain.is_empty() || plain.len() % AES_BLOCK_SIZE != 0 {
        return Err(PacketError::BadBlockSize(plain.len()));
    }
    cbc_decrypt(key, iv, &mut plain)?;

    if plain.len() < HEADER_SIZE + CRC_SIZE {
        return Err(PacketError::ShortPacket(plain.len()));
    }
    let seq_num = u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let response_to = u32::from_be_bytes([plain[4], plain[5], plain[6], plain[7]]);
    let command = u16::from_be_bytes([plain[8], plain[9]]);
    let payload_len = u16::from_be_bytes([plain[10], plain[11]]) as usize;

    let crc_offset = HEADER_SIZE + payload_len;
    if plain.len() < crc_offset + CRC_SIZE {
        return Err(PacketError::ShortPacket(plain.len()));
    }

    let received = u16::from_be_bytes([plain[crc_offset], plain[crc_offset + 1]]);
    let calculated = crc16(&plain[..crc_offset]);
    if received != calculated {
        return Err(PacketError::CrcMismatch {
            received,
            calculated,
        });
    }

    Ok(Packet {
        seq_num,
        response_to,
        command,
        payload: plain[HEADER_SIZE..crc_offset].to_vec(),
        security_flag: flag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    #[test]
    fn crc16_known_vectors() {
        assert_eq!(crc16(&[0x00, 0x00]), 0x0000);
        assert_eq!(crc16(&[0x01, 0x02, 0x03, 0x04]), 0x2BA1);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let packet = Packet::new(
            7,
            0,
            CMD_SET_DPS,
            vec![0x01, 0x01, 0x01, 0x01],
            SecurityFlag::Session,
        );

        let wire = build_and_encrypt(&packet, &KEY).unwrap();
        assert_eq!(wire[0], 0x05);
        assert_eq!((wire.len() - 1 - IV_SIZE) % AES_BLOCK_SIZE, 0);

        let parsed = decrypt_and_parse(&wire, &KEY).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let packet = Packet::new(1, 0, CMD_DEVICE_INFO, Vec::new(), SecurityFlag::Login);
        let wire = build_and_encrypt(&packet, &KEY).unwrap();
        assert_eq!(decrypt_and_parse(&wire, &KEY).unwrap(), packet);
    }

    #[test]
    fn roundtrip_response_packet() {
        let packet = Packet::new(9, 4, CMD_DP_REPORT, vec![0xAB; 40], SecurityFlag::Session);
        let wire = build_and_encrypt(&packet, &KEY).unwrap();
        assert_eq!(decrypt_and_parse(&wire, &KEY).unwrap(), packet);
    }

    #[test]
    fn roundtrip_with_32_byte_key() {
        let key = [0x42u8; 32];
        let packet = Packet::new(3, 0, CMD_STATUS, vec![1, 2, 3], SecurityFlag::Auth);
        let wire = build_and_encrypt(&packet, &key).unwrap();
        assert_eq!(decrypt_and_parse(&wire, &key).unwrap(), packet);
    }

    #[test]
    fn rejects_unsupported_key_length() {
        let packet = Packet::new(1, 0, CMD_STATUS, Vec::new(), SecurityFlag::Session);
        assert_eq!(
            build_and_encrypt(&packet, &[0u8; 10]),
            Err(PacketError::BadKeyLength(10))
        );
    }

    #[test]
    fn rejects_short_wire_data() {
        assert_eq!(
            decrypt_and_parse(&[0x05; 10], &KEY),
            Err(PacketError::ShortPacket(10))
        );
    }

    #[test]
    fn rejects_unaligned_ciphertext() {
        let mut wire = vec![0x05];
        wire.extend_from_slice(&[0u8; IV_SIZE]);
        wire.extend_from_slice(&[0u8; 15]);
        assert_eq!(
            decrypt_and_parse(&wire, &KEY),
            Err(PacketError::BadBlockSize(15))
        );
    }

    #[test]
    fn rejects_empty_ciphertext() {
        let mut wire = vec![0x05];
        wire.extend_from_slice(&[0u8; IV_SIZE]);
        assert_eq!(
            decrypt_and_parse(&wire, &KEY),
            Err(PacketError::BadBlockSize(0))
        );
    }

    #[test]
    fn rejects_unknown_security_flag() {
        let mut wire = vec![0x7F];
        wire.extend_from_slice(&[0u8; IV_SIZE + AES_BLOCK_SIZE]);
        assert_eq!(
            decrypt_and_parse(&wire, &KEY),
            Err(PacketError::UnknownSecurityFlag(0x7F))
        );
    }

    #[test]
    fn detects_crc_mismatch() {
        // Hand-build a cleartext frame with a deliberately wrong CRC.
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&CMD_STATUS.to_be_bytes());
        raw.extend_from_slice(&2u16.to_be_bytes());
        raw.extend_from_slice(&[0xAA, 0xBB]);
        let bad_crc = crc16(&raw) ^ 0xFFFF;
        raw.extend_from_slice(&bad_crc.to_be_bytes());
        while raw.len() % AES_BLOCK_SIZE != 0 {
            raw.push(0x00);
        }

        let iv = [0x11u8; IV_SIZE];
        cbc_encrypt(&KEY, &iv, &mut raw).unwrap();

        let mut wire = vec![SecurityFlag::Session as u8];
        wire.extend_from_slice(&iv);
        wire.extend_from_slice(&raw);

        match decrypt_and_parse(&wire, &KEY) {
            Err(PacketError::CrcMismatch { .. }) => {}
            other => panic!("expected CrcMismatch, got {other:?}"),
        }
    }

    #[test]
    fn crc_low_byte_zero_still_parses() {
        // A payload whose frame CRC ends in 0x00 must survive padding
        // removal. Search two-byte payloads for one with that property.
        for n in 0u32..65536 {
            let payload = vec![(n >> 8) as u8, (n & 0xFF) as u8];
            let packet = Packet::new(5, 0, CMD_SET_DPS, payload.clone(), SecurityFlag::Session);
            let mut raw = Vec::new();
            raw.extend_from_slice(&packet.seq_num.to_be_bytes());
            raw.extend_from_slice(&packet.response_to.to_be_bytes());
            raw.extend_from_slice(&packet.command.to_be_bytes());
            raw.extend_from_slice(&2u16.to_be_bytes());
            raw.extend_from_slice(&payload);
            if crc16(&raw) & 0x00FF != 0 {
                continue;
            }
            let wire = build_and_encrypt(&packet, &KEY).unwrap();
            assert_eq!(decrypt_and_parse(&wire, &KEY).unwrap(), packet);
            return;
        }
        panic!("no payload with a zero CRC low byte found");
    }

    #[test]
    fn rejects_truncated_payload_length() {
        // plen claims more bytes than the frame carries.
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&CMD_STATUS.to_be_bytes());
        raw.extend_from_slice(&200u16.to_be_bytes());
        while raw.len() % AES_BLOCK_SIZE != 0 {
            raw.push(0x00);
        }
        let iv = [0x22u8; IV_SIZE];
        cbc_encrypt(&KEY, &iv, &mut raw).unwrap();

        let mut wire = vec![SecurityFlag::Session as u8];
        wire.extend_from_slice(&iv);
        wire.extend_from_slice(&raw);

        assert_eq!(
            decrypt_and_parse(&wire, &KEY),
            Err(PacketError::ShortPacket(AES_BLOCK_SIZE))
        );
    }
}
