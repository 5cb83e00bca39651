//! Wmediumd wire protocol
//!
//! Frames on the control socket are length-prefixed: a 4-byte big-endian
//! length covering everything after itself, a 1-byte opcode, then the
//! opcode-specific payload. MACs are 6 raw bytes, floats are IEEE 754
//! little-endian 64-bit, medium ids are 4-byte big-endian. After each
//! frame the daemon answers with a single status byte (0 = accepted);
//! the client correlates status N with the N-th request it submitted.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub type Mac = [u8; 6];

/// Status byte the daemon returns for an accepted frame.
pub const STATUS_OK: u8 = 0;

/// Client-to-daemon messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    RegisterInterface { mac: Mac, medium: u32 },
    UpdatePosition { mac: Mac, x: f64, y: f64, z: f64 },
    UpdateGain { mac: Mac, gain_dbi: f64 },
    UpdateTxPower { mac: Mac, txpower_dbm: f64 },
    UpdateErrorProb { mac_a: Mac, mac_b: Mac, prob: f64 },
    UpdateSnr { mac_a: Mac, mac_b: Mac, snr_db: f64 },
    SetMedium { mac: Mac, medium: u32 },
    Del { mac: Mac },
}

impl Message {
    pub fn opcode(&self) -> u8 {
        match self {
            Message::RegisterInterface { .. } => 1,
            Message::UpdatePosition { .. } => 2,
            Message::UpdateGain { .. } => 3,
            Message::UpdateTxPower { .. } => 4,
            Message::UpdateErrorProb { .. } => 5,
            Message::UpdateSnr { .. } => 6,
            Message::SetMedium { .. } => 7,
            Message::Del { .. } => 8,
        }
    }

    /// The MAC pair this message concerns, for per-pair ordering checks.
    pub fn pair(&self) -> (Mac, Option<Mac>) {
        match self {
            Message::RegisterInterface { mac, .. }
            | Message::UpdatePosition { mac, .. }
            | Message::UpdateGain { mac, .. }
            | Message::UpdateTxPower { mac, .. }
            | Message::SetMedium { mac, .. }
            | Message::Del { mac } => (*mac, None),
            Message::UpdateErrorProb { mac_a, mac_b, .. }
            | Message::UpdateSnr { mac_a, mac_b, .. } => (*mac_a, Some(*mac_b)),
        }
    }

    /// Serialize into a complete frame including the length prefix.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32);
        payload.push(self.opcode());
        match self {
            Message::RegisterInterface { mac, medium } | Message::SetMedium { mac, medium } => {
                payload.extend_from_slice(mac);
                payload.extend_from_slice(&medium.to_be_bytes());
            }
            Message::UpdatePosition { mac, x, y, z } => {
                payload.extend_from_slice(mac);
                payload.extend_from_slice(&x.to_le_bytes());
                payload.extend_from_slice(&y.to_le_bytes());
                payload.extend_from_slice(&z.to_le_bytes());
            }
            Message::UpdateGain { mac, gain_dbi } => {
                payload.extend_from_slice(mac);
                payload.extend_from_slice(&gain_dbi.to_le_bytes());
            }
            Message::UpdateTxPower { mac, txpower_dbm } => {
                payload.extend_from_slice(mac);
                payload.extend_from_slice(&txpower_dbm.to_le_bytes());
            }
            Message::UpdateErrorProb { mac_a, mac_b, prob } => {
                payload.extend_from_slice(mac_a);
                payload.extend_from_slice(mac_b);
                payload.extend_from_slice(&prob.to_le_bytes());
            }
            Message::UpdateSnr { mac_a, mac_b, snr_db } => {
                payload.extend_from_slice(mac_a);
                payload.extend_from_slice(mac_b);
                payload.extend_from_slice(&snr_db.to_le_bytes());
            }
            Message::Del { mac } => {
                payload.extend_from_slice(mac);
            }
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Parse one frame (after the length prefix has been consumed) back into
/// a message. Used by the test daemon and protocol tests.
pub fn parse_frame(payload: &[u8]) -> Option<Message> {
    let (&opcode, rest) = payload.split_first()?;
    let mac = |b: &[u8]| -> Option<Mac> { b.get(..6)?.try_into().ok() };
    match opcode {
        1 | 7 => {
            let m = mac(rest)?;
            let medium = BigEndian::read_u32(rest.get(6..10)?);
            Some(if opcode == 1 {
                Message::RegisterInterface { mac: m, medium }
            } else {
                Message::SetMedium { mac: m, medium }
            })
        }
        2 => {
            let m = mac(rest)?;
            let x = LittleEndian::read_f64(rest.get(6..14)?);
            let y = LittleEndian::read_f64(rest.get(14..22)?);
            let z = LittleEndian::read_f64(rest.get(22..30)?);
            Some(Message::UpdatePosition { mac: m, x, y, z })
        }
        3 => Some(Message::UpdateGain {
            mac: mac(rest)?,
            gain_dbi: LittleEndian::read_f64(rest.get(6..14)?),
        }),
        4 => Some(Message::UpdateTxPower {
            mac: mac(rest)?,
            txpower_dbm: LittleEndian::read_f64(rest.get(6..14)?),
        }),
        5 | 6 => {
            let mac_a = mac(rest)?;
            let mac_b: Mac = rest.get(6..12)?.try_into().ok()?;
            let value = LittleEndian::read_f64(rest.get(12..20)?);
            Some(if opcode == 5 {
                Message::UpdateErrorProb { mac_a, mac_b, prob: value }
            } else {
                Message::UpdateSnr { mac_a, mac_b, snr_db: value }
            })
        }
        8 => Some(Message::Del { mac: mac(rest)? }),
        _ => None,
    }
}
