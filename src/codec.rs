//! Frame codec: packet sizing, CRC-4 verification, and bit-unpacking of
//! channel samples. Every function here is pure and side-effect free; the
//! [`Session`](crate::session::Session) is the only caller that touches I/O.

use crate::errors::{Result, SenseError};

/// A channel identifier on the ScientISST Sense device.
///
/// `Ai1..Ai6` are the six internal 12-bit analog inputs; `Ax1`/`Ax2` are the
/// two external 24-bit analog inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ai1 = 1,
    Ai2 = 2,
    Ai3 = 3,
    Ai4 = 4,
    Ai5 = 5,
    Ai6 = 6,
    Ax1 = 7,
    Ax2 = 8,
}

impl Channel {
    /// All eight channels, in device order. Used as the default active set
    /// when a caller starts acquisition without naming specific channels.
    pub const ALL: [Channel; 8] = [
        Channel::Ai1,
        Channel::Ai2,
        Channel::Ai3,
        Channel::Ai4,
        Channel::Ai5,
        Channel::Ai6,
        Channel::Ax1,
        Channel::Ax2,
    ];

    /// The channel's 1-based wire identifier.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// True for the two 24-bit external channels (AX1, AX2).
    pub fn is_external(self) -> bool {
        matches!(self, Channel::Ax1 | Channel::Ax2)
    }

    /// Parse a 1-based channel identifier, rejecting anything outside 1..8.
    pub fn from_id(id: u8) -> Result<Channel> {
        match id {
            1 => Ok(Channel::Ai1),
            2 => Ok(Channel::Ai2),
            3 => Ok(Channel::Ai3),
            4 => Ok(Channel::Ai4),
            5 => Ok(Channel::Ai5),
            6 => Ok(Channel::Ai6),
            7 => Ok(Channel::Ax1),
            8 => Ok(Channel::Ax2),
            other => Err(SenseError::InvalidParameter(format!(
                "channel {other} out of range 1..8"
            ))),
        }
    }
}

/// The device's command/response dialect. Only [`ApiMode::Scientisst`] is
/// decoded by this core; the others are accepted on the wire (the device
/// needs the byte during the API-switch command) but rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiMode {
    Bitalino = 1,
    #[default]
    Scientisst = 2,
    Json = 3,
}

impl ApiMode {
    /// The byte sent on the wire during the API-switch command.
    pub fn wire_code(self) -> u8 {
        self as u8
    }
}

/// A single decoded sample point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 4-bit sequence counter (0..15), wraps.
    pub seq: u8,
    /// One slot per channel ID (index `ch.id() - 1`). `None` when the
    /// channel was not part of the active set for this acquisition.
    pub analog: [Option<u32>; 8],
    /// Digital line state at sample time: `[I1, I2, O1, O2]`.
    pub digital: [bool; 4],
}

impl Frame {
    /// Read back the decoded value for a channel, if it was active.
    pub fn channel(&self, ch: Channel) -> Option<u32> {
        self.analog[(ch.id() - 1) as usize]
    }
}

/// CRC-4 lookup table used by [`crc4`].
const CRC4_TABLE: [u8; 16] = [0, 3, 6, 5, 12, 15, 10, 9, 11, 8, 13, 14, 7, 4, 1, 2];

/// Compute the CRC-4 of `packet`, folding only the high nibble of the last
/// byte (the low nibble carries the received CRC itself).
fn crc4(packet: &[u8]) -> u8 {
    debug_assert!(!packet.is_empty());
    let mut crc: u8 = 0;
    let (body, last) = packet.split_at(packet.len() - 1);
    let last = last[0];
    for &b in body {
        crc = CRC4_TABLE[crc as usize] ^ (b >> 4);
        crc = CRC4_TABLE[crc as usize] ^ (b & 0x0F);
    }
    crc = CRC4_TABLE[crc as usize] ^ (last >> 4);
    CRC4_TABLE[crc as usize]
}

/// Verify the CRC-4 carried in the low nibble of `packet`'s last byte.
///
/// `packet` must have length >= 2 (an I/O byte plus the seq+CRC byte at
/// minimum); shorter packets never validate.
pub fn check_crc4(packet: &[u8]) -> bool {
    if packet.len() < 2 {
        return false;
    }
    let last = *packet.last().unwrap();
    crc4(packet) == (last & 0x0F)
}

/// Compute the on-wire packet size for SCIENTISST mode given the active
/// channel set. An empty slice means "all eight channels" (the device's
/// default when the caller passes no explicit list).
///
/// Only `ApiMode::Scientisst` is supported; any other mode is rejected with
/// `NotSupported` since this core does not implement BITALINO/JSON decoding.
pub fn packet_size(api: ApiMode, channels: &[Channel]) -> Result<usize> {
    if api != ApiMode::Scientisst {
        return Err(SenseError::NotSupported(format!(
            "frame decoding is not implemented for API mode {:?}",
            api
        )));
    }

    let active: &[Channel] = if channels.is_empty() {
        &Channel::ALL
    } else {
        channels
    };

    let n_extern = active.iter().filter(|c| c.is_external()).count();
    let n_intern = active.len() - n_extern;

    let intern_bytes = if n_intern % 2 == 0 {
        (n_intern * 12) / 8
    } else {
        (n_intern * 12 - 4) / 8
    };

    Ok(3 * n_extern + intern_bytes + 2)
}

/// Slide `window` left by one byte and append `new_byte` at the end, as the
/// resynchronisation loop does after a CRC failure.
pub fn shift_window(window: &mut [u8], new_byte: u8) {
    let len = window.len();
    window.copy_within(1..len, 0);
    window[len - 1] = new_byte;
}

/// Decode a validated SCIENTISST-mode packet into a [`Frame`].
///
/// `active_channels` must be the same ordered set used to compute
/// `packet.len()` via [`packet_size`]; behaviour is unspecified otherwise.
/// Callers are expected to have already checked [`check_crc4`].
pub fn decode_packet(packet: &[u8], active_channels: &[Channel]) -> Frame {
    let last = packet.len() - 1;
    let io_byte = packet[last - 1];
    let seq = packet[last] >> 4;

    let digital = [
        io_byte & 0x80 != 0,
        io_byte & 0x40 != 0,
        io_byte & 0x20 != 0,
        io_byte & 0x10 != 0,
    ];

    let active: &[Channel] = if active_channels.is_empty() {
        &Channel::ALL
    } else {
        active_channels
    };

    let mut analog: [Option<u32>; 8] = [None; 8];
    let mut byte_it: usize = 0;
    let mut mid_frame = false;

    for &ch in active.iter().rev() {
        if ch.is_external() {
            let b = &packet[byte_it..byte_it + 4];
            let raw = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            analog[(ch.id() - 1) as usize] = Some(raw & 0xFF_FFFF);
            byte_it += 3;
        } else {
            let b = &packet[byte_it..byte_it + 2];
            let raw = u16::from_le_bytes([b[0], b[1]]);
            if !mid_frame {
                analog[(ch.id() - 1) as usize] = Some((raw & 0x0FFF) as u32);
                byte_it += 1;
                mid_frame = true;
            } else {
                analog[(ch.id() - 1) as usize] = Some((raw >> 4) as u32);
                byte_it += 2;
                mid_frame = false;
            }
        }
    }

    Frame {
        seq,
        analog,
        digital,
    }
}
