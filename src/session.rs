//! Session: the state machine that owns the transport and drives the
//! ScientISST Sense command/response protocol.

use log::{debug, info, warn};

use crate::codec::{check_crc4, decode_packet, packet_size, shift_window, ApiMode, Channel, Frame};
use crate::errors::{Result, SenseError};
use crate::transport::{Transport, READ_TIMEOUT};

const CMD_VERSION: u8 = 0x07;
const VERSION_HEADER: &[u8] = b"ScientISST";

/// A bonded/paired device as reported by the (external) discovery collaborator.
#[derive(Debug, Clone)]
pub struct BondedDevice {
    pub name: String,
    pub address: String,
}

/// Encode `value` as the minimal little-endian byte sequence the wire
/// protocol uses for command arguments. Zero encodes as a single `0x00`.
fn encode_minimal_le(mut value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push((value & 0xFF) as u8);
        value >>= 8;
    }
    out
}

/// Decode a little-endian byte sequence produced by [`encode_minimal_le`].
#[cfg(test)]
fn decode_minimal_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Validate a MAC address literal in colon-separated, dash-separated, or
/// bare-hex form (12 hex digits, no separators).
fn validate_mac(address: &str) -> Result<()> {
    let is_hex_pair = |s: &str| s.len() == 2 && s.chars().all(|c| c.is_ascii_hexdigit());

    let colon_or_dash_ok = |sep: char| {
        let parts: Vec<&str> = address.split(sep).collect();
        parts.len() == 6 && parts.iter().all(|p| is_hex_pair(p))
    };
    let bare_hex_ok = address.len() == 12 && address.chars().all(|c| c.is_ascii_hexdigit());

    if colon_or_dash_ok(':') || colon_or_dash_ok('-') || bare_hex_ok {
        Ok(())
    } else {
        Err(SenseError::InvalidAddress(format!(
            "{address} is not a valid MAC address"
        )))
    }
}

/// Return the bonded devices whose name contains "scientisst" (case
/// insensitive). The enumeration itself is an external collaborator's job
/// (§1); this just applies the device's naming filter.
pub fn find(bonded: &[BondedDevice]) -> Vec<String> {
    bonded
        .iter()
        .filter(|d| d.name.to_lowercase().contains("scientisst"))
        .map(|d| d.address.clone())
        .collect()
}

/// The ScientISST Sense session state machine.
///
/// Owns the transport and the current acquisition configuration, and
/// enforces the legal command/state transitions described in the protocol.
pub struct Session {
    address: String,
    connected: bool,
    acquiring: bool,
    api_mode: ApiMode,
    active_channels: Vec<Channel>,
    sample_rate: u16,
    packet_size: usize,
    transport: Option<Box<dyn Transport>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("connected", &self.connected)
            .field("acquiring", &self.acquiring)
            .field("api_mode", &self.api_mode)
            .field("active_channels", &self.active_channels)
            .field("sample_rate", &self.sample_rate)
            .field("packet_size", &self.packet_size)
            .finish()
    }
}

impl Session {
    /// Construct a session around `address`, validating its MAC form.
    pub fn new(address: &str) -> Result<Self> {
        validate_mac(address)?;
        Ok(Self {
            address: address.to_string(),
            connected: false,
            acquiring: false,
            api_mode: ApiMode::Bitalino,
            active_channels: Vec::new(),
            sample_rate: 0,
            packet_size: 0,
            transport: None,
        })
    }

    /// The validated device address this session was constructed with.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Attach an already-open transport and mark the session connected.
    ///
    /// This is the low-level entry point used by both the real RFCOMM
    /// backend (after it has opened and wrapped the socket) and tests
    /// (with a [`crate::transport::ScriptedTransport`]).
    pub fn connect_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.transport = Some(transport);
        self.connected = true;
        self.api_mode = ApiMode::Bitalino;
        info!("session connected: address={}", self.address);
        Ok(())
    }

    /// Tear the session down, stopping acquisition first if necessary.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.acquiring {
            self.stop()?;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.connected = false;
        info!("session disconnected: address={}", self.address);
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport
            .as_mut()
            .ok_or_else(|| SenseError::DeviceNotFound("session is not connected".into()))
    }

    fn send_command(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("sending command: {bytes:02X?}");
        self.transport_mut()?.write(bytes)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let transport = self.transport_mut()?;
        transport.await_bytes(1, READ_TIMEOUT)?;
        Ok(transport.consume(1)[0])
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let transport = self.transport_mut()?;
        transport.await_bytes(n, READ_TIMEOUT)?;
        Ok(transport.consume(n))
    }

    /// Query the device firmware version.
    ///
    /// Implements the streaming header-matching parser: bytes are consumed
    /// one at a time, skipping leading junk, until the literal `"ScientISST"`
    /// prefix matches. The matched header becomes the start of the version
    /// string; every subsequent byte (whitespace dropped) is appended until
    /// a `0x00` terminator.
    pub fn version(&mut self) -> Result<String> {
        self.send_command(&[CMD_VERSION])?;

        let mut matched = 0usize;
        while matched < VERSION_HEADER.len() {
            let b = self.read_byte()?;
            if b == VERSION_HEADER[matched] {
                matched += 1;
            } else {
                matched = if b == VERSION_HEADER[0] { 1 } else { 0 };
            }
        }

        let mut version = String::from_utf8(VERSION_HEADER.to_vec()).unwrap();
        loop {
            let b = self.read_byte()?;
            if b == 0x00 {
                break;
            }
            if b == 0x0A || b == 0x20 {
                continue;
            }
            version.push(b as char);
        }
        Ok(version)
    }

    fn require_idle(&self) -> Result<()> {
        if !self.active_channels.is_empty() {
            return Err(SenseError::DeviceNotIdle(
                "device is acquiring; call stop() first".into(),
            ));
        }
        Ok(())
    }

    /// Start acquisition at `sample_rate` Hz over `channels` (empty means
    /// "all eight channels"). `api` must be SCIENTISST or JSON — BITALINO is
    /// not a valid target mode for `start`.
    pub fn start(
        &mut self,
        sample_rate: u16,
        channels: &[u8],
        simulated: bool,
        api: ApiMode,
    ) -> Result<()> {
        self.require_idle()?;
        if api == ApiMode::Bitalino {
            return Err(SenseError::InvalidParameter(
                "start() requires SCIENTISST or JSON api mode".into(),
            ));
        }

        let mut parsed = Vec::with_capacity(channels.len().max(8));
        let mut mask: u8 = 0;
        for &id in channels {
            let ch = Channel::from_id(id)?;
            let bit = 1u8 << (ch.id() - 1);
            if mask & bit != 0 {
                return Err(SenseError::InvalidParameter(format!(
                    "channel {id} requested more than once"
                )));
            }
            mask |= bit;
            parsed.push(ch);
        }
        if channels.is_empty() {
            mask = 0xFF;
            parsed = Channel::ALL.to_vec();
        }

        // (1) switch API mode.
        self.send_command(&[0x03 | (api.wire_code() << 4)])?;

        // (2) send rate-set command.
        let mut rate_cmd = vec![0x43];
        rate_cmd.extend(encode_minimal_le(sample_rate as u64));
        self.send_command(&rate_cmd)?;

        // (3) clear the RX buffer.
        let pending = self.transport_mut()?.rx_pending();
        if pending > 0 {
            let _ = self.transport_mut()?.consume(pending);
        }

        // (4) send start-live or start-sim with the channel mask.
        let start_byte = if simulated { 0x02 } else { 0x01 };
        self.send_command(&[start_byte, mask])?;

        // (5) compute and store packet size.
        self.packet_size = packet_size(ApiMode::Scientisst, &parsed)?;

        // (6) set acquiring and record active channels in caller order.
        self.api_mode = api;
        self.sample_rate = sample_rate;
        self.active_channels = parsed;
        self.acquiring = true;

        debug!(
            "acquisition started: rate={sample_rate}Hz, channels={:?}, packet_size={}",
            self.active_channels, self.packet_size
        );
        Ok(())
    }

    fn require_acquiring(&self) -> Result<()> {
        if self.active_channels.is_empty() {
            return Err(SenseError::DeviceNotInAcquisition(
                "device is idle; call start() first".into(),
            ));
        }
        Ok(())
    }

    /// Stop acquisition, returning the device and session to idle.
    pub fn stop(&mut self) -> Result<()> {
        self.require_acquiring()?;
        self.send_command(&[0x00])?;
        let pending = self.transport_mut()?.rx_pending();
        if pending > 0 {
            let _ = self.transport_mut()?.consume(pending);
        }
        self.active_channels.clear();
        self.sample_rate = 0;
        self.packet_size = 0;
        self.acquiring = false;
        Ok(())
    }

    /// Read up to `n` frames. Only legal while acquiring. A CRC failure
    /// drives byte-level resynchronisation rather than raising an error; a
    /// transport timeout mid-resync ends the read with the frames decoded
    /// so far (never a partial frame).
    pub fn read(&mut self, n: usize) -> Result<Vec<Frame>> {
        self.require_acquiring()?;
        let size = self.packet_size;
        let active = self.active_channels.clone();

        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            let mut window = match self.read_exact(size) {
                Ok(bytes) => bytes,
                Err(e) if frames.is_empty() => return Err(e),
                Err(_) => break,
            };

            loop {
                if check_crc4(&window) {
                    frames.push(decode_packet(&window, &active));
                    break;
                }
                warn!("CRC mismatch, resynchronising");
                match self.read_byte() {
                    Ok(b) => shift_window(&mut window, b),
                    Err(e) if frames.is_empty() => return Err(e),
                    Err(_) => return Ok(frames),
                }
            }
        }
        Ok(frames)
    }

    /// Set digital output pins O1/O2. `outputs` must have length 2.
    pub fn trigger(&mut self, outputs: &[bool]) -> Result<()> {
        if outputs.len() != 2 {
            return Err(SenseError::InvalidParameter(
                "trigger() requires exactly 2 outputs".into(),
            ));
        }
        let cmd = 0xB3 | if outputs[0] { 0x04 } else { 0 } | if outputs[1] { 0x08 } else { 0 };
        self.send_command(&[cmd])
    }

    /// Set the DAC/PWM output level (0..255).
    pub fn dac(&mut self, level: u16) -> Result<()> {
        if level > 255 {
            return Err(SenseError::InvalidParameter(format!(
                "dac level {level} out of range 0..255"
            )));
        }
        let mut cmd = vec![0xA3];
        cmd.extend(encode_minimal_le(level as u64));
        self.send_command(&cmd)
    }

    /// Set the battery LED threshold (0..63). Idle only.
    pub fn battery(&mut self, value: u8) -> Result<()> {
        self.require_idle()?;
        if value > 63 {
            return Err(SenseError::InvalidParameter(format!(
                "battery threshold {value} out of range 0..63"
            )));
        }
        self.send_command(&[value << 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn connected_session(address: &str, script: Vec<u8>) -> Session {
        let mut session = Session::new(address).unwrap();
        let transport = ScriptedTransport::with_script(script);
        session.connect_transport(Box::new(transport)).unwrap();
        session
    }

    #[test]
    fn minimal_le_round_trips() {
        for v in [0u64, 1, 255, 256, 1000, 65535, 70000] {
            let encoded = encode_minimal_le(v);
            assert_eq!(decode_minimal_le(&encoded), v);
            if v == 0 {
                assert_eq!(encoded, vec![0]);
            }
        }
    }

    #[test]
    fn address_validation_accepts_colon_form() {
        assert!(Session::new("AA:BB:CC:DD:EE:FF").is_ok());
    }

    #[test]
    fn address_validation_rejects_garbage() {
        let err = Session::new("not a mac").unwrap_err();
        assert!(matches!(err, SenseError::InvalidAddress(_)));
    }

    #[test]
    fn find_filters_by_name_case_insensitively() {
        let bonded = vec![
            BondedDevice {
                name: "ScientISST Sense A3".into(),
                address: "AA:BB:CC:DD:EE:01".into(),
            },
            BondedDevice {
                name: "Some Headphones".into(),
                address: "AA:BB:CC:DD:EE:02".into(),
            },
        ];
        assert_eq!(find(&bonded), vec!["AA:BB:CC:DD:EE:01".to_string()]);
    }

    #[test]
    fn version_parses_banner_skipping_leading_junk_and_newlines() {
        let script: Vec<u8> = b"ZZScientISST v1.2\nextra\n\0".to_vec();
        let mut session = connected_session("AA:BB:CC:DD:EE:FF", script);
        let version = session.version().unwrap();
        assert_eq!(version, "ScientISSTv1.2extra");
    }

    #[test]
    fn start_sequence_emits_expected_command_bytes() {
        let mut session = Session::new("AA:BB:CC:DD:EE:FF").unwrap();
        let (transport, written) = ScriptedTransport::with_script_and_probe(vec![]);
        session.connect_transport(Box::new(transport)).unwrap();

        session
            .start(1000, &[1, 3], false, ApiMode::Scientisst)
            .unwrap();
        assert!(session.is_acquiring());

        let bytes = written.lock().unwrap().clone();
        // API switch (0x23), rate-set (0x43, 0xE8, 0x03), start-live (0x01, 0x05).
        assert_eq!(bytes, vec![0x23, 0x43, 0xE8, 0x03, 0x01, 0x05]);
    }

    #[test]
    fn start_rejects_duplicate_channel() {
        let mut session = connected_session("AA:BB:CC:DD:EE:FF", vec![]);
        let err = session
            .start(1000, &[1, 1], false, ApiMode::Scientisst)
            .unwrap_err();
        assert!(matches!(err, SenseError::InvalidParameter(_)));
        assert!(!session.is_acquiring());
    }

    #[test]
    fn start_rejects_out_of_range_channel() {
        let mut session = connected_session("AA:BB:CC:DD:EE:FF", vec![]);
        assert!(session
            .start(1000, &[0], false, ApiMode::Scientisst)
            .is_err());
        assert!(session
            .start(1000, &[9], false, ApiMode::Scientisst)
            .is_err());
    }

    #[test]
    fn dac_rejects_out_of_range_accepts_boundaries() {
        let mut session = connected_session("AA:BB:CC:DD:EE:FF", vec![]);
        assert!(session.dac(0).is_ok());
        assert!(session.dac(255).is_ok());
        assert!(session.dac(256).is_err());
    }

    #[test]
    fn battery_rejects_strictly_above_63() {
        let mut session = connected_session("AA:BB:CC:DD:EE:FF", vec![]);
        assert!(session.battery(63).is_ok());
        let err = session.battery(64).unwrap_err();
        assert!(matches!(err, SenseError::InvalidParameter(_)));
    }

    #[test]
    fn read_after_stop_is_rejected() {
        let mut session = connected_session("AA:BB:CC:DD:EE:FF", vec![]);
        let err = session.read(1).unwrap_err();
        assert!(matches!(err, SenseError::DeviceNotInAcquisition(_)));
    }

    fn crc4_of(body: &[u8]) -> u8 {
        const TABLE: [u8; 16] = [0, 3, 6, 5, 12, 15, 10, 9, 11, 8, 13, 14, 7, 4, 1, 2];
        let mut crc = 0u8;
        let (rest, last) = body.split_at(body.len() - 1);
        for &b in rest {
            crc = TABLE[crc as usize] ^ (b >> 4);
            crc = TABLE[crc as usize] ^ (b & 0x0F);
        }
        crc = TABLE[crc as usize] ^ (last[0] >> 4);
        TABLE[crc as usize]
    }

    fn single_channel_packet(seq: u8) -> Vec<u8> {
        // AI1=42, digital I1 set.
        let mut body = vec![0x2A, 0x80, seq << 4];
        let crc = crc4_of(&body);
        body[2] |= crc;
        body
    }

    /// Start acquisition on a session whose transport already carries
    /// `script` as pending RX bytes (used for `read()` scenarios, where the
    /// packet stream must be present before `read` consumes it).
    fn acquiring_session(channels: &[u8], script: Vec<u8>) -> Session {
        let mut session = Session::new("AA:BB:CC:DD:EE:FF").unwrap();
        let transport = ScriptedTransport::with_script(vec![]);
        session.connect_transport(Box::new(transport)).unwrap();
        session
            .start(1000, channels, false, ApiMode::Scientisst)
            .unwrap();
        // start() clears the RX buffer (step 3 of its effect sequence), so
        // the scripted packet stream is loaded only after it returns.
        session.transport = Some(Box::new(ScriptedTransport::with_script(script)));
        session
    }

    #[test]
    fn read_decodes_single_frame() {
        let packet = single_channel_packet(5);
        let mut session = acquiring_session(&[1], packet);
        let frames = session.read(1).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 5);
        assert_eq!(frames[0].channel(Channel::Ai1), Some(42));
        assert_eq!(frames[0].digital, [true, false, false, false]);
    }

    #[test]
    fn read_resyncs_past_garbage_bytes() {
        let mut stream = vec![0xDE, 0xAD];
        stream.extend(single_channel_packet(5));
        let mut session = acquiring_session(&[1], stream);
        let frames = session.read(1).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 5);
        // Exactly junk + packetSize bytes consumed from the transport: no
        // more, no fewer.
        assert_eq!(session.transport.as_deref().unwrap().rx_pending(), 0);
    }

    #[test]
    fn read_short_on_disconnect() {
        let mut stream = single_channel_packet(1);
        stream.extend(single_channel_packet(2));
        let mut session = acquiring_session(&[1], stream);
        session.transport.as_deref_mut().unwrap().close();
        let frames = session.read(10).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn read_raises_unknown_when_stream_dead_before_first_frame() {
        let mut session = acquiring_session(&[1], vec![]);
        session.transport.as_deref_mut().unwrap().close();
        let err = session.read(1).unwrap_err();
        assert!(matches!(err, SenseError::Unknown(_)));
    }
}
