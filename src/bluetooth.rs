//! Manual RFCOMM backend: opens a Bluetooth classic socket to an
//! already-paired, already-trusted Sense device using raw libc calls, no
//! root and no BlueZ D-Bus session required.

use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::errors::{BluetoothError, Result, SenseError};
use crate::transport::DuplexStream;

const AF_BLUETOOTH: libc::c_ushort = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Opens an RFCOMM socket to a paired device, retrying with backoff.
///
/// The device must already be paired and trusted (e.g. via `bluetoothctl`);
/// discovery and pairing are not performed here.
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub channel: u8,
    pub io_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self {
            channel: 1,
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BluetoothConnector {
    /// Connect to an already-paired device at `mac`, retrying with
    /// exponential backoff up to `max_retries` times.
    pub fn connect(&self, mac: &str) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(mac)?;

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                thread::sleep(delay);
            }

            match open_rfcomm_raw(bdaddr, self.channel, self.io_timeout) {
                Ok(stream) => {
                    if let Err(e) = stream.verify_connected() {
                        warn!("connection verification failed: mac={}, error={}", mac, e);
                        last_error = Some(e);
                        continue;
                    }
                    info!("RFCOMM connection established: mac={}", mac);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SenseError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }
}

/// A connected RFCOMM socket, readable and writable like any duplex stream.
pub struct RfcommStream {
    file: File,
}

impl RfcommStream {
    /// Check the socket's `SO_ERROR` status to confirm the connection is live.
    pub fn verify_connected(&self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                self.file.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if ret < 0 {
            return Err(SenseError::Io(std::io::Error::last_os_error()));
        }

        if err != 0 {
            return Err(SenseError::Bluetooth(BluetoothError::NotConnected(
                std::io::Error::from_raw_os_error(err).to_string(),
            )));
        }

        Ok(())
    }
}

impl Read for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for RfcommStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl DuplexStream for RfcommStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        Ok(RfcommStream {
            file: self.file.try_clone()?,
        })
    }
}

unsafe impl Send for RfcommStream {}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BdAddr {
    b: [u8; 6],
}

#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(SenseError::InvalidAddress(mac.to_string()));
    }

    let mut bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        let byte = u8::from_str_radix(part, 16)
            .map_err(|_| SenseError::InvalidAddress(mac.to_string()))?;
        bytes[i] = byte;
    }

    // bdaddr_t stores bytes in reverse order compared to the usual MAC string.
    let mut addr = BdAddr { b: [0; 6] };
    for i in 0..6 {
        addr.b[i] = bytes[5 - i];
    }
    Ok(addr)
}

fn open_rfcomm_raw(address: BdAddr, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket: channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH as libc::c_int,
            libc::SOCK_STREAM,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(SenseError::Bluetooth(BluetoothError::Connection(
            std::io::Error::last_os_error().to_string(),
        )));
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(SenseError::Bluetooth(BluetoothError::Connection(
            err.to_string(),
        )));
    }

    let mut addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };

    let ret = unsafe {
        libc::connect(
            fd,
            &mut addr as *mut _ as *const libc::sockaddr,
            mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(SenseError::Bluetooth(BluetoothError::Connection(
            err.to_string(),
        )));
    }

    // Set IO timeouts so reads/writes can never hang indefinitely.
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(SenseError::Bluetooth(BluetoothError::Connection(
                err.to_string(),
            )));
        }
    }

    let file = unsafe { File::from_raw_fd(fd) };
    Ok(RfcommStream { file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bdaddr_reverses_byte_order() {
        let addr = parse_bdaddr("00:11:22:33:44:55").unwrap();
        assert_eq!(addr.b, [0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
    }

    #[test]
    fn parse_bdaddr_rejects_malformed_mac() {
        assert!(matches!(
            parse_bdaddr("not-a-mac").unwrap_err(),
            SenseError::InvalidAddress(_)
        ));
        assert!(matches!(
            parse_bdaddr("00:11:22:33:44").unwrap_err(),
            SenseError::InvalidAddress(_)
        ));
    }
}
