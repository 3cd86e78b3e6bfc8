//! Transport adapter: a backend-agnostic, timeout-bounded duplex byte pipe.
//!
//! The [`Transport`] trait is the only surface the [`Session`](crate::session::Session)
//! sees; everything above it treats the link as opaque. [`ScientisstTransport`]
//! is the concrete cooperative-polling implementation used with real duplex
//! streams (e.g. the RFCOMM backend in [`crate::bluetooth`]); [`ScriptedTransport`]
//! is the in-memory double used in tests.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::{Result, SenseError};

/// Write deadline enforced by every [`Transport::write`] call.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
/// Read deadline enforced by every [`Transport::await_bytes`] call.
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Polling interval used while waiting for bytes to arrive.
const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// The byte-pipe contract the Session and frame codec are built against.
///
/// All other code sees only this surface: write with a flush deadline,
/// await a minimum number of buffered bytes, consume buffered bytes, close.
pub trait Transport: Send {
    /// Enqueue `bytes` for transmission and block until flushed.
    /// Fails with `ContactingDevice` if not drained within [`WRITE_TIMEOUT`].
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Number of bytes currently buffered and ready to [`Transport::consume`].
    fn rx_pending(&self) -> usize;

    /// Block cooperatively until `rx_pending() >= n` or `deadline` elapses.
    fn await_bytes(&mut self, n: usize, deadline: Duration) -> Result<()>;

    /// Remove and return the first `n` buffered bytes.
    ///
    /// Panics if fewer than `n` bytes are buffered; callers must always
    /// pair this with a preceding successful [`Transport::await_bytes`].
    fn consume(&mut self, n: usize) -> Vec<u8>;

    /// Release underlying resources. Idempotent.
    fn close(&mut self);
}

/// Duplex byte stream usable as a [`ScientisstTransport`] backend: readable,
/// writable, and independently cloneable so the ingest pump can own a
/// reader handle while the Session keeps a writer handle.
pub trait DuplexStream: Read + Write + Send + 'static {
    /// Produce an independent handle to the same underlying stream.
    fn try_clone(&self) -> std::io::Result<Self>
    where
        Self: Sized;
}

struct Shared {
    buffer: Mutex<VecDeque<u8>>,
    disconnected: AtomicBool,
}

/// Cooperative-polling [`Transport`] wrapping any [`DuplexStream`].
///
/// An ingest thread owns a cloned reader handle and appends incoming bytes
/// to a mutex-guarded queue, invoking `on_disconnect` once when the remote
/// end closes the pipe. The Session polls that queue in [`POLL_INTERVAL`]
/// slices up to the 3-second deadline, matching the source's busy-wait
/// discipline (20 polls of 150ms).
pub struct ScientisstTransport<W: Write + Send + 'static> {
    writer: W,
    shared: Arc<Shared>,
    ingest: Option<thread::JoinHandle<()>>,
}

impl<T: DuplexStream> ScientisstTransport<T> {
    /// Wrap `stream`, spawning the background ingest pump. `on_disconnect`
    /// is invoked exactly once, from the ingest thread, when the stream
    /// reports EOF or an unrecoverable read error.
    pub fn spawn(stream: T, mut on_disconnect: impl FnMut() + Send + 'static) -> Result<Self> {
        let reader = stream.try_clone()?;
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::new()),
            disconnected: AtomicBool::new(false),
        });

        let ingest_shared = Arc::clone(&shared);
        let ingest = thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 512];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("transport ingest saw EOF");
                        break;
                    }
                    Ok(n) => {
                        let mut queue = ingest_shared.buffer.lock().unwrap();
                        queue.extend(&buf[..n]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("transport ingest read error: {e}");
                        break;
                    }
                }
            }
            ingest_shared.disconnected.store(true, Ordering::SeqCst);
            on_disconnect();
        });

        Ok(Self {
            writer: stream,
            shared,
            ingest: Some(ingest),
        })
    }
}

impl<W: Write + Send + 'static> Transport for ScientisstTransport<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let started = Instant::now();
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| SenseError::ContactingDevice(e.to_string()))?;

        if started.elapsed() > WRITE_TIMEOUT {
            return Err(SenseError::ContactingDevice(
                "write did not drain within deadline".into(),
            ));
        }
        Ok(())
    }

    fn rx_pending(&self) -> usize {
        self.shared.buffer.lock().unwrap().len()
    }

    fn await_bytes(&mut self, n: usize, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        let max_polls = (deadline.as_millis() / POLL_INTERVAL.as_millis().max(1)).max(1) as u32;

        for _ in 0..max_polls {
            if self.rx_pending() >= n {
                return Ok(());
            }
            if self.shared.disconnected.load(Ordering::SeqCst) && self.rx_pending() < n {
                if self.rx_pending() == 0 {
                    return Err(SenseError::Unknown(
                        "transport disconnected before delivering data".into(),
                    ));
                }
                return Err(SenseError::ContactingDevice(
                    "transport disconnected before satisfying read".into(),
                ));
            }
            if started.elapsed() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        if self.rx_pending() >= n {
            Ok(())
        } else {
            Err(SenseError::ContactingDevice(format!(
                "timed out waiting for {n} bytes"
            )))
        }
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        let mut queue = self.shared.buffer.lock().unwrap();
        assert!(queue.len() >= n, "consume requires awaited bytes first");
        queue.drain(..n).collect()
    }

    fn close(&mut self) {
        if let Some(handle) = self.ingest.take() {
            // The ingest thread exits on its own once the peer closes or a
            // read error occurs; we don't force it, only reap it if already done.
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

/// In-memory [`Transport`] double for tests: a `VecDeque<u8>`-backed
/// scripted stream, analogous to the teacher's reliance on a plain cursor
/// for unit tests, standing in for the real RFCOMM transport collaborator.
#[cfg(test)]
pub struct ScriptedTransport {
    rx: VecDeque<u8>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: bool,
}

#[cfg(test)]
impl ScriptedTransport {
    /// Build a transport pre-loaded with bytes the device is scripted to send.
    pub fn with_script(bytes: impl Into<VecDeque<u8>>) -> Self {
        Self {
            rx: bytes.into(),
            written: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Build a transport alongside a handle to the bytes written to it, so
    /// tests can assert on command bytes after the transport has been
    /// boxed into a `Session`.
    pub fn with_script_and_probe(bytes: impl Into<VecDeque<u8>>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let transport = Self::with_script(bytes);
        let probe = Arc::clone(&transport.written);
        (transport, probe)
    }
}

#[cfg(test)]
impl Transport for ScriptedTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn rx_pending(&self) -> usize {
        self.rx.len()
    }

    fn await_bytes(&mut self, n: usize, _deadline: Duration) -> Result<()> {
        if self.rx.len() >= n {
            Ok(())
        } else if self.closed {
            if self.rx.is_empty() {
                Err(SenseError::Unknown(
                    "scripted transport closed with no data".into(),
                ))
            } else {
                Err(SenseError::ContactingDevice(
                    "scripted transport closed before satisfying read".into(),
                ))
            }
        } else {
            Err(SenseError::ContactingDevice(format!(
                "scripted transport starved: wanted {n}, have {}",
                self.rx.len()
            )))
        }
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        assert!(self.rx.len() >= n, "consume requires awaited bytes first");
        self.rx.drain(..n).collect()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_transport_awaits_and_consumes() {
        let mut t = ScriptedTransport::with_script(vec![1, 2, 3, 4]);
        assert!(t.await_bytes(4, Duration::from_millis(10)).is_ok());
        assert_eq!(t.consume(2), vec![1, 2]);
        assert_eq!(t.rx_pending(), 2);
    }

    #[test]
    fn scripted_transport_times_out_when_starved() {
        let mut t = ScriptedTransport::with_script(vec![1]);
        let err = t.await_bytes(5, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, SenseError::ContactingDevice(_)));
    }

    #[test]
    fn scripted_transport_short_read_after_close() {
        let mut t = ScriptedTransport::with_script(vec![1, 2]);
        t.close();
        assert!(t.await_bytes(2, Duration::from_millis(10)).is_ok());
        assert_eq!(t.consume(2), vec![1, 2]);
        let err = t.await_bytes(1, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, SenseError::Unknown(_)));
    }
}
