//! In-memory channels and adapters for tests.

use crate::domain::error::LinkError;
use crate::infrastructure::bluetooth::channel::ByteChannel;
use crate::infrastructure::bluetooth::connection::{Adapter, PairedDevice};
use crate::infrastructure::bluetooth::protocol::{DOWNLOAD_CODE, UPLOAD_CODE};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<u8>,
    frames: Vec<Vec<u8>>,
    reads: usize,
    writes_before_failure: Option<usize>,
    write_delay: Duration,
    closed: bool,
}

/// Channel that replays scripted reply bytes and records every write.
///
/// Clones share state, so a test can keep a probe while the link owns the
/// channel. Overlapping writes are detected and fail the write.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    state: Arc<Mutex<ScriptState>>,
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
}

impl ScriptedChannel {
    pub fn new(replies: &[u8]) -> Self {
        let channel = Self::default();
        channel.push_replies(replies);
        channel
    }

    /// Allow `n` successful writes, then fail every write.
    pub fn fail_writes_after(self, n: usize) -> Self {
        self.state.lock().unwrap().writes_before_failure = Some(n);
        self
    }

    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().write_delay = delay;
        self
    }

    pub fn push_replies(&self, replies: &[u8]) {
        self.state.lock().unwrap().replies.extend(replies);
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().frames.concat()
    }

    /// Written bytes, one entry per write call.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().replies.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn overlapping_writes(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

impl ByteChannel for ScriptedChannel {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "interleaved write"));
        }

        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                self.in_flight.store(false, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            if let Some(left) = state.writes_before_failure.as_mut() {
                if *left == 0 {
                    self.in_flight.store(false, Ordering::SeqCst);
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
                }
                *left -= 1;
            }
            state.write_delay
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state.lock().unwrap().frames.push(bytes.to_vec());
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        if state.replies.len() < buf.len() {
            state.replies.clear();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        for slot in buf.iter_mut() {
            *slot = state.replies.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Simulated rig: remembers the last uploaded position and reports it back.
#[derive(Default)]
pub struct EchoChannel {
    position: [u8; 4],
    pending: VecDeque<u8>,
}

impl ByteChannel for EchoChannel {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match bytes {
            [UPLOAD_CODE, v1, v2, v3, v4] => self.position = [*v1, *v2, *v3, *v4],
            [DOWNLOAD_CODE] => {
                self.pending.push_back(DOWNLOAD_CODE);
                self.pending.extend(self.position);
            }
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown frame")),
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.pending.len() < buf.len() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        for slot in buf.iter_mut() {
            *slot = self.pending.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapter handing out pre-built channels.
pub struct MockAdapter {
    available: bool,
    paired: Vec<PairedDevice>,
    channels: Mutex<VecDeque<io::Result<ScriptedChannel>>>,
    opens: AtomicUsize,
    open_delay: Duration,
}

impl MockAdapter {
    pub fn new(paired_address: &str) -> Self {
        Self {
            available: true,
            paired: vec![PairedDevice {
                address: paired_address.to_string(),
                endpoint: "mock0".to_string(),
            }],
            channels: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
            open_delay: Duration::ZERO,
        }
    }

    /// Every open blocks for `delay` before returning.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new("00:00:00:00:00:00")
        }
    }

    /// Next open returns `channel`.
    pub fn queue_channel(&self, channel: ScriptedChannel) {
        self.channels.lock().unwrap().push_back(Ok(channel));
    }

    /// Next open fails.
    pub fn queue_open_failure(&self) {
        self.channels.lock().unwrap().push_back(Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "host is down",
        )));
    }

    pub fn open_attempts(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Adapter for MockAdapter {
    fn check_available(&self) -> Result<(), LinkError> {
        if self.available {
            Ok(())
        } else {
            Err(LinkError::AdapterUnavailable("no adapter".into()))
        }
    }

    fn paired_devices(&self) -> Result<Vec<PairedDevice>, LinkError> {
        Ok(self.paired.clone())
    }

    fn open_rfcomm(
        &self,
        _device: &PairedDevice,
        _service: u128,
    ) -> io::Result<Box<dyn ByteChannel>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        match self.channels.lock().unwrap().pop_front() {
            Some(Ok(channel)) => Ok(Box::new(channel)),
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "host is down")),
        }
    }
}
