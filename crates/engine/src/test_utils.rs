//! Test utilities
//!
//! Scripted in-memory transport and polling helpers for exercising the
//! engine without hardware.
//!
//! # Example
//!
//! ```
//! use engine::test_utils::MockTransport;
//!
//! let transport = MockTransport::new();
//! transport.push_data(b"AB");
//! assert!(transport.writes().is_empty());
//! ```

use crate::error::TransportError;
use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One step of a mock read script.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Deliver these bytes (must fit the dispatcher's read chunk).
    Data(Vec<u8>),
    /// Time out, as an idle device would.
    Timeout,
    /// End of stream (`Ok(0)`).
    Eof,
    /// Fail fatally with this error.
    Fatal(TransportError),
}

/// Scripted transport: reads consume a queued script, writes are recorded.
///
/// With an empty script, reads behave like an idle device (timeout), so a
/// dispatcher keeps looping until the test feeds it more data or stops it.
pub struct MockTransport {
    script: Mutex<VecDeque<ReadStep>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Queue a read step for the dispatcher.
    pub fn push_read(&self, step: ReadStep) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Queue an inbound data chunk.
    pub fn push_data(&self, data: &[u8]) {
        self.push_read(ReadStep::Data(data.to_vec()));
    }

    /// Everything written so far, one entry per device submission.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fatal(e)) => Err(e),
            Some(ReadStep::Timeout) | None => {
                // Idle device: a short sleep keeps dispatcher loops from
                // spinning hot in tests.
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Err(TransportError::Timeout)
            }
        }
    }

    fn write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(TransportError::Other("injected write failure".into()));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }
}

/// Poll `predicate` until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}
