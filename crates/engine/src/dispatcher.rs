//! Read dispatcher
//!
//! Dedicated thread that drains the device IN endpoint and delivers each
//! chunk to the registered callback, buffering into the bounded channel
//! instead while no callback is registered. One dispatcher per engine,
//! alive from init to shutdown.
//!
//! The loop checks the stop signal at every iteration and again after each
//! blocking read returns, so shutdown latency is bounded by one in-flight
//! device read timeout. Callbacks run on this thread: a callback that blocks
//! indefinitely stalls all further reads.

use crate::channel::BoundedChannel;
use crate::transport::Transport;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Callback invoked on the dispatcher thread for each inbound chunk.
///
/// The slice is valid only for the duration of the call and is not mutated
/// concurrently during it.
pub type ReadCallback = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Dispatcher lifecycle states.
///
/// Stopped is terminal; a fresh engine init is the only way back to Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    /// Spawned, loop not yet entered.
    Starting = 0,
    /// Draining the device.
    Running = 1,
    /// Shutdown signaled, loop exiting.
    StoppingRequested = 2,
    /// Fatal device error or end of stream; reads have ceased.
    Degraded = 3,
    /// Loop exited and resources released.
    Stopped = 4,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DispatcherState::Starting,
            1 => DispatcherState::Running,
            2 => DispatcherState::StoppingRequested,
            3 => DispatcherState::Degraded,
            _ => DispatcherState::Stopped,
        }
    }
}

/// State shared between the engine context and the dispatcher thread.
pub(crate) struct DispatcherShared {
    stop: AtomicBool,
    state: AtomicU8,
    degraded: AtomicBool,
    channel: BoundedChannel,
    callback: Mutex<Option<ReadCallback>>,
}

impl DispatcherShared {
    pub(crate) fn new(channel: BoundedChannel) -> Self {
        Self {
            stop: AtomicBool::new(false),
            state: AtomicU8::new(DispatcherState::Starting as u8),
            degraded: AtomicBool::new(false),
            channel,
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn channel(&self) -> &BoundedChannel {
        &self.channel
    }

    pub(crate) fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Degradation is latched separately so it stays observable after the
    /// Degraded -> Stopped transition at shutdown.
    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Replace the callback registration. In-flight invocations keep the
    /// snapshot they already cloned.
    pub(crate) fn set_callback(&self, callback: Option<ReadCallback>) {
        *self.callback.lock().unwrap() = callback;
    }

    fn snapshot_callback(&self) -> Option<ReadCallback> {
        self.callback.lock().unwrap().clone()
    }

    /// Signal the dispatcher to stop and unblock it if it is waiting on a
    /// full channel.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        for from in [DispatcherState::Running, DispatcherState::Starting] {
            if self
                .state
                .compare_exchange(
                    from as u8,
                    DispatcherState::StoppingRequested as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        self.channel.close();
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(DispatcherState::Stopped as u8, Ordering::Release);
    }

    fn mark_degraded(&self, reason: &str) {
        self.degraded.store(true, Ordering::Release);
        self.state
            .store(DispatcherState::Degraded as u8, Ordering::Release);
        warn!(reason, "read dispatcher degraded, inbound delivery has ceased");
    }

    fn transition_running(&self) {
        let _ = self.state.compare_exchange(
            DispatcherState::Starting as u8,
            DispatcherState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Spawn the dispatcher thread.
pub(crate) fn spawn<T: Transport + 'static>(
    transport: Arc<T>,
    shared: Arc<DispatcherShared>,
    chunk_size: usize,
    read_timeout: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-read-dispatcher".to_string())
        .spawn(move || run(transport, shared, chunk_size, read_timeout))
        .expect("failed to spawn read dispatcher thread")
}

/// Dispatcher loop. Exits on stop signal, fatal device error, or end of
/// stream.
fn run<T: Transport>(
    transport: Arc<T>,
    shared: Arc<DispatcherShared>,
    chunk_size: usize,
    read_timeout: Duration,
) {
    debug!("read dispatcher started");
    let mut buf = vec![0u8; chunk_size];

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.transition_running();

        match transport.read(&mut buf, read_timeout) {
            Ok(0) => {
                shared.mark_degraded("end of stream from device");
                break;
            }
            Ok(n) => {
                trace!(len = n, "inbound chunk");
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                match shared.snapshot_callback() {
                    Some(callback) => {
                        // Delivery goes straight from the read buffer, never
                        // through the channel, so it cannot wait on channel
                        // space no matter the chunk size or buffered backlog.
                        let chunk = &buf[..n];
                        if panic::catch_unwind(AssertUnwindSafe(|| callback(chunk))).is_err() {
                            error!("read callback panicked");
                        }
                        shared.channel.record_delivered(n);
                    }
                    None => {
                        if !shared.channel.push(&buf[..n]) {
                            // Channel closed by shutdown while we were blocked.
                            break;
                        }
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                trace!(error = %e, "recoverable read error, retrying");
            }
            Err(e) => {
                shared.mark_degraded(&e.to_string());
                break;
            }
        }
    }

    debug!("read dispatcher exited");
}
