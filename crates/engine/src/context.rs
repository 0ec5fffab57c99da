//! Engine context
//!
//! One context per open device. Owns the transport, the bounded inbound
//! channel, the callback registration, and the read dispatcher lifecycle.

use crate::channel::{BoundedChannel, ChannelStats};
use crate::config::EngineConfig;
use crate::dispatcher::{self, DispatcherShared, DispatcherState, ReadCallback};
use crate::error::{Error, Result, TransportError};
use crate::transport::{Transport, UsbTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// USB device I/O bridge: asynchronous inbound delivery via callback,
/// synchronous serialized outbound writes.
///
/// All operations take `&self` and are safe to call from any thread. The
/// registered callback runs on the dispatcher thread and must not call
/// [`Engine::shutdown`] (that would join the thread it runs on).
pub struct Engine<T: Transport> {
    shared: Arc<DispatcherShared>,
    /// Device handle slot; doubles as the write-path lock and is emptied at
    /// shutdown so the device is released.
    transport: Mutex<Option<Arc<T>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    write_timeout: Duration,
}

/// Engine over the rusb transport.
pub type UsbEngine = Engine<UsbTransport>;

impl Engine<UsbTransport> {
    /// Open the configured device and start reading from it.
    ///
    /// Fails with [`Error::InvalidCapacity`] before the device is touched if
    /// the configured capacity is zero, and with [`Error::DeviceUnavailable`]
    /// if the device cannot be opened.
    pub fn init(config: &EngineConfig) -> Result<UsbEngine> {
        config.validate()?;
        let transport = UsbTransport::open(&config.device)?;
        Engine::with_transport(transport, config)
    }
}

impl<T: Transport + 'static> Engine<T> {
    /// Start the engine over an already-open transport.
    pub fn with_transport(transport: T, config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let channel = BoundedChannel::new(config.capacity as usize, config.overflow)?;
        let shared = Arc::new(DispatcherShared::new(channel));
        let transport = Arc::new(transport);

        let handle = dispatcher::spawn(
            Arc::clone(&transport),
            Arc::clone(&shared),
            config.transfer.read_chunk as usize,
            config.transfer.read_timeout(),
        );

        info!(
            capacity = config.capacity,
            policy = ?config.overflow,
            "engine initialized"
        );

        Ok(Self {
            shared,
            transport: Mutex::new(Some(transport)),
            dispatcher: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            write_timeout: config.transfer.write_timeout(),
        })
    }
}

impl<T: Transport> Engine<T> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Atomically replace the read callback registration.
    ///
    /// `None` disables delivery: the dispatcher keeps draining the device
    /// into the channel but performs no invocation. An invocation already in
    /// flight finishes with the callback it snapshotted.
    pub fn set_read_callback(&self, callback: Option<ReadCallback>) -> Result<()> {
        self.ensure_open()?;
        self.shared.set_callback(callback);
        Ok(())
    }

    /// Convenience wrapper registering a closure as the read callback.
    pub fn on_read<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.set_read_callback(Some(Arc::new(callback)))
    }

    /// Synchronous write to the device OUT endpoint.
    ///
    /// Concurrent writers are serialized; the call returns once the whole
    /// buffer has been submitted to the device layer (short writes are
    /// continued). Zero-length writes succeed without contacting the device.
    /// Failures are returned as-is, never retried internally.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let slot = self.transport.lock().unwrap();
        let transport = slot.as_ref().ok_or(Error::NotInitialized)?;

        if data.is_empty() {
            return Ok(());
        }

        let mut offset = 0;
        while offset < data.len() {
            let n = transport
                .write(&data[offset..], self.write_timeout)
                .map_err(Error::WriteFailed)?;
            if n == 0 {
                return Err(Error::WriteFailed(TransportError::Other(
                    "device accepted no data".into(),
                )));
            }
            offset += n;
        }

        trace!(len = data.len(), "write submitted");
        Ok(())
    }

    /// Drain buffered inbound bytes without blocking.
    ///
    /// Serves callers that pull on demand instead of registering a
    /// callback; bytes buffer only while no callback is registered.
    /// Returns 0 when nothing is buffered.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.channel().pop(out))
    }

    /// Drain buffered inbound bytes, waiting up to `timeout` for the first
    /// byte to arrive.
    pub fn read_timeout(&self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.channel().pop_timeout(out, timeout))
    }

    /// Current dispatcher state.
    pub fn status(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Whether the dispatcher hit a fatal device error or end of stream.
    /// Latched: remains true after shutdown of a degraded engine.
    pub fn is_degraded(&self) -> bool {
        self.shared.is_degraded()
    }

    /// Unread bytes currently buffered in the channel.
    pub fn buffered(&self) -> usize {
        self.shared.channel().len()
    }

    /// Channel receive/drop counters.
    pub fn channel_stats(&self) -> ChannelStats {
        self.shared.channel().stats()
    }

    /// Stop the dispatcher, join it, and release the device.
    ///
    /// Blocks until the dispatcher has observed the stop signal and exited
    /// (bounded by one in-flight device read timeout). Serialized against
    /// itself; a second call fails with [`Error::NotInitialized`], as does
    /// every other operation afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock().unwrap();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::NotInitialized);
        }

        self.shared.request_stop();
        if let Some(handle) = dispatcher.take() {
            if handle.join().is_err() {
                error!("read dispatcher panicked");
            }
        }

        self.shared.channel().clear();
        self.transport.lock().unwrap().take();
        self.shared.mark_stopped();

        info!("engine shut down");
        Ok(())
    }
}

impl<T: Transport> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Drop for Engine<T> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.shutdown() {
                debug!("shutdown during drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;

    fn test_config(capacity: u32) -> EngineConfig {
        let mut config = EngineConfig::with_capacity(capacity);
        config.transfer.read_timeout_ms = 10;
        config
    }

    #[test]
    fn test_zero_capacity_rejected_before_device_open() {
        // UsbEngine::init validates before opening anything, so even on a
        // machine without the device the error is InvalidCapacity.
        let err = UsbEngine::init(&EngineConfig::with_capacity(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidCapacity));
    }

    #[test]
    fn test_with_transport_zero_capacity() {
        let err = Engine::with_transport(MockTransport::new(), &test_config(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidCapacity));
    }

    #[test]
    fn test_double_shutdown_rejected() {
        let engine = Engine::with_transport(MockTransport::new(), &test_config(64)).unwrap();
        engine.shutdown().unwrap();
        assert!(matches!(engine.shutdown(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_operations_after_shutdown() {
        let engine = Engine::with_transport(MockTransport::new(), &test_config(64)).unwrap();
        engine.shutdown().unwrap();

        assert!(matches!(engine.write(b"x"), Err(Error::NotInitialized)));
        assert!(matches!(
            engine.set_read_callback(None),
            Err(Error::NotInitialized)
        ));
        let mut out = [0u8; 4];
        assert!(matches!(engine.read(&mut out), Err(Error::NotInitialized)));
        assert_eq!(engine.status(), DispatcherState::Stopped);
    }

    #[test]
    fn test_drop_without_shutdown_joins() {
        let engine = Engine::with_transport(MockTransport::new(), &test_config(64)).unwrap();
        drop(engine);
    }
}
