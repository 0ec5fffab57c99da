//! Device transport layer
//!
//! Defines the blocking byte transport the engine runs on top of, and the
//! rusb-backed implementation that talks to a real bulk endpoint pair.
//! Descriptor enumeration, discovery, and hotplug are a lower-layer concern
//! and deliberately absent here.

use crate::config::DeviceSettings;
use crate::error::{Error, TransportError, map_rusb_error};
use rusb::UsbContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Blocking byte transport to an open device endpoint pair.
///
/// Reads and writes target independent endpoints and may be issued
/// concurrently from different threads without extra locking.
pub trait Transport: Send + Sync {
    /// Blocking read of up to `buf.len()` bytes from the IN endpoint.
    ///
    /// Returns the number of bytes received; `Ok(0)` signals end of stream.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Blocking submit of `data` to the OUT endpoint.
    ///
    /// Returns the number of bytes the device layer accepted, which may be
    /// short; callers continue submission themselves.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).write(data, timeout)
    }
}

/// rusb-backed transport over one bulk IN / bulk OUT endpoint pair.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    in_endpoint: u8,
    out_endpoint: u8,
    interface: u8,
}

impl UsbTransport {
    /// Open the configured device and claim its interface.
    ///
    /// Detaches an active kernel driver first; the drop handler releases the
    /// interface and reattaches the driver to restore kernel control.
    pub fn open(settings: &DeviceSettings) -> crate::Result<Self> {
        let context = rusb::Context::new()
            .map_err(|e| Error::DeviceUnavailable(format!("libusb context: {}", e)))?;

        let handle = context
            .open_device_with_vid_pid(settings.vendor_id, settings.product_id)
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!(
                    "no device {:04x}:{:04x}",
                    settings.vendor_id, settings.product_id
                ))
            })?;

        match handle.kernel_driver_active(settings.interface) {
            Ok(true) => {
                debug!(interface = settings.interface, "detaching kernel driver");
                if let Err(e) = handle.detach_kernel_driver(settings.interface) {
                    warn!(
                        "failed to detach kernel driver from interface {}: {}",
                        settings.interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "could not check kernel driver status for interface {}: {}",
                    settings.interface, e
                );
            }
        }

        handle.claim_interface(settings.interface).map_err(|e| {
            Error::DeviceUnavailable(format!(
                "failed to claim interface {}: {}",
                settings.interface, e
            ))
        })?;

        debug!(
            vendor_id = format_args!("{:04x}", settings.vendor_id),
            product_id = format_args!("{:04x}", settings.product_id),
            "opened USB device"
        );

        Ok(Self {
            handle,
            in_endpoint: settings.in_endpoint,
            out_endpoint: settings.out_endpoint,
            interface: settings.interface,
        })
    }
}

impl Transport for UsbTransport {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.handle
            .read_bulk(self.in_endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(self.out_endpoint, data, timeout)
            .map_err(map_rusb_error)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("failed to release interface {}: {}", self.interface, e);
        }
        if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
            debug!(
                "could not reattach kernel driver to interface {} (may not have been detached): {}",
                self.interface, e
            );
        }
    }
}
