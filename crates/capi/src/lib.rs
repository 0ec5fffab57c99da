//! C ABI over the USB bridge engine.
//!
//! Built as `staticlib` and `cdylib` for embedding from C or via FFI
//! binding layers (Python ctypes and the like). The surface is a thin
//! pointer-based wrapper around [`engine::UsbEngine`]: `usb_bridge_init`
//! hands out an opaque context pointer and `usb_bridge_shutdown` consumes
//! it. All other calls borrow the pointer and may run from any thread.

use engine::{EngineConfig, ReadCallback, UsbEngine, setup_logging};
use std::sync::{Arc, Once};
use tracing::error;

/// Inbound data callback: a borrowed byte pointer and its length. The
/// pointer is only valid for the duration of the call.
pub type ReadCallbackFn = unsafe extern "C" fn(data: *const u8, len: u32);

/// Call succeeded.
pub const USB_BRIDGE_OK: i32 = 0;
/// Context pointer was null or the engine is already shut down.
pub const USB_BRIDGE_ERR_NOT_INITIALIZED: i32 = -1;
/// The device rejected the write.
pub const USB_BRIDGE_ERR_WRITE_FAILED: i32 = -2;
/// A buffer pointer was null while its length was nonzero.
pub const USB_BRIDGE_ERR_INVALID_ARGUMENT: i32 = -3;

static LOGGING: Once = Once::new();

/// Open the configured device and start the read dispatcher.
///
/// `capacity` is the authoritative inbound channel capacity; zero is
/// rejected with a null return before any configuration is read or any
/// device is touched. Device and transfer settings come from the default
/// config file when present. Returns an opaque context pointer, or null
/// on failure.
///
/// The returned pointer must be released with [`usb_bridge_shutdown`].
#[unsafe(no_mangle)]
pub extern "C" fn usb_bridge_init(capacity: u32) -> *mut UsbEngine {
    LOGGING.call_once(|| {
        if let Err(e) = setup_logging("info") {
            eprintln!("usb-bridge: logging setup failed: {e}");
        }
    });

    if capacity == 0 {
        error!("init rejected: channel capacity must be greater than zero");
        return std::ptr::null_mut();
    }

    init_with_config(EngineConfig::load_or_default(), capacity)
}

fn init_with_config(mut config: EngineConfig, capacity: u32) -> *mut UsbEngine {
    config.capacity = capacity;
    match UsbEngine::init(&config) {
        Ok(bridge) => Box::into_raw(Box::new(bridge)),
        Err(e) => {
            error!("init failed: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Register or clear the inbound data callback.
///
/// Passing `None` (a null function pointer) disables delivery; inbound
/// bytes then accumulate for [`usb_bridge_read`]. The callback runs on
/// the dispatcher thread and must not call [`usb_bridge_shutdown`].
///
/// # Safety
///
/// `ctx` must be null or a pointer returned by [`usb_bridge_init`] that
/// has not been passed to [`usb_bridge_shutdown`]. A non-null `callback`
/// must remain callable until it is replaced or the context is shut down.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usb_bridge_set_read_callback(
    ctx: *mut UsbEngine,
    callback: Option<ReadCallbackFn>,
) -> i32 {
    let Some(bridge) = (unsafe { ctx.as_ref() }) else {
        return USB_BRIDGE_ERR_NOT_INITIALIZED;
    };

    let wrapped: Option<ReadCallback> = callback.map(|cb| {
        Arc::new(move |data: &[u8]| unsafe { cb(data.as_ptr(), data.len() as u32) })
            as ReadCallback
    });

    match bridge.set_read_callback(wrapped) {
        Ok(()) => USB_BRIDGE_OK,
        Err(_) => USB_BRIDGE_ERR_NOT_INITIALIZED,
    }
}

/// Synchronous write to the device OUT endpoint.
///
/// Blocks until the whole buffer has been submitted. Concurrent calls
/// are serialized. A zero-length write succeeds without touching the
/// device.
///
/// # Safety
///
/// `ctx` must be null or a live pointer from [`usb_bridge_init`]. `data`
/// must point to at least `len` readable bytes when `len` is nonzero.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usb_bridge_write(ctx: *mut UsbEngine, data: *const u8, len: u32) -> i32 {
    let Some(bridge) = (unsafe { ctx.as_ref() }) else {
        return USB_BRIDGE_ERR_NOT_INITIALIZED;
    };
    if len == 0 {
        return USB_BRIDGE_OK;
    }
    if data.is_null() {
        return USB_BRIDGE_ERR_INVALID_ARGUMENT;
    }

    let buf = unsafe { std::slice::from_raw_parts(data, len as usize) };
    match bridge.write(buf) {
        Ok(()) => USB_BRIDGE_OK,
        Err(engine::Error::NotInitialized) => USB_BRIDGE_ERR_NOT_INITIALIZED,
        Err(e) => {
            error!("write failed: {}", e);
            USB_BRIDGE_ERR_WRITE_FAILED
        }
    }
}

/// Drain buffered inbound bytes into `out` without blocking.
///
/// Returns the number of bytes written, zero when nothing is buffered,
/// or a negative error code.
///
/// # Safety
///
/// `ctx` must be null or a live pointer from [`usb_bridge_init`]. `out`
/// must point to at least `len` writable bytes when `len` is nonzero.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usb_bridge_read(ctx: *mut UsbEngine, out: *mut u8, len: u32) -> i32 {
    let Some(bridge) = (unsafe { ctx.as_ref() }) else {
        return USB_BRIDGE_ERR_NOT_INITIALIZED;
    };
    if len == 0 {
        return 0;
    }
    if out.is_null() {
        return USB_BRIDGE_ERR_INVALID_ARGUMENT;
    }

    let buf = unsafe { std::slice::from_raw_parts_mut(out, len.min(i32::MAX as u32) as usize) };
    match bridge.read(buf) {
        Ok(n) => n as i32,
        Err(_) => USB_BRIDGE_ERR_NOT_INITIALIZED,
    }
}

/// Current dispatcher state as an integer: 0 starting, 1 running,
/// 2 stopping, 3 degraded, 4 stopped.
///
/// # Safety
///
/// `ctx` must be null or a live pointer from [`usb_bridge_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usb_bridge_status(ctx: *mut UsbEngine) -> i32 {
    let Some(bridge) = (unsafe { ctx.as_ref() }) else {
        return USB_BRIDGE_ERR_NOT_INITIALIZED;
    };
    bridge.status() as i32
}

/// Stop the read dispatcher, release the device, and free the context.
///
/// Blocks until the dispatcher has exited. A null pointer is a no-op.
///
/// # Safety
///
/// `ctx` must be null or a pointer from [`usb_bridge_init`] that has not
/// already been passed to this function. After the call the pointer is
/// dangling; no other call may use it, including concurrently.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usb_bridge_shutdown(ctx: *mut UsbEngine) {
    if ctx.is_null() {
        return;
    }
    let bridge = unsafe { Box::from_raw(ctx) };
    if let Err(e) = bridge.shutdown() {
        error!("shutdown failed: {}", e);
    }
}
