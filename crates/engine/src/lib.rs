//! USB device I/O bridge engine
//!
//! The native communication engine a thin host-language binding fronts:
//! asynchronous inbound data delivery (device reads pushed through a
//! capacity-bounded byte channel and handed to a registered callback) and
//! synchronous, serialized outbound writes. One engine per open device; a
//! dedicated dispatcher thread drains the device for the engine's whole
//! lifetime.
//!
//! # Example
//!
//! ```
//! use engine::{Engine, EngineConfig};
//! use engine::test_utils::MockTransport;
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MockTransport::new());
//! let config = EngineConfig::with_capacity(64);
//! let engine = Engine::with_transport(Arc::clone(&transport), &config).unwrap();
//!
//! engine.write(b"ping").unwrap();
//! assert_eq!(transport.writes(), vec![b"ping".to_vec()]);
//!
//! engine.shutdown().unwrap();
//! assert!(engine.write(b"pong").is_err());
//! ```
//!
//! Against real hardware, [`UsbEngine::init`] opens the configured device
//! via rusb and the same four operations apply: `init`,
//! `set_read_callback`, `write`, `shutdown`.

pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod transport;

pub use channel::{BoundedChannel, ChannelStats, OverflowPolicy};
pub use config::{DeviceSettings, EngineConfig, TransferSettings};
pub use context::{Engine, UsbEngine};
pub use dispatcher::{DispatcherState, ReadCallback};
pub use error::{Error, Result, TransportError, map_rusb_error};
pub use logging::setup_logging;
pub use transport::{Transport, UsbTransport};
