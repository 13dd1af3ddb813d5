//! MTP transaction engine with a pooled, retrying connection layer.
//!
//! The host binding layer builds one [`MtpConnectionManager`] with a
//! [`DeviceOpener`] for its USB backend and a [`BridgeConfig`], then calls the
//! async operations on it. All logging goes through the `log` facade; the host
//! installs the logger.

pub mod config;
mod ignore_poison;
pub mod mtp;

pub use config::{BridgeConfig, CallClass};
pub use mtp::{DeviceOpener, MtpConnectionManager, MtpError, UsbTransport};
