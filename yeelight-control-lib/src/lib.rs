//! # Yeelight Control Library
//!
//! `yeelight-control-lib` is a Rust library for controlling Yeelight smart lights on the
//! local network. Devices speak a line-delimited JSON protocol over TCP and announce
//! themselves through a multicast search on port 1982.
//!
//! ## Features
//!
//! - Device discovery across every local IPv4 interface, with a persisted device cache
//! - Device sessions multiplexing concurrent commands on one connection
//! - Device notifications and connection events through a subscription
//! - Convenience setters for power, brightness, colour and colour temperature
//!
//! ## Example
//!
//! Discover devices and switch the first one on:
//!
//! ```no_run
//! use std::time::Duration;
//! use yeelight_control_lib::control_interface::{ConnectionOptions, ControlInterface};
//! use yeelight_control_lib::util::cache::DeviceCache;
//! use yeelight_control_lib::util::discovery::Discovery;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Discovery::new(DeviceCache::new("devices.json"));
//!     let devices = discovery.discover(Duration::from_secs(3), true).await;
//!
//!     if let Some(device) = devices.first() {
//!         let control = ControlInterface::from_device_record(device, ConnectionOptions::default());
//!         control.connect().await?;
//!         control.turn_on().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `control_interface` module holds the device session: connection lifecycle,
// command/response correlation, line framing and notification fan-out, plus the
// capability setters built on top of it.
//
// Example usage:
//
// ```
// use yeelight_control_lib::control_interface::{ConnectionOptions, ControlInterface, Effect};
//
// #[tokio::main]
// async fn main() {
//     let control = ControlInterface::new("192.168.1.100", ConnectionOptions::default());
//     control.connect().await.unwrap();
//     control.set_brightness(40, Effect::Sudden).await.unwrap();
// }
// ```
pub mod control_interface;

// Error taxonomy of device sessions.
pub mod error;

// The `util` module provides discovery and the device cache.
pub mod util;

pub use error::{Result, YeelightError};
