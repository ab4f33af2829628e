//! GPRS vehicle tracker
//!
//! Hardware-independent control loop plus drivers for a SIM808 modem. Everything
//! outside `hardware` builds for the host so the loop can be tested with fakes.

#![cfg_attr(not(test), no_std)]

pub mod at;
pub mod command;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod mqtt;
pub mod nmea;
pub mod sim808;
pub mod traits;

#[cfg(feature = "esp32s3")]
pub mod hardware;

#[cfg(test)]
mod testing;
