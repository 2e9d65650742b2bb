//! Stream Broker - low-latency WebRTC relay for scrcpy-protocol device streams.
//!
//! Ingests a framed byte stream from a device driver, conditions the H.264/H.265/AV1
//! video and Opus audio elementary streams, and fans the result out to any number of
//! browser subscribers over WebRTC while routing control events back to the device.

pub mod bitstream;
pub mod broadcaster;
pub mod broker;
pub mod conditioner;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod state;
pub mod subscriber;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
