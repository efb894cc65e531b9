#![cfg_attr(not(test), no_std)]

//! ESP32-C3 Ambient Light Hardware Board Library
//!
//! This library provides the firmware core of a WiFi-enabled LED controller:
//! a lifecycle state machine for network bring-up, a UDP protocol server that
//! receives probe and pixel packets, and a rendering engine that drives an
//! SK6812/WS2812 strip through the RMT peripheral.
//!
//! Everything hardware-specific sits behind small traits (`PulseOutput`,
//! `DatagramSocket`) so the core builds and is tested on the host; the
//! `firmware` feature adds the ESP32-C3 adapters.

extern crate alloc;

pub mod config;
pub mod controller;
pub mod led_control;
pub mod state_machine;
pub mod udp_server;

#[cfg(feature = "firmware")]
pub mod platform;
#[cfg(feature = "firmware")]
pub mod wifi;

pub use config::BoardConfig;

/// Project version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the atmosphere light board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    /// WiFi connection error
    WiFiError,
    /// UDP server error
    UdpError,
    /// LED control error
    LedError,
    /// Protocol parsing error
    ProtocolError,
    /// System error
    SystemError,
    /// A bounded wait elapsed
    Timeout,
    /// Event queue is full
    QueueFull,
    /// A transmission is still outstanding
    Busy,
    /// Buffer allocation failed
    OutOfMemory,
    /// Operation not valid in the current state
    InvalidState,
    /// Build-time configuration could not be parsed
    ConfigError,
}

impl core::fmt::Display for BoardError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            BoardError::WiFiError => "wifi error",
            BoardError::UdpError => "udp error",
            BoardError::LedError => "led error",
            BoardError::ProtocolError => "protocol error",
            BoardError::SystemError => "system error",
            BoardError::Timeout => "timed out",
            BoardError::QueueFull => "event queue full",
            BoardError::Busy => "transmission in progress",
            BoardError::OutOfMemory => "out of memory",
            BoardError::InvalidState => "invalid state",
            BoardError::ConfigError => "invalid configuration",
        };
        f.write_str(msg)
    }
}
