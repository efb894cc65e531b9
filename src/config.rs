//! Default configuration constants and the build-time board configuration.

use crate::BoardError;
use crate::led_control::color::{ChannelOrder, Rgbw, rgbw};
use crate::led_control::animation::BreathingConfig;

/// Default UDP port for LED data communication
pub const UDP_PORT: u16 = 23042;

/// Default LED data GPIO pin
pub const LED_DATA_PIN: u8 = 4;

/// Maximum supported LEDs per strip
pub const MAX_LEDS: usize = 500;

/// Largest datagram the server reads; longer ones are truncated by the socket
pub const MAX_PACKET_SIZE: usize = 4096;

/// Protocol header byte for connection check packets
pub const CONNECTION_CHECK_HEADER: u8 = 0x01;

/// Protocol header byte for LED data packets
pub const PROTOCOL_HEADER: u8 = 0x02;

/// Header bytes that are recognised but carry nothing yet
pub const RESERVED_HEADERS: [u8; 2] = [0x03, 0x04];

/// WiFi configuration
/// Read from environment variables at compile time
pub const WIFI_SSID: &str = env!("WIFI_SSID");
pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");

/// WiFi reconnection interval in milliseconds
pub const WIFI_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Live pixel data older than this hands the strip back to the animation
pub const LIVE_DATA_TIMEOUT_MS: u64 = 5000;

/// Interval of the firmware status report
pub const STATUS_REPORT_INTERVAL_SECS: u64 = 30;

/// Strip settings as loaded by `build.rs`
pub const LED_COUNT_SETTING: &str = env!("LED_COUNT");
pub const LED_COLOR_ORDER_SETTING: &str = env!("LED_COLOR_ORDER");
pub const BREATHING_BASE_COLOR_SETTING: &str = env!("BREATHING_BASE_COLOR");

/// Runtime view of the strip configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub udp_port: u16,
    pub data_pin: u8,
    pub led_count: usize,
    pub order: ChannelOrder,
    pub base_color: Rgbw,
    pub breathing: BreathingConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            udp_port: UDP_PORT,
            data_pin: LED_DATA_PIN,
            led_count: 60,
            order: ChannelOrder::grbw(),
            base_color: rgbw(0, 0, 0, 128),
            breathing: BreathingConfig::default(),
        }
    }
}

impl BoardConfig {
    /// Build the configuration from the values baked in by `build.rs`.
    pub fn from_build_env() -> Result<Self, BoardError> {
        Self::parse(
            LED_COUNT_SETTING,
            LED_COLOR_ORDER_SETTING,
            BREATHING_BASE_COLOR_SETTING,
        )
    }

    pub fn parse(led_count: &str, order: &str, base_color: &str) -> Result<Self, BoardError> {
        let led_count: usize = led_count
            .trim()
            .parse()
            .map_err(|_| BoardError::ConfigError)?;
        if led_count == 0 || led_count > MAX_LEDS {
            return Err(BoardError::ConfigError);
        }

        Ok(Self {
            led_count,
            order: ChannelOrder::parse(order)?,
            base_color: parse_hex_color(base_color)?,
            ..Self::default()
        })
    }

    /// Upper bound for pixel packet offsets, independent of the strip length.
    pub fn max_buffer_bytes(&self) -> usize {
        MAX_LEDS * self.order.channels()
    }
}

/// Parse `RRGGBBWW` (or `RRGGBB`, white = 0).
fn parse_hex_color(text: &str) -> Result<Rgbw, BoardError> {
    let text = text.trim().trim_start_matches('#');
    if !(text.len() == 6 || text.len() == 8) || !text.is_ascii() {
        return Err(BoardError::ConfigError);
    }

    let mut parts = [0u8; 4];
    for (i, part) in parts.iter_mut().enumerate().take(text.len() / 2) {
        *part = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
            .map_err(|_| BoardError::ConfigError)?;
    }
    Ok(rgbw(parts[0], parts[1], parts[2], parts[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_settings() {
        let config = BoardConfig::parse("120", "grb", "ff8000").unwrap();
        assert_eq!(config.led_count, 120);
        assert_eq!(config.order.channels(), 3);
        assert_eq!(config.base_color, rgbw(255, 128, 0, 0));
        assert_eq!(config.max_buffer_bytes(), MAX_LEDS * 3);
    }

    #[test]
    fn rejects_bad_settings() {
        assert_eq!(BoardConfig::parse("0", "GRBW", "00000080"), Err(BoardError::ConfigError));
        assert_eq!(BoardConfig::parse("501", "GRBW", "00000080"), Err(BoardError::ConfigError));
        assert_eq!(BoardConfig::parse("abc", "GRBW", "00000080"), Err(BoardError::ConfigError));
        assert_eq!(BoardConfig::parse("60", "GRBX", "00000080"), Err(BoardError::ConfigError));
        assert_eq!(BoardConfig::parse("60", "GRBW", "0000008"), Err(BoardError::ConfigError));
        assert_eq!(BoardConfig::parse("60", "GRBW", "zz000080"), Err(BoardError::ConfigError));
    }

    #[test]
    fn build_env_defaults_are_valid() {
        assert!(BoardConfig::from_build_env().is_ok());
    }
}
