//! Logical colors and the strip's wire channel order.

use crate::BoardError;
use heapless::Vec;
use smart_leds::{RGBW, White};

pub type Rgbw = RGBW<u8>;

pub const fn rgbw(r: u8, g: u8, b: u8, w: u8) -> Rgbw {
    RGBW {
        r,
        g,
        b,
        a: White(w),
    }
}

pub const BLACK: Rgbw = rgbw(0, 0, 0, 0);

/// One byte slot of a pixel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
    White,
}

impl Channel {
    fn pick(self, color: Rgbw) -> u8 {
        match self {
            Channel::Red => color.r,
            Channel::Green => color.g,
            Channel::Blue => color.b,
            Channel::White => color.a.0,
        }
    }
}

/// Order in which a pixel's channels are sent, e.g. `GRBW` for SK6812.
/// The number of letters is the number of bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOrder {
    channels: Vec<Channel, 4>,
}

impl ChannelOrder {
    /// SK6812 RGBW wire order.
    pub fn grbw() -> Self {
        Self {
            channels: [Channel::Green, Channel::Red, Channel::Blue, Channel::White]
                .into_iter()
                .collect(),
        }
    }

    /// Parse a string such as `"GRB"` or `"rgbw"`.
    pub fn parse(text: &str) -> Result<Self, BoardError> {
        let mut channels = Vec::new();
        for c in text.trim().chars() {
            let channel = match c.to_ascii_uppercase() {
                'R' => Channel::Red,
                'G' => Channel::Green,
                'B' => Channel::Blue,
                'W' => Channel::White,
                _ => return Err(BoardError::ConfigError),
            };
            if channels.contains(&channel) {
                return Err(BoardError::ConfigError);
            }
            channels.push(channel).map_err(|_| BoardError::ConfigError)?;
        }
        if channels.is_empty() {
            return Err(BoardError::ConfigError);
        }
        Ok(Self { channels })
    }

    /// Bytes per pixel.
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Scatter `color` into one pixel slot of the buffer.
    pub fn write_pixel(&self, pixel: &mut [u8], color: Rgbw) {
        for (slot, channel) in pixel.iter_mut().zip(self.channels.iter()) {
            *slot = channel.pick(color);
        }
    }
}

/// Scale every channel by `brightness / max`.
pub fn scale(color: Rgbw, brightness: u8, max: u8) -> Rgbw {
    if max == 0 {
        return BLACK;
    }
    let s = |c: u8| (c as u16 * brightness.min(max) as u16 / max as u16) as u8;
    rgbw(s(color.r), s(color.g), s(color.b), s(color.a.0))
}
