//! Byte stream to RMT pulse train conversion for SK6812 / WS2812 strips.
//!
//! One 32-bit RMT item per data bit, most significant bit first, followed by
//! a single reset item. Timings are in RMT ticks at 10 MHz.

use alloc::vec::Vec;

/// RMT tick rate the timings below assume
pub const RMT_TICK_HZ: u32 = 10_000_000;

/// 1-bit: 6 high cycles + 6 low cycles = 600ns high + 600ns low
pub const T1H: u16 = 6;
pub const T1L: u16 = 6;
/// 0-bit: 3 high cycles + 9 low cycles = 300ns high + 900ns low
pub const T0H: u16 = 3;
pub const T0L: u16 = 9;
/// Latch: 80us low
pub const RESET_TICKS: u16 = 800;

/// Build a single RMT item.
///
/// Same layout as `esp_hal::rmt::PulseCode`: `duration0 | level0 << 15 |
/// duration1 << 16 | level1 << 31`, durations limited to 15 bits.
pub const fn pulse_code(level0: bool, duration0: u16, level1: bool, duration1: u16) -> u32 {
    (duration0 as u32 & 0x7fff)
        | ((level0 as u32) << 15)
        | ((duration1 as u32 & 0x7fff) << 16)
        | ((level1 as u32) << 31)
}

pub const ONE_BIT: u32 = pulse_code(true, T1H, false, T1L);
pub const ZERO_BIT: u32 = pulse_code(true, T0H, false, T0L);
pub const RESET: u32 = pulse_code(false, RESET_TICKS, false, 0);

/// Number of items `encode_into` produces for `len` bytes.
pub const fn item_count(len: usize) -> usize {
    len * 8 + 1
}

/// Convert a single byte to RMT pulses
fn byte_to_pulses(byte: u8) -> [u32; 8] {
    let mut pulses = [0u32; 8];
    for (i, pulse) in pulses.iter_mut().enumerate() {
        *pulse = if (byte >> (7 - i)) & 1 == 1 {
            ONE_BIT
        } else {
            ZERO_BIT
        };
    }
    pulses
}

/// Encode a whole frame, reset item included, into `pulses`.
///
/// `pulses` is cleared first. It does not grow as long as it already has
/// room for [`item_count`] items.
pub fn encode_into(data: &[u8], pulses: &mut Vec<u32>) {
    pulses.clear();
    for &byte in data {
        pulses.extend_from_slice(&byte_to_pulses(byte));
    }
    pulses.push(RESET);
}
