//! Breathing effect shown while no live data drives the strip.

use super::color::{BLACK, Rgbw, scale};
use embassy_time::Duration;

/// Breathing effect parameters (~5 second cycle at the default rate)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreathingConfig {
    /// Tick period, 30fps ≈ 33.33ms
    pub period: Duration,
    pub step: u8,
    pub min: u8,
    pub max: u8,
    /// Delay between enabling and the first tick
    pub settle: Duration,
}

impl Default for BreathingConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(33),
            step: 2,
            min: 0,
            max: 180,
            settle: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rising,
    Falling,
}

/// One breathing frame: status color for pixel 0, base color for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub status: Rgbw,
    pub base: Rgbw,
}

#[derive(Debug, Clone)]
pub struct Breathing {
    config: BreathingConfig,
    enabled: bool,
    brightness: u8,
    direction: Direction,
    status: Rgbw,
    base: Rgbw,
}

impl Breathing {
    pub fn new(config: BreathingConfig) -> Self {
        Self {
            config,
            enabled: false,
            brightness: 0,
            direction: Direction::Rising,
            status: BLACK,
            base: BLACK,
        }
    }

    pub fn config(&self) -> &BreathingConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> Rgbw {
        self.status
    }

    pub fn set_status(&mut self, color: Rgbw) {
        self.status = color;
    }

    pub fn set_base(&mut self, color: Rgbw) {
        self.base = color;
    }

    /// Start over from dark, rising.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.brightness = 0;
        self.direction = Direction::Rising;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Step brightness once and return the colors to show.
    ///
    /// Brightness is clamped to `min..=max`; reaching a bound reverses the
    /// direction for the next step.
    pub fn advance(&mut self) -> Frame {
        let BreathingConfig { step, min, max, .. } = self.config;
        match self.direction {
            Direction::Rising => {
                self.brightness = self.brightness.saturating_add(step).min(max);
                if self.brightness >= max {
                    self.direction = Direction::Falling;
                }
            }
            Direction::Falling => {
                self.brightness = self.brightness.saturating_sub(step).max(min);
                if self.brightness <= min {
                    self.direction = Direction::Rising;
                }
            }
        }
        self.frame()
    }

    /// Colors at the current brightness.
    pub fn frame(&self) -> Frame {
        Frame {
            status: scale(self.status, self.brightness, self.config.max),
            base: scale(self.base, self.brightness, self.config.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led_control::color::rgbw;

    fn breathing() -> Breathing {
        let mut b = Breathing::new(BreathingConfig::default());
        b.set_status(rgbw(255, 0, 0, 0));
        b.set_base(rgbw(0, 0, 0, 200));
        b.enable();
        b
    }

    #[test]
    fn rises_then_falls_within_bounds() {
        let mut b = breathing();
        let mut peaked = false;
        for _ in 0..200 {
            b.advance();
            assert!(b.brightness() <= 180);
            if b.brightness() == 180 {
                peaked = true;
                assert_eq!(b.direction(), Direction::Falling);
            }
        }
        assert!(peaked);
    }

    #[test]
    fn full_cycle_returns_to_dark() {
        let mut b = breathing();
        // 90 steps up, 90 steps down
        for _ in 0..180 {
            b.advance();
        }
        assert_eq!(b.brightness(), 0);
        assert_eq!(b.direction(), Direction::Rising);
    }

    #[test]
    fn odd_step_clamps_at_bounds() {
        let mut b = Breathing::new(BreathingConfig {
            step: 7,
            min: 5,
            max: 20,
            ..BreathingConfig::default()
        });
        b.enable();
        let seen: Vec<u8> = (0..8)
            .map(|_| {
                b.advance();
                b.brightness()
            })
            .collect();
        assert_eq!(seen, [7, 14, 20, 13, 6, 5, 12, 19]);
    }

    #[test]
    fn frame_scales_colors() {
        let mut b = breathing();
        let frame = b.advance();
        assert_eq!(frame.status, rgbw((255 * 2 / 180) as u8, 0, 0, 0));
        assert_eq!(frame.base, rgbw(0, 0, 0, (200 * 2 / 180) as u8));
    }

    #[test]
    fn enable_resets_phase() {
        let mut b = breathing();
        for _ in 0..50 {
            b.advance();
        }
        b.enable();
        assert_eq!(b.brightness(), 0);
        assert_eq!(b.direction(), Direction::Rising);
    }
}
