//! LED rendering engine.
//!
//! The [`Renderer`] owns the pixel buffer. Two writers share it: the breathing
//! animation (ticked by [`Renderer::run_animation`]) and live pixel data from
//! the network. Every visible update snapshots the buffer, encodes it into an
//! RMT pulse train and hands it to a [`PulseOutput`].

pub mod animation;
pub mod color;
pub mod pulse;
mod status;

pub use status::LedStatus;

use crate::BoardError;
use alloc::vec::Vec;
use animation::{Breathing, BreathingConfig};
use color::{ChannelOrder, Rgbw};
use core::cell::RefCell;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker, Timer, with_timeout};
use log::{debug, info, warn};

/// Result of handing a pulse train to the transmitter
#[derive(Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// The frame is already on the wire; the pulse buffer comes straight back
    Completed(Vec<u32>),
    /// The buffer comes back later through [`Renderer::complete_transmission`]
    Pending,
}

/// A frame the transmitter refused, with its pulse buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct LinkError {
    pub error: BoardError,
    pub pulses: Vec<u32>,
}

/// Physical single-wire transmitter (the RMT channel on the board).
///
/// The renderer owns exactly one pulse buffer. It lends it to the output
/// for each frame and must get it back, either in the return value or
/// through [`Renderer::complete_transmission`].
pub trait PulseOutput {
    /// Start sending `pulses`. Must not block for the duration of the frame.
    fn start(&self, pulses: Vec<u32>) -> Result<LinkStatus, LinkError>;
}

/// LED operation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Breathing + status indication, every tick rewrites the buffer
    Autonomous,
    /// Live data owns the buffer, ticks leave it alone
    Mixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedStats {
    pub transmissions: u32,
    pub bytes_transmitted: u32,
    /// Transmit requests refused because a frame was still outstanding
    pub busy_skips: u32,
    pub last_transmission: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnimationCommand {
    Start,
    Stop,
}

struct RenderState {
    buffer: Vec<u8>,
    /// Copy of `buffer` taken for the frame being encoded
    frame: Vec<u8>,
    /// Encoded frame, `None` while lent to the output
    pulses: Option<Vec<u32>>,
    mode: RenderMode,
    breathing: Breathing,
    transmitting: bool,
    initialized: bool,
    stats: LedStats,
}

pub struct Renderer<O: PulseOutput> {
    output: O,
    data_pin: u8,
    led_count: usize,
    order: ChannelOrder,
    state: Mutex<CriticalSectionRawMutex, RefCell<RenderState>>,
    done: Signal<CriticalSectionRawMutex, ()>,
    animation: Signal<CriticalSectionRawMutex, AnimationCommand>,
}

impl<O: PulseOutput> Renderer<O> {
    /// Allocate a zeroed buffer for `led_count` pixels plus the frame and
    /// pulse buffers every transmit reuses, then send once so the strip
    /// starts dark. No later operation allocates.
    pub fn initialize(
        output: O,
        data_pin: u8,
        led_count: usize,
        order: ChannelOrder,
        animation: BreathingConfig,
    ) -> Result<Self, BoardError> {
        if led_count == 0 {
            return Err(BoardError::ConfigError);
        }
        let len = led_count
            .checked_mul(order.channels())
            .ok_or(BoardError::OutOfMemory)?;

        let buffer = zeroed(len)?;
        let frame = zeroed(len)?;
        let mut pulses = Vec::new();
        if pulses.try_reserve_exact(pulse::item_count(len)).is_err() {
            warn!(
                "[LED] Failed to allocate {} item pulse buffer",
                pulse::item_count(len)
            );
            return Err(BoardError::OutOfMemory);
        }

        let renderer = Self {
            output,
            data_pin,
            led_count,
            order,
            state: Mutex::new(RefCell::new(RenderState {
                buffer,
                frame,
                pulses: Some(pulses),
                mode: RenderMode::Autonomous,
                breathing: Breathing::new(animation),
                transmitting: false,
                initialized: true,
                stats: LedStats::default(),
            })),
            done: Signal::new(),
            animation: Signal::new(),
        };

        info!(
            "[LED] {} LEDs x {} channels on GPIO{} ({} bytes)",
            led_count,
            renderer.order.channels(),
            data_pin,
            len
        );

        renderer.transmit()?;
        Ok(renderer)
    }

    /// Get the transmitter for advanced operations
    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn data_pin(&self) -> u8 {
        self.data_pin
    }

    pub fn led_count(&self) -> usize {
        self.led_count
    }

    pub fn order(&self) -> &ChannelOrder {
        &self.order
    }

    pub fn buffer_len(&self) -> usize {
        self.state.lock(|s| s.borrow().buffer.len())
    }

    /// Copy `data` into the buffer at byte `offset`. Bytes past the end are
    /// dropped. Returns the number of bytes written; never transmits.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<usize, BoardError> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if !s.initialized {
                return Err(BoardError::InvalidState);
            }
            let len = s.buffer.len();
            if offset >= len {
                warn!("[LED] Write at offset {} beyond buffer ({} bytes)", offset, len);
                return Ok(0);
            }
            let count = data.len().min(len - offset);
            if count < data.len() {
                warn!(
                    "[LED] Write truncated: {} of {} bytes at offset {}",
                    count,
                    data.len(),
                    offset
                );
            }
            s.buffer[offset..offset + count].copy_from_slice(&data[..count]);
            Ok(count)
        })
    }

    /// Send the current buffer.
    ///
    /// Fails with [`BoardError::Busy`] while the previous frame is outstanding;
    /// the buffer is then neither snapshotted nor encoded.
    pub fn transmit(&self) -> Result<(), BoardError> {
        let (frame, mut pulses) = self.state.lock(|s| {
            let mut guard = s.borrow_mut();
            let s = &mut *guard;
            if !s.initialized {
                return Err(BoardError::InvalidState);
            }
            let pulses = match s.pulses.take() {
                Some(pulses) if !s.transmitting => pulses,
                other => {
                    s.pulses = other;
                    s.stats.busy_skips = s.stats.busy_skips.wrapping_add(1);
                    return Err(BoardError::Busy);
                }
            };
            s.transmitting = true;
            let mut frame = core::mem::take(&mut s.frame);
            frame.copy_from_slice(&s.buffer);
            Ok((frame, pulses))
        })?;

        // Encoded outside the lock; `transmitting` keeps other callers out
        pulse::encode_into(&frame, &mut pulses);
        let frame_len = frame.len();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.initialized {
                s.frame = frame;
            }
        });

        self.done.reset();
        match self.output.start(pulses) {
            Ok(status) => {
                self.state.lock(|s| {
                    let mut s = s.borrow_mut();
                    s.stats.transmissions = s.stats.transmissions.wrapping_add(1);
                    s.stats.bytes_transmitted =
                        s.stats.bytes_transmitted.wrapping_add(frame_len as u32);
                    s.stats.last_transmission = Some(Instant::now());
                });
                if let LinkStatus::Completed(pulses) = status {
                    self.complete_transmission(pulses);
                }
                Ok(())
            }
            Err(LinkError { error, pulses }) => {
                self.state.lock(|s| {
                    let mut s = s.borrow_mut();
                    if s.initialized {
                        s.pulses = Some(pulses);
                    }
                    s.transmitting = false;
                });
                warn!("[LED] Transmit failed: {}", error);
                Err(error)
            }
        }
    }

    /// Called from the transmitter once a `Pending` frame is on the wire,
    /// handing the pulse buffer back.
    pub fn complete_transmission(&self, pulses: Vec<u32>) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.initialized {
                s.pulses = Some(pulses);
            }
            s.transmitting = false;
        });
        self.done.signal(());
    }

    pub fn is_transmitting(&self) -> bool {
        self.state.lock(|s| s.borrow().transmitting)
    }

    /// Wait until no frame is outstanding. Supports a single waiter.
    pub async fn wait_transmit_complete(&self, timeout: Duration) -> Result<(), BoardError> {
        with_timeout(timeout, async {
            while self.is_transmitting() {
                self.done.wait().await;
            }
        })
        .await
        .map_err(|_| BoardError::Timeout)
    }

    pub fn set_mode(&self, mode: RenderMode) {
        let previous = self.state.lock(|s| core::mem::replace(&mut s.borrow_mut().mode, mode));
        if previous != mode {
            info!("[LED] Mode switched: {:?}", mode);
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.state.lock(|s| s.borrow().mode)
    }

    pub fn set_status(&self, status: LedStatus) {
        debug!("[LED] Status updated: {:?}", status);
        self.set_status_color(status.color());
    }

    pub fn set_status_color(&self, color: Rgbw) {
        self.state.lock(|s| s.borrow_mut().breathing.set_status(color));
    }

    pub fn status_color(&self) -> Rgbw {
        self.state.lock(|s| s.borrow().breathing.status())
    }

    pub fn set_base_color(&self, color: Rgbw) {
        self.state.lock(|s| s.borrow_mut().breathing.set_base(color));
    }

    pub fn is_animation_enabled(&self) -> bool {
        self.state.lock(|s| s.borrow().breathing.is_enabled())
    }

    /// Turn breathing on or off. Either way the strip is cleared once; the
    /// first tick after enabling follows the settle delay.
    pub fn enable_animation(&self, enable: bool) -> Result<(), BoardError> {
        let changed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if !s.initialized {
                return Err(BoardError::InvalidState);
            }
            if s.breathing.is_enabled() == enable {
                return Ok(false);
            }
            if enable {
                s.breathing.enable();
            } else {
                s.breathing.disable();
            }
            s.buffer.fill(0);
            Ok(true)
        })?;
        if !changed {
            return Ok(());
        }

        info!("[LED] Breathing {}", if enable { "enabled" } else { "disabled" });
        self.animation.signal(if enable {
            AnimationCommand::Start
        } else {
            AnimationCommand::Stop
        });
        match self.transmit() {
            Err(BoardError::Busy) => Ok(()),
            other => other,
        }
    }

    /// Fill every pixel with `color`. Does not transmit.
    pub fn set_all(&self, color: Rgbw) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            for pixel in s.buffer.chunks_exact_mut(self.order.channels()) {
                self.order.write_pixel(pixel, color);
            }
        });
    }

    /// Zero the buffer. Does not transmit.
    pub fn clear(&self) {
        self.state.lock(|s| s.borrow_mut().buffer.fill(0));
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock(|s| s.borrow().buffer.clone())
    }

    pub fn stats(&self) -> LedStats {
        self.state.lock(|s| s.borrow().stats)
    }

    pub fn reset_stats(&self) {
        self.state.lock(|s| s.borrow_mut().stats = LedStats::default());
    }

    /// Stop the animation and release the buffer. Later writes and
    /// transmits fail with [`BoardError::InvalidState`].
    pub fn deinit(&self) {
        self.animation.signal(AnimationCommand::Stop);
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.breathing.disable();
            s.buffer = Vec::new();
            s.frame = Vec::new();
            s.pulses = None;
            s.transmitting = false;
            s.initialized = false;
        });
        info!("[LED] Renderer deinitialized");
    }

    /// One animation tick. No-op when breathing is off or live data owns the
    /// strip; otherwise steps brightness, repaints and transmits. A frame
    /// still on the wire makes this tick a skip.
    pub fn advance_animation(&self) -> Result<(), BoardError> {
        let painted = self.state.lock(|s| {
            let mut guard = s.borrow_mut();
            let s = &mut *guard;
            if !s.initialized || !s.breathing.is_enabled() || s.mode == RenderMode::Mixed {
                return false;
            }
            let frame = s.breathing.advance();
            let mut pixels = s.buffer.chunks_exact_mut(self.order.channels());
            if let Some(first) = pixels.next() {
                self.order.write_pixel(first, frame.status);
            }
            for pixel in pixels {
                self.order.write_pixel(pixel, frame.base);
            }
            true
        });
        if !painted {
            return Ok(());
        }

        match self.transmit() {
            Err(BoardError::Busy) => {
                debug!("[LED] Tick skipped, frame in flight");
                Ok(())
            }
            other => other,
        }
    }

    /// Animation task body: waits for breathing to be enabled, then ticks
    /// every period until it is disabled again.
    pub async fn run_animation(&self) -> ! {
        let config = self.state.lock(|s| *s.borrow().breathing.config());
        info!("[LED] Animation task started, period {} ms", config.period.as_millis());

        loop {
            while self.animation.wait().await != AnimationCommand::Start {}
            // A Start arriving mid-run settles again before ticking
            while self.settle_and_tick(&config).await == AnimationCommand::Start {}
        }
    }

    /// Settle delay followed by ticks, until the next command arrives.
    async fn settle_and_tick(&self, config: &BreathingConfig) -> AnimationCommand {
        if let Either::First(command) =
            select(self.animation.wait(), Timer::after(config.settle)).await
        {
            return command;
        }

        let mut ticker = Ticker::every(config.period);
        loop {
            match select(self.animation.wait(), ticker.next()).await {
                Either::First(command) => return command,
                Either::Second(()) => {
                    if let Err(e) = self.advance_animation() {
                        warn!("[LED] Animation tick failed: {}", e);
                    }
                }
            }
        }
    }
}

fn zeroed(len: usize) -> Result<Vec<u8>, BoardError> {
    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(len).is_err() {
        warn!("[LED] Failed to allocate {} byte pixel buffer", len);
        return Err(BoardError::OutOfMemory);
    }
    buffer.resize(len, 0);
    Ok(buffer)
}
