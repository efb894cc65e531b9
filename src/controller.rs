//! Board controller: reacts to lifecycle transitions and routes live pixel
//! data into the renderer.

use crate::BoardError;
use crate::config::LIVE_DATA_TIMEOUT_MS;
use crate::led_control::color::Rgbw;
use crate::led_control::{LedStatus, PulseOutput, RenderMode, Renderer};
use crate::state_machine::{StateMachine, SystemEvent, SystemState, TransitionHandler};
use crate::udp_server::{PixelSink, ProtocolServer};
use core::cell::Cell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use log::{info, warn};

/// How long an address or service error is shown before recovery starts
pub const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Status color shown on pixel 0 for each state
pub fn status_for(state: SystemState) -> LedStatus {
    match state {
        SystemState::Init => LedStatus::Starting,
        SystemState::ConnectingNetwork => LedStatus::Connecting,
        SystemState::RequestingAddress
        | SystemState::NetworkReady
        | SystemState::StartingService
        | SystemState::ListeningService => LedStatus::NetworkReady,
        SystemState::Operational => LedStatus::Operational,
        SystemState::NetworkError => LedStatus::NetworkError,
        SystemState::AddressError | SystemState::ServiceError => LedStatus::ServiceError,
        SystemState::ServiceTimeout | SystemState::Reconnecting => LedStatus::Recovering,
    }
}

/// Failure event that a state deadline turns into
pub fn timeout_event(state: SystemState) -> Option<SystemEvent> {
    match state {
        SystemState::ConnectingNetwork => Some(SystemEvent::ConnectFailed),
        SystemState::RequestingAddress => Some(SystemEvent::AddressFailed),
        SystemState::StartingService => Some(SystemEvent::ServiceFailed),
        SystemState::Operational => Some(SystemEvent::ProbeTimeout),
        _ => None,
    }
}

pub struct BoardController<'a, O: PulseOutput> {
    renderer: &'a Renderer<O>,
    server: &'a ProtocolServer,
    base_color: Rgbw,
    idle_timeout: Duration,
    /// Time of the last live pixel write, `None` while the animation owns the strip
    live: Mutex<CriticalSectionRawMutex, Cell<Option<Instant>>>,
    live_started: Signal<CriticalSectionRawMutex, ()>,
}

impl<'a, O: PulseOutput> BoardController<'a, O> {
    pub fn new(renderer: &'a Renderer<O>, server: &'a ProtocolServer, base_color: Rgbw) -> Self {
        Self {
            renderer,
            server,
            base_color,
            idle_timeout: Duration::from_millis(LIVE_DATA_TIMEOUT_MS),
            live: Mutex::new(Cell::new(None)),
            live_started: Signal::new(),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Show the starting status and begin breathing.
    pub fn start(&self) -> Result<(), BoardError> {
        self.renderer.set_base_color(self.base_color);
        self.renderer.set_status(LedStatus::Starting);
        self.renderer.set_mode(RenderMode::Autonomous);
        self.renderer.enable_animation(true)
    }

    pub fn is_live(&self) -> bool {
        self.live.lock(|l| l.get().is_some())
    }

    /// Hand the strip back to the animation if live data has been quiet
    /// for the idle timeout. Returns whether it did.
    pub fn check_idle(&self, now: Instant) -> bool {
        let expired = self.live.lock(|l| match l.get() {
            Some(at) if now.saturating_duration_since(at) >= self.idle_timeout => {
                l.set(None);
                true
            }
            _ => false,
        });

        if expired {
            info!(
                "[MAIN] No LED data for {} ms, back to breathing",
                self.idle_timeout.as_millis()
            );
            self.renderer.set_mode(RenderMode::Autonomous);
            if !self.renderer.is_animation_enabled() {
                if let Err(e) = self.renderer.enable_animation(true) {
                    warn!("[MAIN] Could not restart breathing: {}", e);
                }
            }
        }
        expired
    }

    /// Idle watch task body.
    pub async fn run_idle_watch(&self) -> ! {
        loop {
            match self.live.lock(|l| l.get()) {
                None => self.live_started.wait().await,
                Some(at) => {
                    Timer::at(at + self.idle_timeout).await;
                    self.check_idle(Instant::now());
                }
            }
        }
    }

    /// An address or service error that has been shown long enough needs
    /// the network to be brought up again.
    pub fn recovery_due(&self, machine: &StateMachine, now: Instant) -> bool {
        matches!(
            machine.get_current_state(),
            SystemState::AddressError | SystemState::ServiceError
        ) && now.saturating_duration_since(machine.state_entered_at()) >= RECOVERY_DELAY
    }
}

impl<O: PulseOutput> TransitionHandler for BoardController<'_, O> {
    fn on_transition(&self, from: SystemState, to: SystemState, _machine: &StateMachine) {
        self.renderer.set_status(status_for(to));

        match to {
            SystemState::Init | SystemState::ConnectingNetwork => {
                if !self.renderer.is_animation_enabled() {
                    if let Err(e) = self.renderer.enable_animation(true) {
                        warn!("[MAIN] Could not enable breathing: {}", e);
                    }
                }
            }
            SystemState::StartingService => self.server.start(),
            SystemState::NetworkError | SystemState::ServiceError | SystemState::Reconnecting => {
                if self.server.request_stop() {
                    info!("[MAIN] UDP server stopped ({} -> {})", from, to);
                }
            }
            _ => {}
        }
    }

    fn on_timeout(&self, state: SystemState, machine: &StateMachine) {
        if let Some(event) = timeout_event(state) {
            // try_handle_event logs a full queue
            let _ = machine.try_handle_event(event);
        }
    }
}

impl<O: PulseOutput> PixelSink for BoardController<'_, O> {
    fn write_pixels(&self, offset: usize, data: &[u8]) {
        let was_live = self
            .live
            .lock(|l| l.replace(Some(Instant::now())))
            .is_some();
        if !was_live {
            info!("[MAIN] LED data received, switching to mixed mode");
            self.renderer.set_mode(RenderMode::Mixed);
            self.live_started.signal(());
        }

        if let Err(e) = self.renderer.write(offset, data) {
            warn!("[MAIN] LED write failed: {}", e);
        }
    }

    fn request_transmit(&self) {
        match self.renderer.transmit() {
            Ok(()) | Err(BoardError::Busy) => {}
            Err(e) => warn!("[MAIN] LED transmit failed: {}", e),
        }
    }
}
