//! WiFi module for ESP32-C3 board
//!
//! Handles WiFi association using esp-wifi 0.14.1 with embassy-net DHCP and
//! translates link changes into state machine events.

use crate::controller::BoardController;
use crate::led_control::PulseOutput;
use crate::state_machine::{StateMachine, SystemEvent};
use crate::{BoardError, config};
use embassy_futures::select::{Either, select};
use embassy_net::{Ipv4Address, Stack};
use embassy_time::{Duration, Instant, Timer, with_timeout};
use esp_wifi::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController, WifiEvent};
use log::{info, warn};

/// DHCP has this long to produce an address
const ADDRESS_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a connected link checks whether recovery was requested
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// WiFi manager for handling network connectivity with real DHCP
pub struct WiFiManager<'a> {
    controller: WifiController<'a>,
    stack: Stack<'a>,
    configured: bool,
}

impl<'a> WiFiManager<'a> {
    /// Create a new WiFi manager instance
    pub fn new(controller: WifiController<'a>, stack: Stack<'a>) -> Self {
        Self {
            controller,
            stack,
            configured: false,
        }
    }

    /// Connect to WiFi network
    pub async fn connect(&mut self, ssid: &str, password: &str) -> Result<(), BoardError> {
        if !self.configured {
            info!("[WIFI] Configuring station for {}", ssid);
            let client_config = ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| BoardError::WiFiError)?,
                password: password.try_into().map_err(|_| BoardError::WiFiError)?,
                auth_method: AuthMethod::WPA2Personal,
                ..Default::default()
            };
            self.controller
                .set_configuration(&Configuration::Client(client_config))
                .map_err(|_| BoardError::WiFiError)?;
            self.controller
                .start_async()
                .await
                .map_err(|_| BoardError::WiFiError)?;
            self.configured = true;
        }

        info!("[WIFI] Connecting to WiFi network: {}", ssid);
        self.controller.connect_async().await.map_err(|e| {
            warn!("[WIFI] Connect failed: {:?}", e);
            BoardError::WiFiError
        })
    }

    pub async fn disconnect(&mut self) {
        if let Err(e) = self.controller.disconnect_async().await {
            warn!("[WIFI] Disconnect failed: {:?}", e);
        }
    }

    /// Wait for the DHCP lease
    pub async fn wait_for_address(&self, timeout: Duration) -> Result<Ipv4Address, BoardError> {
        with_timeout(timeout, self.stack.wait_config_up())
            .await
            .map_err(|_| BoardError::Timeout)?;
        self.stack
            .config_v4()
            .map(|config| config.address.address())
            .ok_or(BoardError::WiFiError)
    }

    /// WiFi task body. Connects, waits for an address, then supervises the
    /// link until it drops or an address/service error needs recovery.
    pub async fn run<O: PulseOutput>(
        &mut self,
        machine: &StateMachine,
        board: &BoardController<'_, O>,
    ) -> ! {
        loop {
            post(machine, SystemEvent::ConnectStart).await;

            if self.connect(config::WIFI_SSID, config::WIFI_PASSWORD).await.is_err() {
                post(machine, SystemEvent::ConnectFailed).await;
                Timer::after_millis(config::WIFI_RECONNECT_INTERVAL_MS).await;
                continue;
            }
            info!("[WIFI] Successfully connected to WiFi network");
            post(machine, SystemEvent::Connected).await;

            match self.wait_for_address(ADDRESS_TIMEOUT).await {
                Ok(ip) => {
                    info!("[WIFI] Real DHCP IP address: {}", ip);
                    post(machine, SystemEvent::AddressAcquired).await;
                    post(machine, SystemEvent::NetworkReady).await;
                }
                Err(_) => {
                    warn!("[WIFI] DHCP configuration not available");
                    post(machine, SystemEvent::AddressFailed).await;
                }
            }

            loop {
                match select(
                    self.controller.wait_for_event(WifiEvent::StaDisconnected),
                    Timer::after(SUPERVISE_INTERVAL),
                )
                .await
                {
                    Either::First(()) => {
                        warn!("[WIFI] WiFi connection lost!");
                        post(machine, SystemEvent::Disconnected).await;
                        break;
                    }
                    Either::Second(()) => {
                        if board.recovery_due(machine, Instant::now()) {
                            info!("[WIFI] Recovering from {}", machine.get_current_state());
                            post(machine, SystemEvent::ErrorRecovery).await;
                            self.disconnect().await;
                            break;
                        }
                    }
                }
            }

            Timer::after_millis(config::WIFI_RECONNECT_INTERVAL_MS).await;
        }
    }
}

async fn post(machine: &StateMachine, event: SystemEvent) {
    if let Err(e) = machine.handle_event(event).await {
        warn!("[WIFI] Could not post {}: {}", event, e);
    }
}
