//! WiFi module for ESP32-C3 board
//!
//! Station-mode link management on esp-wifi 0.14.1 with embassy-net DHCP. Loss of the
//! link is reported through a registered callback so the telemetry worker can tear down
//! its broker session.

use core::net::Ipv4Addr;

use embassy_net::Stack;
use embassy_time::{with_timeout, Duration, Timer};
use esp_wifi::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController};
use log::{info, warn};

/// Association wait after `connect`
pub const WIFI_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// DHCP lease wait after association
pub const DHCP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WifiError {
    #[error("invalid WiFi credentials")]
    InvalidCredentials,
    #[error("WiFi driver error")]
    Driver,
    #[error("WiFi association timed out")]
    AssociationTimeout,
    #[error("DHCP lease timed out")]
    DhcpTimeout,
}

/// WiFi manager for handling network connectivity
pub struct WiFiManager<'a> {
    controller: WifiController<'a>,
    stack: Stack<'a>,
    started: bool,
    is_connected: bool,
    on_disconnect: Option<fn()>,
}

impl<'a> WiFiManager<'a> {
    pub fn new(controller: WifiController<'a>, stack: Stack<'a>) -> Self {
        Self {
            controller,
            stack,
            started: false,
            is_connected: false,
            on_disconnect: None,
        }
    }

    /// Register the callback run when an established link drops
    pub fn on_disconnect(&mut self, callback: fn()) {
        self.on_disconnect = Some(callback);
    }

    /// Associate with `ssid` and wait for a DHCP lease
    pub async fn connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiError> {
        info!("[WIFI] Connecting to WiFi network: {}", ssid);

        if !self.started {
            let client_config = ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| WifiError::InvalidCredentials)?,
                password: password
                    .try_into()
                    .map_err(|_| WifiError::InvalidCredentials)?,
                auth_method: if password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ..Default::default()
            };

            self.controller
                .set_configuration(&Configuration::Client(client_config))
                .map_err(|_| WifiError::Driver)?;
            self.controller.start().map_err(|_| WifiError::Driver)?;
            self.started = true;
        }

        self.controller.connect().map_err(|_| WifiError::Driver)?;

        let associated = with_timeout(WIFI_CONNECT_TIMEOUT, async {
            while !self.controller.is_connected().unwrap_or(false) {
                Timer::after(Duration::from_millis(200)).await;
            }
        })
        .await;
        if associated.is_err() {
            warn!("[WIFI] Association with {} timed out", ssid);
            return Err(WifiError::AssociationTimeout);
        }

        with_timeout(DHCP_TIMEOUT, self.stack.wait_config_up())
            .await
            .map_err(|_| WifiError::DhcpTimeout)?;

        self.is_connected = true;
        if let Some(ip) = self.ip_address() {
            info!("[WIFI] Connected, DHCP address {}", ip);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected && self.controller.is_connected().unwrap_or(false)
    }

    /// Current DHCP address
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.stack.config_v4().map(|config| config.address.address())
    }

    /// Poll the link; fires the disconnect callback on a connected -> lost edge
    pub fn monitor_connection(&mut self) -> bool {
        let current_status = self.controller.is_connected().unwrap_or(false);

        if self.is_connected && !current_status {
            warn!("[WIFI] WiFi connection lost!");
            self.is_connected = false;
            if let Some(callback) = self.on_disconnect {
                callback();
            }
        } else if !self.is_connected && current_status {
            info!("[WIFI] WiFi connection restored!");
            self.is_connected = true;
        }

        self.is_connected
    }
}
