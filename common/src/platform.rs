//! Services the firmware core drives but does not implement. Each target
//! (ESP-IDF or the host simulation) supplies one implementation per trait.

use std::net::Ipv4Addr;

use crate::{
    error::TransportError,
    relay::RelayOutputs,
    update::UpdateService,
};

/// Network association (WiFi station on the device).
pub trait Network {
    fn set_hostname(&mut self, hostname: &str);
    /// Starts joining the network. Completion is observed with [`Network::is_associated`].
    fn begin(&mut self, ssid: &str, password: &str);
    fn is_associated(&mut self) -> bool;
    /// Abandons a stalled join attempt and starts a new one with the same
    /// credentials.
    fn rejoin(&mut self);
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Publish/subscribe broker session.
pub trait Transport {
    fn is_connected(&self) -> bool;
    fn connect(&mut self, client_id: &str, username: &str, password: &str)
        -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError>;
    /// Delivers every buffered inbound message to `on_message`. Never blocks
    /// waiting for new traffic.
    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8]));
}

/// The connectivity status LED. `lit` means the pin is driven high.
pub trait StatusLed {
    fn set(&mut self, lit: bool);
    fn is_lit(&self) -> bool;

    fn toggle(&mut self) {
        let lit = self.is_lit();
        self.set(!lit);
    }
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

pub trait System {
    /// Hard restart. On the device this does not return.
    fn restart(&mut self);
}

pub trait Platform {
    type Network: Network;
    type Transport: Transport;
    type Updater: UpdateService;
    type Outputs: RelayOutputs;
    type StatusLed: StatusLed;
    type Delay: Delay;
    type System: System;
}

pub struct Board<P: Platform> {
    pub network: P::Network,
    pub transport: P::Transport,
    pub updater: P::Updater,
    pub outputs: P::Outputs,
    pub status_led: P::StatusLed,
    pub delay: P::Delay,
    pub system: P::System,
}
