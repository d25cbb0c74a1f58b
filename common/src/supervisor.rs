use log::{debug, error, info, warn};

use crate::{
    blink::{self, ASSOCIATION_BLINK_MS, RECONNECT_BLINK},
    config::StripConfig,
    error::SupervisorError,
    platform::{Delay, Network, StatusLed, System, Transport},
    topics::EVENT_CONNECTED,
};

/// Association polls (200 ms each) between join retries. The wait itself has
/// no ceiling.
pub const REJOIN_AFTER_POLLS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityPhase {
    Disconnected,
    Associating,
    BrokerDisconnected,
    BrokerConnecting,
    Connected,
}

impl ConnectivityPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Associating => "ASSOCIATING",
            Self::BrokerDisconnected => "BROKER_DISCONNECTED",
            Self::BrokerConnecting => "BROKER_CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// Joins the network once at startup and keeps the broker session alive.
///
/// Association waits forever. Broker reconnection gives up after
/// `max_retries` failed attempts in a row and restarts the device.
#[derive(Debug, Clone)]
pub struct ConnectivitySupervisor {
    hostname: String,
    wifi_ssid: String,
    wifi_pass: String,
    client_id: String,
    username: String,
    password: String,
    command_topic: String,
    event_topic: String,
    max_retries: u32,
    phase: ConnectivityPhase,
    retries: u32,
}

impl ConnectivitySupervisor {
    pub fn new(config: &StripConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            wifi_ssid: config.wifi_ssid.clone(),
            wifi_pass: config.wifi_pass.clone(),
            client_id: config.device_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            command_topic: config.command_topic.clone(),
            event_topic: config.event_topic.clone(),
            max_retries: config.max_retries,
            phase: ConnectivityPhase::Disconnected,
            retries: 0,
        }
    }

    pub fn phase(&self) -> ConnectivityPhase {
        self.phase
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn enter(&mut self, phase: ConnectivityPhase) {
        if self.phase != phase {
            debug!("connectivity {} -> {}", self.phase.as_str(), phase.as_str());
            self.phase = phase;
        }
    }

    pub fn associate<N, L, D>(&mut self, network: &mut N, led: &mut L, delay: &mut D)
    where
        N: Network + ?Sized,
        L: StatusLed + ?Sized,
        D: Delay + ?Sized,
    {
        self.enter(ConnectivityPhase::Associating);
        led.set(false);
        delay.delay_ms(10);
        info!("connecting to `{}` as `{}`", self.wifi_ssid, self.hostname);

        network.set_hostname(&self.hostname);
        network.begin(&self.wifi_ssid, &self.wifi_pass);

        let mut waited_polls = 0_u32;
        while !network.is_associated() {
            delay.delay_ms(ASSOCIATION_BLINK_MS);
            led.toggle();

            waited_polls = waited_polls.wrapping_add(1);
            if waited_polls % REJOIN_AFTER_POLLS == 0 {
                info!("still not associated, retrying join to `{}`", self.wifi_ssid);
                network.rejoin();
            }
        }
        led.set(true);

        match network.local_ip() {
            Some(ip) => info!("network associated, IP address: {ip}"),
            None => info!("network associated"),
        }
        self.enter(ConnectivityPhase::BrokerDisconnected);
    }

    /// Blocks until the broker session is up. On success the command topic is
    /// subscribed before the retained `connected` event goes out.
    pub fn reconnect<T, L, D, S>(
        &mut self,
        transport: &mut T,
        led: &mut L,
        delay: &mut D,
        system: &mut S,
    ) -> Result<(), SupervisorError>
    where
        T: Transport + ?Sized,
        L: StatusLed + ?Sized,
        D: Delay + ?Sized,
        S: System + ?Sized,
    {
        self.retries = 0;
        led.set(true);

        while !transport.is_connected() {
            self.enter(ConnectivityPhase::BrokerConnecting);
            info!("connecting to MQTT broker as `{}`", self.client_id);

            match transport.connect(&self.client_id, &self.username, &self.password) {
                Ok(()) => {
                    info!("connected, subscribing to `{}`", self.command_topic);
                    if let Err(err) = transport.subscribe(&self.command_topic) {
                        warn!("subscribe to `{}` failed: {err}", self.command_topic);
                    }
                    if let Err(err) = transport.publish(&self.event_topic, EVENT_CONNECTED, true) {
                        warn!("connected event publish failed: {err}");
                    }
                    led.set(false);
                    self.enter(ConnectivityPhase::Connected);
                    info!("MQTT connected & subscribed");
                    return Ok(());
                }
                Err(err) => {
                    self.retries = self.retries.saturating_add(1);
                    warn!("broker connect attempt {} failed: {err}", self.retries);

                    if self.retries > self.max_retries {
                        error!("max retries reached, restarting");
                        system.restart();
                        return Err(SupervisorError::RetryCeilingExceeded {
                            attempts: self.retries,
                        });
                    }

                    blink::play(&RECONNECT_BLINK, led, delay);
                }
            }
        }

        self.enter(ConnectivityPhase::Connected);
        Ok(())
    }

    /// Per-tick check: re-establishes the broker session when it dropped.
    pub fn ensure_connected<T, L, D, S>(
        &mut self,
        transport: &mut T,
        led: &mut L,
        delay: &mut D,
        system: &mut S,
    ) -> Result<(), SupervisorError>
    where
        T: Transport + ?Sized,
        L: StatusLed + ?Sized,
        D: Delay + ?Sized,
        S: System + ?Sized,
    {
        if transport.is_connected() {
            return Ok(());
        }

        if self.phase == ConnectivityPhase::Connected {
            warn!("broker session lost");
        }
        self.enter(ConnectivityPhase::BrokerDisconnected);
        self.reconnect(transport, led, delay, system)
    }
}
