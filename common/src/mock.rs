use std::{collections::VecDeque, net::Ipv4Addr};

use crate::{
    error::{TransportError, UpdateError},
    platform::{Board, Delay, Network, Platform, StatusLed, System, Transport},
    relay::{PinLevel, RelayOutputs, CHANNEL_COUNT},
    update::{UpdateHooks, UpdateKind, UpdateService},
};

#[derive(Debug, Default)]
pub struct RecordingOutputs {
    pub writes: Vec<[PinLevel; CHANNEL_COUNT]>,
    pub indicator: Vec<bool>,
}

impl RelayOutputs for RecordingOutputs {
    fn write_lines(&mut self, levels: &[PinLevel; CHANNEL_COUNT]) {
        self.writes.push(*levels);
    }

    fn set_all_off_indicator(&mut self, lit: bool) {
        self.indicator.push(lit);
    }
}

#[derive(Debug, Default)]
pub struct MockLed {
    lit: bool,
    pub history: Vec<bool>,
}

impl StatusLed for MockLed {
    fn set(&mut self, lit: bool) {
        self.lit = lit;
        self.history.push(lit);
    }

    fn is_lit(&self) -> bool {
        self.lit
    }
}

#[derive(Debug, Default)]
pub struct MockDelay {
    pub requested: Vec<u64>,
}

impl Delay for MockDelay {
    fn delay_ms(&mut self, ms: u64) {
        self.requested.push(ms);
    }
}

#[derive(Debug, Default)]
pub struct MockSystem {
    pub restarts: u32,
}

impl System for MockSystem {
    fn restart(&mut self) {
        self.restarts += 1;
    }
}

#[derive(Debug, Default)]
pub struct MockNetwork {
    pub hostname: Option<String>,
    pub began: bool,
    pub rejoins: u32,
    pending_polls: usize,
}

impl MockNetwork {
    pub fn associating_after(polls: usize) -> Self {
        Self {
            pending_polls: polls,
            ..Self::default()
        }
    }
}

impl Network for MockNetwork {
    fn set_hostname(&mut self, hostname: &str) {
        self.hostname = Some(hostname.to_string());
    }

    fn begin(&mut self, _ssid: &str, _password: &str) {
        self.began = true;
    }

    fn is_associated(&mut self) -> bool {
        if self.pending_polls == 0 {
            return true;
        }
        self.pending_polls -= 1;
        false
    }

    fn rejoin(&mut self) {
        self.rejoins += 1;
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(192, 168, 81, 42))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect { client_id: String },
    Subscribe(String),
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
}

/// Broker session that refuses a scripted number of connects.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: bool,
    failures_left: usize,
    inbox: VecDeque<(String, Vec<u8>)>,
    pub calls: Vec<TransportCall>,
}

impl MockTransport {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures_left: failures,
            ..Self::default()
        }
    }

    pub fn fail_next(&mut self, failures: usize) {
        self.failures_left = failures;
    }

    pub fn drop_session(&mut self) {
        self.connected = false;
    }

    pub fn push_message(&mut self, topic: &str, payload: &[u8]) {
        self.inbox.push_back((topic.to_string(), payload.to_vec()));
    }

    pub fn connect_attempts(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Connect { .. }))
            .count()
    }
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(
        &mut self,
        client_id: &str,
        _username: &str,
        _password: &str,
    ) -> Result<(), TransportError> {
        self.calls.push(TransportCall::Connect {
            client_id: client_id.to_string(),
        });
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(TransportError::Refused("not authorized".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.calls.push(TransportCall::Subscribe(topic.to_string()));
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        self.calls.push(TransportCall::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        while let Some((topic, payload)) = self.inbox.pop_front() {
            on_message(&topic, &payload);
        }
    }
}

#[derive(Debug)]
pub struct ScriptedUpdate {
    pub kind: UpdateKind,
    pub chunks: Vec<(u64, u64)>,
    pub outcome: Result<(), UpdateError>,
}

#[derive(Debug, Default)]
pub struct MockUpdater {
    pub reboot_on_success: Option<bool>,
    pub begun: bool,
    pub script: Option<ScriptedUpdate>,
}

impl UpdateService for MockUpdater {
    fn set_reboot_on_success(&mut self, reboot: bool) {
        self.reboot_on_success = Some(reboot);
    }

    fn begin(&mut self) -> std::io::Result<()> {
        self.begun = true;
        Ok(())
    }

    fn poll(&mut self, hooks: &mut dyn UpdateHooks) {
        let Some(script) = self.script.take() else {
            return;
        };
        hooks.on_start(script.kind);
        for (progress, total) in script.chunks {
            hooks.on_progress(progress, total);
        }
        match script.outcome {
            Ok(()) => hooks.on_end(),
            Err(err) => hooks.on_error(err),
        }
    }
}

pub struct MockPlatform;

impl Platform for MockPlatform {
    type Network = MockNetwork;
    type Transport = MockTransport;
    type Updater = MockUpdater;
    type Outputs = RecordingOutputs;
    type StatusLed = MockLed;
    type Delay = MockDelay;
    type System = MockSystem;
}

pub fn mock_board(connect_failures: usize) -> Board<MockPlatform> {
    Board {
        network: MockNetwork::associating_after(2),
        transport: MockTransport::failing(connect_failures),
        updater: MockUpdater::default(),
        outputs: RecordingOutputs::default(),
        status_led: MockLed::default(),
        delay: MockDelay::default(),
        system: MockSystem::default(),
    }
}
