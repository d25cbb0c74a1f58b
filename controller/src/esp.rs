use core::convert::TryInto;
use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyIOPin, AnyOutputPin},
        prelude::Peripherals,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::{EspOta, EspOtaUpdate},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};

use powerstrip_common::{
    Board, Delay, Network, PinLevel, Platform, PowerStrip, RelayOutputs, StatusLed, StripConfig,
    System, Transport, TransportError, UpdateError, UpdateKind, CHANNEL_COUNT,
};

use crate::ota::{ImageTarget, ImageWriter, OtaReceiver};

const NVS_NAMESPACE: &str = "powerstrip";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const LOOP_INTERVAL_MS: u64 = 10;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_CONNECT_POLL_MS: u64 = 50;
const MAX_QUEUED_MESSAGES: usize = 16;
const RESTART_GRACE_MS: u64 = 200;

/// Relay lines for channels 1..=8, open-drain and active-low.
const RELAY_PINS: [i32; CHANNEL_COUNT] = [13, 4, 16, 17, 19, 22, 23, 27];
const STATUS_LED_PIN: i32 = 2;
const ALL_OFF_LED_PIN: i32 = 32;
const POWER_LED_PIN: i32 = 33;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        StripConfig::default()
    });
    ensure_wifi_defaults(&mut config);
    if let Err(err) = config.validate() {
        warn!("stored config rejected ({err}); falling back to defaults");
        config = StripConfig::default();
        ensure_wifi_defaults(&mut config);
    }

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, ota_port={}",
        config.wifi_ssid, config.broker_host, config.broker_port, config.ota_port
    );

    let Peripherals { modem, .. } = Peripherals::take()?;

    // Relays must be released before anything else runs.
    let outputs = EspRelayOutputs::new().context("failed to configure relay outputs")?;
    let mut power_led = unsafe { PinDriver::output(AnyOutputPin::new(POWER_LED_PIN)) }?;
    power_led.set_high()?;
    let status_led = EspStatusLed::new(STATUS_LED_PIN)?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

    arm_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let board = Board::<EspPlatform> {
        network: EspNetwork { wifi },
        transport: EspMqttTransport::new(&config.broker_host, config.broker_port),
        updater: OtaReceiver::new(config.ota_port, config.ota_password.clone(), FlashImageTarget),
        outputs,
        status_led,
        delay: WatchdogDelay,
        system: EspSystem,
    };
    let mut strip = PowerStrip::new(&config, board);

    strip.setup()?;
    loop {
        feed_watchdog();
        strip.tick()?;
        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}

fn ensure_wifi_defaults(config: &mut StripConfig) {
    if config.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.wifi_ssid = ssid.to_string();
        }
    }

    if config.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.wifi_pass = pass.to_string();
        }
    }
}

fn load_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<StripConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(StripConfig::from_json(value)?),
        None => Ok(StripConfig::default()),
    }
}

struct EspPlatform;

impl Platform for EspPlatform {
    type Network = EspNetwork;
    type Transport = EspMqttTransport;
    type Updater = OtaReceiver<FlashImageTarget>;
    type Outputs = EspRelayOutputs;
    type StatusLed = EspStatusLed;
    type Delay = WatchdogDelay;
    type System = EspSystem;
}

struct EspRelayOutputs {
    lines: Vec<PinDriver<'static, AnyIOPin, Output>>,
    all_off_led: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspRelayOutputs {
    fn new() -> anyhow::Result<Self> {
        let mut lines = Vec::with_capacity(CHANNEL_COUNT);
        for pin in RELAY_PINS {
            let mut line = unsafe { PinDriver::output_od(AnyIOPin::new(pin)) }
                .with_context(|| format!("relay line GPIO{pin}"))?;
            line.set_high()?;
            lines.push(line);
        }

        let mut all_off_led = unsafe { PinDriver::output(AnyOutputPin::new(ALL_OFF_LED_PIN)) }?;
        all_off_led.set_high()?;

        Ok(Self { lines, all_off_led })
    }
}

impl RelayOutputs for EspRelayOutputs {
    fn write_lines(&mut self, levels: &[PinLevel; CHANNEL_COUNT]) {
        for (index, (line, level)) in self.lines.iter_mut().zip(levels).enumerate() {
            let result = match level {
                PinLevel::High => line.set_high(),
                PinLevel::Low => line.set_low(),
            };
            if let Err(err) = result {
                warn!("failed to drive relay line {}: {err}", index + 1);
            }
        }
    }

    fn set_all_off_indicator(&mut self, lit: bool) {
        let result = if lit {
            self.all_off_led.set_high()
        } else {
            self.all_off_led.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive all-off LED: {err}");
        }
    }
}

struct EspStatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

impl EspStatusLed {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }?;
        driver.set_high()?;
        Ok(Self {
            pin: driver,
            lit: true,
        })
    }
}

impl StatusLed for EspStatusLed {
    fn set(&mut self, lit: bool) {
        let result = if lit {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        } else {
            self.lit = lit;
        }
    }

    fn is_lit(&self) -> bool {
        self.lit
    }
}

struct EspNetwork {
    wifi: EspWifi<'static>,
}

impl EspNetwork {
    fn start_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.wifi.connect()?;
        Ok(())
    }
}

impl Network for EspNetwork {
    fn set_hostname(&mut self, hostname: &str) {
        if let Err(err) = self.wifi.sta_netif_mut().set_hostname(hostname) {
            warn!("failed to set hostname `{hostname}`: {err}");
        }
    }

    fn begin(&mut self, ssid: &str, password: &str) {
        info!("wifi connecting to `{ssid}`");
        if let Err(err) = self.start_station(ssid, password) {
            warn!("wifi station start failed: {err:#}");
        }
    }

    fn is_associated(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    // The IDF station does not retry a failed join by itself.
    fn rejoin(&mut self) {
        if !self.wifi.is_started().unwrap_or(false) {
            return;
        }
        let _ = self.wifi.disconnect();
        if let Err(err) = self.wifi.connect() {
            warn!("wifi rejoin failed: {err}");
        }
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }
}

/// State written by the MQTT client's event callback and read by the control loop.
#[derive(Default)]
struct MqttSession {
    connected: AtomicBool,
    failed: AtomicBool,
    inbox: Mutex<VecDeque<(String, Vec<u8>)>>,
}

impl MqttSession {
    fn on_event(&self, payload: EventPayload<'_, EspError>) {
        match payload {
            EventPayload::Connected(_) => self.connected.store(true, Ordering::Release),
            EventPayload::Disconnected => self.connected.store(false, Ordering::Release),
            EventPayload::Error(err) => {
                warn!("mqtt error: {err:?}");
                self.failed.store(true, Ordering::Release);
            }
            EventPayload::Received {
                topic: Some(topic),
                data,
                details,
                ..
            } => {
                // Fragmented deliveries are dropped; commands are far smaller than one fragment.
                if !matches!(details, Details::Complete) {
                    return;
                }
                let Ok(mut inbox) = self.inbox.lock() else {
                    return;
                };
                if inbox.len() >= MAX_QUEUED_MESSAGES {
                    warn!("mqtt inbox full; dropping oldest message");
                    inbox.pop_front();
                }
                inbox.push_back((topic.to_string(), data.to_vec()));
            }
            _ => {}
        }
    }
}

struct EspMqttTransport {
    url: String,
    client: Option<EspMqttClient<'static>>,
    session: Arc<MqttSession>,
}

impl EspMqttTransport {
    fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("mqtt://{host}:{port}"),
            client: None,
            session: Arc::new(MqttSession::default()),
        }
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, TransportError> {
        self.client.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Transport for EspMqttTransport {
    fn is_connected(&self) -> bool {
        self.client.is_some() && self.session.connected.load(Ordering::Acquire)
    }

    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        // The IDF client reconnects on its own; a fresh client keeps session
        // state owned by the supervisor.
        self.client = None;
        let session = Arc::new(MqttSession::default());
        self.session = session.clone();

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: (!username.is_empty()).then_some(username),
            password: (!password.is_empty()).then_some(password),
            ..Default::default()
        };

        let callback_session = session.clone();
        let client = EspMqttClient::new_cb(&self.url, &conf, move |event| {
            callback_session.on_event(event.payload())
        })
        .map_err(|err| TransportError::Unreachable(format!("{err:?}")))?;

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        while Instant::now() < deadline {
            if session.connected.load(Ordering::Acquire) {
                self.client = Some(client);
                return Ok(());
            }
            if session.failed.swap(false, Ordering::AcqRel) {
                return Err(TransportError::Unreachable(self.url.clone()));
            }
            feed_watchdog();
            thread::sleep(Duration::from_millis(MQTT_CONNECT_POLL_MS));
        }

        Err(TransportError::Timeout)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError::Unreachable(format!("{err:?}")))
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .map(|_| ())
            .map_err(|err| TransportError::Unreachable(format!("{err:?}")))
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let pending: Vec<_> = match self.session.inbox.lock() {
            Ok(mut inbox) => inbox.drain(..).collect(),
            Err(_) => return,
        };
        for (topic, payload) in pending {
            on_message(&topic, &payload);
        }
    }
}

struct WatchdogDelay;

impl Delay for WatchdogDelay {
    fn delay_ms(&mut self, ms: u64) {
        feed_watchdog();
        thread::sleep(Duration::from_millis(ms));
    }
}

struct EspSystem;

impl System for EspSystem {
    fn restart(&mut self) {
        warn!("restarting");
        restart();
    }
}

fn restart() {
    thread::sleep(Duration::from_millis(RESTART_GRACE_MS));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

/// Streams application images into the inactive OTA slot.
struct FlashImageTarget;

impl ImageWriter for EspOtaUpdate<'_> {
    fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        feed_watchdog();
        self.write(chunk)
            .map(|_| ())
            .map_err(|err| anyhow!("flash write failed: {err:?}"))
    }
}

impl ImageTarget for FlashImageTarget {
    fn install(
        &mut self,
        kind: UpdateKind,
        stream: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError> {
        if kind == UpdateKind::Filesystem {
            warn!("filesystem images are not supported on this board");
            return Err(UpdateError::Begin);
        }

        let mut ota = EspOta::new().map_err(|err| {
            warn!("OTA unavailable: {err:?}");
            UpdateError::Begin
        })?;
        let mut update = ota.initiate_update().map_err(|err| {
            warn!("failed to initiate OTA update: {err:?}");
            UpdateError::Begin
        })?;

        if let Err(err) = stream(&mut update) {
            if let Err(abort_err) = update.abort() {
                warn!("failed to abort OTA update: {abort_err:?}");
            }
            return Err(err);
        }

        update.complete().map_err(|err| {
            warn!("failed to finalize OTA update: {err:?}");
            UpdateError::End
        })
    }

    fn reboot(&mut self) {
        restart();
    }
}

/// Registers the control task with a panicking task watchdog. Both calls
/// tolerate a watchdog the bootloader already armed.
fn arm_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    wdt_result("init", unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })?;
    wdt_result("add", unsafe {
        esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
    })
}

fn wdt_result(step: &str, rc: esp_idf_svc::sys::esp_err_t) -> anyhow::Result<()> {
    match rc {
        esp_idf_svc::sys::ESP_OK | esp_idf_svc::sys::ESP_ERR_INVALID_STATE => Ok(()),
        code => Err(anyhow!("task watchdog {step} failed (esp_err_t {code})")),
    }
}

fn feed_watchdog() {
    unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
