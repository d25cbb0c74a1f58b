use std::{
    cell::Cell,
    env, fs,
    fs::File,
    io::{BufWriter, Write},
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::PathBuf,
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Packet, QoS,
    RecvTimeoutError,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use powerstrip_common::{
    Board, Delay, Network, PinLevel, Platform, PowerStrip, RelayOutputs, StatusLed, StripConfig,
    SupervisorError, System, Transport, TransportError, UpdateError, UpdateKind, CHANNEL_COUNT,
};

use crate::ota::{ImageTarget, ImageWriter, OtaReceiver};

const LOOP_INTERVAL_MS: u64 = 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_SLICE: Duration = Duration::from_millis(5);
const MAX_EVENTS_PER_POLL: usize = 32;
const MQTT_REQUEST_CAPACITY: usize = 32;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn run() -> anyhow::Result<()> {
    // `init` also routes `log` records from the common crate into tracing.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    config.validate().context("invalid power strip configuration")?;
    let ota_dir = env::var("OTA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("powerstrip-ota"));

    info!(
        "config loaded: device=`{}`, broker=`{}:{}`, ota_port={}",
        config.device_id, config.broker_host, config.broker_port, config.ota_port
    );

    let restart = RestartFlag::default();
    loop {
        let board = host_board(&config, ota_dir.clone(), restart.clone());
        let mut strip = PowerStrip::<HostPlatform>::new(&config, board);

        info!("power strip booting");
        if let Err(err) = strip.setup() {
            report(err);
        }

        while !restart.take() {
            if let Err(err) = strip.tick() {
                report(err);
            }
            thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
        }

        // Dropping the strip releases the broker session and the OTA port
        // before the next boot.
        drop(strip);
        info!("simulated restart: relay state is volatile and starts from all-off");
    }
}

fn report(err: SupervisorError) {
    warn!("{err}");
}

fn load_config() -> anyhow::Result<StripConfig> {
    let mut config = match env::var("POWERSTRIP_CONFIG") {
        Ok(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file `{path}`"))?;
            StripConfig::from_json(&raw)
                .with_context(|| format!("failed to parse config file `{path}`"))?
        }
        Err(_) => StripConfig::default(),
    };

    if let Ok(host) = env::var("MQTT_HOST") {
        config.broker_host = host;
    }
    if let Some(port) = env_port("MQTT_PORT")? {
        config.broker_port = port;
    }
    if let Ok(user) = env::var("MQTT_USER") {
        config.username = user;
    }
    if let Ok(pass) = env::var("MQTT_PASS") {
        config.password = pass;
    }
    if let Some(port) = env_port("OTA_PORT")? {
        config.ota_port = port;
    }

    Ok(config)
}

fn env_port(key: &str) -> anyhow::Result<Option<u16>> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u16>()
            .map(Some)
            .with_context(|| format!("{key} must be a port number, got `{value}`")),
        Err(_) => Ok(None),
    }
}

/// Shared between the system service and the image target so that either can
/// end the current boot.
#[derive(Clone, Default)]
struct RestartFlag(Rc<Cell<bool>>);

impl RestartFlag {
    fn request(&self) {
        self.0.set(true);
    }

    fn take(&self) -> bool {
        self.0.replace(false)
    }
}

struct HostPlatform;

impl Platform for HostPlatform {
    type Network = HostNetwork;
    type Transport = MqttTransport;
    type Updater = OtaReceiver<FileImageTarget>;
    type Outputs = LoggedRelayOutputs;
    type StatusLed = LoggedLed;
    type Delay = SleepDelay;
    type System = HostSystem;
}

fn host_board(config: &StripConfig, ota_dir: PathBuf, restart: RestartFlag) -> Board<HostPlatform> {
    let target = FileImageTarget {
        dir: ota_dir,
        restart: restart.clone(),
    };

    Board {
        network: HostNetwork {
            probe: (config.broker_host.clone(), config.broker_port),
            joined: false,
        },
        transport: MqttTransport::new(&config.broker_host, config.broker_port),
        updater: OtaReceiver::new(config.ota_port, config.ota_password.clone(), target),
        outputs: LoggedRelayOutputs::default(),
        status_led: LoggedLed { lit: true },
        delay: SleepDelay,
        system: HostSystem { restart },
    }
}

/// The host is already online; association completes as soon as it begins.
struct HostNetwork {
    probe: (String, u16),
    joined: bool,
}

impl Network for HostNetwork {
    fn set_hostname(&mut self, hostname: &str) {
        debug!("hostname `{hostname}` (informational on host)");
    }

    fn begin(&mut self, ssid: &str, _password: &str) {
        if !ssid.is_empty() {
            debug!("ignoring wifi ssid `{ssid}` on host");
        }
        self.joined = true;
    }

    fn is_associated(&mut self) -> bool {
        self.joined
    }

    fn rejoin(&mut self) {
        self.joined = true;
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        // Connecting a UDP socket sends nothing; it only selects the route.
        let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        socket.connect((self.probe.0.as_str(), self.probe.1)).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }
}

struct MqttTransport {
    host: String,
    port: u16,
    client: Option<Client>,
    connection: Option<Connection>,
}

impl MqttTransport {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            client: None,
            connection: None,
        }
    }

    fn drop_session(&mut self) {
        self.client = None;
        self.connection = None;
    }

    fn client(&mut self) -> Result<&mut Client, TransportError> {
        self.client.as_mut().ok_or(TransportError::NotConnected)
    }
}

fn classify(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        other => TransportError::Unreachable(other.to_string()),
    }
}

impl Transport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connection.is_some()
    }

    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        self.drop_session();

        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !username.is_empty() {
            options.set_credentials(username, password);
        }

        let (client, mut connection) = Client::new(options, MQTT_REQUEST_CAPACITY);
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(format!("{:?}", ack.code)));
                    }
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(classify(err)),
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Unreachable("mqtt event loop closed".to_string()))
                }
            }
        }

        info!("mqtt session open to {}:{}", self.host, self.port);
        self.client = Some(client);
        self.connection = Some(connection);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError::Unreachable(err.to_string()))
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|err| TransportError::Unreachable(err.to_string()))
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let mut lost = false;
        for _ in 0..MAX_EVENTS_PER_POLL {
            match connection.recv_timeout(POLL_SLICE) {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    on_message(publish.topic.as_str(), &publish.payload[..]);
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt connection lost: {err}");
                    lost = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("mqtt event loop closed");
                    lost = true;
                    break;
                }
            }
        }

        if lost {
            self.drop_session();
        }
    }
}

#[derive(Default)]
struct LoggedRelayOutputs {
    last: Option<[PinLevel; CHANNEL_COUNT]>,
}

impl RelayOutputs for LoggedRelayOutputs {
    fn write_lines(&mut self, levels: &[PinLevel; CHANNEL_COUNT]) {
        if self.last.as_ref() == Some(levels) {
            return;
        }
        let lines: String = levels
            .iter()
            .map(|level| match level {
                PinLevel::High => 'H',
                PinLevel::Low => 'L',
            })
            .collect();
        info!("relay lines (ch1..ch8): {lines}");
        self.last = Some(*levels);
    }

    fn set_all_off_indicator(&mut self, lit: bool) {
        debug!("red LED {}", if lit { "on" } else { "off" });
    }
}

struct LoggedLed {
    lit: bool,
}

impl StatusLed for LoggedLed {
    fn set(&mut self, lit: bool) {
        if self.lit != lit {
            debug!("status LED {}", if lit { "on" } else { "off" });
        }
        self.lit = lit;
    }

    fn is_lit(&self) -> bool {
        self.lit
    }
}

struct SleepDelay;

impl Delay for SleepDelay {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

struct HostSystem {
    restart: RestartFlag,
}

impl System for HostSystem {
    fn restart(&mut self) {
        warn!("restart requested");
        self.restart.request();
    }
}

/// Writes received images into a directory instead of a flash partition.
struct FileImageTarget {
    dir: PathBuf,
    restart: RestartFlag,
}

impl ImageWriter for BufWriter<File> {
    fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.write_all(chunk)?;
        Ok(())
    }
}

impl ImageTarget for FileImageTarget {
    fn install(
        &mut self,
        kind: UpdateKind,
        stream: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError> {
        let name = match kind {
            UpdateKind::Application => "firmware.bin",
            UpdateKind::Filesystem => "filesystem.bin",
        };
        let image_path = self.dir.join(name);
        let partial_path = self.dir.join(format!("{name}.part"));

        let file = fs::create_dir_all(&self.dir)
            .and_then(|()| File::create(&partial_path))
            .map_err(|err| {
                warn!("cannot open {}: {err}", partial_path.display());
                UpdateError::Begin
            })?;
        let mut writer = BufWriter::new(file);

        if let Err(err) = stream(&mut writer) {
            drop(writer);
            if let Err(remove_err) = fs::remove_file(&partial_path) {
                warn!("failed to discard partial image: {remove_err}");
            }
            return Err(err);
        }

        writer
            .flush()
            .and_then(|()| fs::rename(&partial_path, &image_path))
            .map_err(|err| {
                warn!("failed to finalize {}: {err}", image_path.display());
                UpdateError::End
            })?;
        info!("{kind} image written to {}", image_path.display());
        Ok(())
    }

    fn reboot(&mut self) {
        self.restart.request();
    }
}
