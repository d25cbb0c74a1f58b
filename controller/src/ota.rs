use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use log::{info, warn};
use sha2::{Digest, Sha256};

use powerstrip_common::{UpdateError, UpdateHooks, UpdateKind, UpdateService};

const MAX_HEADER_BYTES: u64 = 256;
const OTA_CHUNK_SIZE: usize = 4096;
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

pub trait ImageWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
}

/// Where received images end up.
pub trait ImageTarget {
    /// Opens an image slot for `kind`, lets `stream` fill it and finalizes the
    /// image only when `stream` succeeds.
    fn install(
        &mut self,
        kind: UpdateKind,
        stream: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError>;

    fn reboot(&mut self);
}

#[derive(Debug, PartialEq, Eq)]
struct SessionHeader {
    kind: UpdateKind,
    size: u64,
    sha256: String,
    password: Option<String>,
}

// `<app|fs> <size> <sha256-hex> [password]`
fn parse_header(line: &str) -> Option<SessionHeader> {
    let mut parts = line.split_whitespace();
    let kind = match parts.next()? {
        "app" => UpdateKind::Application,
        "fs" => UpdateKind::Filesystem,
        _ => return None,
    };
    let size = parts.next()?.parse::<u64>().ok().filter(|size| *size > 0)?;
    let sha256 = parts.next()?.to_ascii_lowercase();
    if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let password = parts.next().map(str::to_string);
    if parts.next().is_some() {
        return None;
    }

    Some(SessionHeader {
        kind,
        size,
        sha256,
        password,
    })
}

fn hex_digest(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

fn reply(stream: &TcpStream, message: &str) {
    let mut writer = stream;
    if let Err(err) = writeln!(writer, "{message}") {
        warn!("failed to answer OTA client: {err}");
    }
}

/// Push-style update receiver. Uploaders connect over TCP, send a header line
/// and then the raw image. Idle polls never block; an accepted session runs
/// to completion inside [`UpdateService::poll`].
pub struct OtaReceiver<T> {
    port: u16,
    password: String,
    reboot_on_success: bool,
    listener: Option<TcpListener>,
    target: T,
}

impl<T: ImageTarget> OtaReceiver<T> {
    pub fn new(port: u16, password: impl Into<String>, target: T) -> Self {
        Self {
            port,
            password: password.into(),
            reboot_on_success: false,
            listener: None,
            target,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    #[cfg(test)]
    fn target(&self) -> &T {
        &self.target
    }

    fn run_session(
        &mut self,
        stream: &TcpStream,
        hooks: &mut dyn UpdateHooks,
    ) -> Result<(), UpdateError> {
        stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(SESSION_TIMEOUT)))
            .map_err(|err| {
                warn!("failed to configure OTA socket: {err}");
                UpdateError::Connect
            })?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .by_ref()
            .take(MAX_HEADER_BYTES)
            .read_line(&mut line)
            .map_err(|err| {
                warn!("failed to read OTA header: {err}");
                UpdateError::Connect
            })?;

        let header = parse_header(line.trim()).ok_or_else(|| {
            warn!("malformed OTA header `{}`", line.trim());
            UpdateError::Connect
        })?;

        if !self.password.is_empty() && header.password.as_deref() != Some(self.password.as_str())
        {
            return Err(UpdateError::Auth);
        }
        reply(stream, "OK");

        let total = header.size;
        self.target.install(header.kind, &mut |writer| {
            hooks.on_start(header.kind);

            let mut hasher = Sha256::new();
            let mut written = 0_u64;
            let mut chunk = [0_u8; OTA_CHUNK_SIZE];

            while written < total {
                let want = (total - written).min(OTA_CHUNK_SIZE as u64) as usize;
                let read = reader.read(&mut chunk[..want]).map_err(|err| {
                    warn!("OTA receive failed after {written} bytes: {err}");
                    UpdateError::Receive
                })?;
                if read == 0 {
                    warn!("OTA stream ended after {written} of {total} bytes");
                    return Err(UpdateError::Receive);
                }

                writer.write_chunk(&chunk[..read]).map_err(|err| {
                    warn!("failed writing OTA data: {err:#}");
                    UpdateError::Receive
                })?;
                hasher.update(&chunk[..read]);
                written = written.saturating_add(read as u64);
                hooks.on_progress(written, total);
            }

            let digest = hex_digest(&hasher.finalize());
            if digest != header.sha256 {
                warn!("sha256 mismatch (expected {}, got {digest})", header.sha256);
                return Err(UpdateError::End);
            }
            Ok(())
        })
    }
}

impl<T: ImageTarget> UpdateService for OtaReceiver<T> {
    fn set_reboot_on_success(&mut self, reboot: bool) {
        self.reboot_on_success = reboot;
    }

    fn begin(&mut self) -> io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;
        info!("OTA receiver listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    fn poll(&mut self, hooks: &mut dyn UpdateHooks) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        let (stream, peer) = match listener.accept() {
            Ok(connection) => connection,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!("OTA accept failed: {err}");
                return;
            }
        };

        info!("OTA session from {peer}");
        match self.run_session(&stream, hooks) {
            Ok(()) => {
                reply(&stream, "DONE");
                hooks.on_end();
                if self.reboot_on_success {
                    info!("rebooting into the new image");
                    self.target.reboot();
                }
            }
            Err(err) => {
                reply(&stream, &format!("ERR {err}"));
                hooks.on_error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::Shutdown,
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    impl ImageWriter for Vec<u8> {
        fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
            self.extend_from_slice(chunk);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryTarget {
        images: Vec<(UpdateKind, Vec<u8>)>,
        reboots: u32,
    }

    impl ImageTarget for MemoryTarget {
        fn install(
            &mut self,
            kind: UpdateKind,
            stream: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<(), UpdateError>,
        ) -> Result<(), UpdateError> {
            let mut image = Vec::new();
            stream(&mut image)?;
            self.images.push((kind, image));
            Ok(())
        }

        fn reboot(&mut self) {
            self.reboots += 1;
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Vec<String>,
    }

    impl UpdateHooks for RecordingHooks {
        fn on_start(&mut self, kind: UpdateKind) {
            self.events.push(format!("start {kind}"));
        }

        fn on_progress(&mut self, progress: u64, total: u64) {
            self.events.push(format!("progress {progress}/{total}"));
        }

        fn on_end(&mut self) {
            self.events.push("end".to_string());
        }

        fn on_error(&mut self, error: UpdateError) {
            self.events.push(format!("error {}", error.code()));
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex_digest(&Sha256::digest(data))
    }

    fn receiver(password: &str) -> OtaReceiver<MemoryTarget> {
        let mut receiver = OtaReceiver::new(0, password, MemoryTarget::default());
        receiver.set_reboot_on_success(true);
        receiver.begin().unwrap();
        receiver
    }

    /// Sends one session and services it; returns the client's view of the replies.
    fn upload(
        receiver: &mut OtaReceiver<MemoryTarget>,
        hooks: &mut RecordingHooks,
        header: String,
        body: Vec<u8>,
    ) -> String {
        let port = receiver.local_addr().unwrap().port();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(header.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            response
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while hooks.events.is_empty() && Instant::now() < deadline {
            receiver.poll(hooks);
            thread::sleep(Duration::from_millis(5));
        }
        client.join().unwrap()
    }

    #[test]
    fn parses_session_headers() {
        let sha = "a".repeat(64);
        assert_eq!(
            parse_header(&format!("app 1024 {sha} secret")),
            Some(SessionHeader {
                kind: UpdateKind::Application,
                size: 1024,
                sha256: sha.clone(),
                password: Some("secret".to_string()),
            })
        );
        assert_eq!(
            parse_header(&format!("fs 10 {}", sha.to_uppercase())).map(|h| h.kind),
            Some(UpdateKind::Filesystem)
        );
        assert_eq!(parse_header(&format!("boot 10 {sha}")), None);
        assert_eq!(parse_header(&format!("app 0 {sha}")), None);
        assert_eq!(parse_header("app 10 abc"), None);
        assert_eq!(parse_header(&format!("app 10 {sha} pw extra")), None);
    }

    #[test]
    fn installs_verified_image_and_reboots() {
        let mut receiver = receiver("secret");
        let mut hooks = RecordingHooks::default();
        let body: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        let header = format!("app {} {} secret\n", body.len(), sha256_hex(&body));

        let response = upload(&mut receiver, &mut hooks, header, body.clone());

        assert_eq!(response, "OK\nDONE\n");
        assert_eq!(hooks.events.first().map(String::as_str), Some("start application"));
        assert_eq!(hooks.events.last().map(String::as_str), Some("end"));
        assert!(hooks.events.contains(&"progress 10000/10000".to_string()));
        assert_eq!(receiver.target().images, vec![(UpdateKind::Application, body)]);
        assert_eq!(receiver.target().reboots, 1);
    }

    #[test]
    fn wrong_password_is_an_auth_failure() {
        let mut receiver = receiver("secret");
        let mut hooks = RecordingHooks::default();
        let body = b"image".to_vec();
        let header = format!("app {} {} guess\n", body.len(), sha256_hex(&body));

        let response = upload(&mut receiver, &mut hooks, header, body);

        assert_eq!(response, "ERR OTA Auth Failed\n");
        assert_eq!(hooks.events, vec!["error 0".to_string()]);
        assert!(receiver.target().images.is_empty());
    }

    #[test]
    fn checksum_mismatch_fails_at_end() {
        let mut receiver = receiver("");
        let mut hooks = RecordingHooks::default();
        let body = b"filesystem image".to_vec();
        let header = format!("fs {} {}\n", body.len(), "0".repeat(64));

        let response = upload(&mut receiver, &mut hooks, header, body);

        assert_eq!(response, "OK\nERR OTA End Failed\n");
        assert_eq!(hooks.events.last().map(String::as_str), Some("error 4"));
        assert!(receiver.target().images.is_empty());
        assert_eq!(receiver.target().reboots, 0);
    }

    #[test]
    fn truncated_body_is_a_receive_failure() {
        let mut receiver = receiver("");
        let mut hooks = RecordingHooks::default();
        let body = b"short".to_vec();
        let header = format!("app 64 {}\n", sha256_hex(&body));

        let response = upload(&mut receiver, &mut hooks, header, body);

        assert_eq!(response, "OK\nERR OTA Receive Failed\n");
        assert_eq!(hooks.events.last().map(String::as_str), Some("error 3"));
    }

    #[test]
    fn idle_poll_returns_immediately() {
        let mut receiver = receiver("");
        let mut hooks = RecordingHooks::default();
        receiver.poll(&mut hooks);
        assert!(hooks.events.is_empty());
    }
}
