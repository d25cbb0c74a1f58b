use log::{info, warn};

use crate::{
    error::CommandError,
    relay::{Channel, RelayBank, RelayOutputs, RelayState},
};

/// Size of the receive buffer inbound payloads are copied into.
pub const MAX_COMMAND_BYTES: usize = 100;
/// Largest payload that still leaves room for the terminator.
pub const MAX_PAYLOAD_BYTES: usize = MAX_COMMAND_BYTES - 1;

const CMD_PING: &[u8] = b"ping";
const CMD_SET: &[u8] = b"set";
const CMD_RESET: &[u8] = b"res";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    SetChannel(Channel),
    ResetChannel(Channel),
    Unknown,
}

impl Command {
    /// Decodes a raw payload. The payload is read up to its first NUL byte.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CommandError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }

        let message = match payload.iter().position(|byte| *byte == 0) {
            Some(end) => &payload[..end],
            None => payload,
        };

        if message == CMD_PING {
            Ok(Self::Ping)
        } else if let Some(rest) = message.strip_prefix(CMD_SET) {
            channel_argument(message, rest).map(Self::SetChannel)
        } else if let Some(rest) = message.strip_prefix(CMD_RESET) {
            channel_argument(message, rest).map(Self::ResetChannel)
        } else {
            Ok(Self::Unknown)
        }
    }
}

// Only the character right after the prefix is the channel digit.
fn channel_argument(message: &[u8], rest: &[u8]) -> Result<Channel, CommandError> {
    rest.first()
        .filter(|byte| byte.is_ascii_digit())
        .and_then(|digit| Channel::new(digit - b'0').ok())
        .ok_or_else(|| CommandError::InvalidChannel {
            command: String::from_utf8_lossy(message).into_owned(),
        })
}

/// Applies inbound commands to the relay bank.
pub struct CommandInterpreter<O> {
    bank: RelayBank<O>,
    debug: bool,
}

impl<O: RelayOutputs> CommandInterpreter<O> {
    pub fn new(bank: RelayBank<O>, debug: bool) -> Self {
        Self { bank, debug }
    }

    pub fn state(&self) -> RelayState {
        self.bank.state()
    }

    pub fn bank(&self) -> &RelayBank<O> {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut RelayBank<O> {
        &mut self.bank
    }

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<Command, CommandError> {
        if self.debug {
            info!("cmd> [{topic}] {}", String::from_utf8_lossy(payload));
        }

        let command = Command::parse(payload)?;
        match command {
            Command::Ping => info!("ping!"),
            Command::SetChannel(channel) => {
                info!("SET: {}", channel.number());
                self.bank.energize(channel);
            }
            Command::ResetChannel(channel) => {
                info!("RESET: {}", channel.number());
                self.bank.release(channel);
            }
            Command::Unknown => {
                if self.debug {
                    info!("ignoring unrecognized command");
                }
            }
        }

        Ok(command)
    }

    /// Message pump callback; errors are logged and never reported upstream.
    pub fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        if let Err(err) = self.handle_message(topic, payload) {
            warn!("command rejected: {err}");
        }
    }
}
