use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("channel {0} is outside 1..=8")]
    InvalidChannel(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("payload of {len} bytes exceeds the {max}-byte command buffer")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid channel in command `{command}`")]
    InvalidChannel { command: String },
}

/// Failure of a single broker operation. Connect failures are retried by the
/// supervisor up to the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("timed out waiting for broker acknowledgement")]
    Timeout,
    #[error("not connected to broker")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("broker unreachable after {attempts} attempts; restart requested")]
    RetryCeilingExceeded { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("OTA Auth Failed")]
    Auth,
    #[error("OTA Begin Failed")]
    Begin,
    #[error("OTA Connect Failed")]
    Connect,
    #[error("OTA Receive Failed")]
    Receive,
    #[error("OTA End Failed")]
    End,
}

impl UpdateError {
    pub fn code(self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::Begin => 1,
            Self::Connect => 2,
            Self::Receive => 3,
            Self::End => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{0} must be between 1 and 65535")]
    InvalidPort(&'static str),
}
