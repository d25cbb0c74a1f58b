pub mod blink;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod platform;
pub mod relay;
pub mod supervisor;
pub mod topics;
pub mod update;

#[cfg(test)]
mod mock;

pub use command::{Command, CommandInterpreter, MAX_COMMAND_BYTES, MAX_PAYLOAD_BYTES};
pub use config::StripConfig;
pub use device::PowerStrip;
pub use error::{
    CommandError, ConfigError, RelayError, SupervisorError, TransportError, UpdateError,
};
pub use platform::{Board, Delay, Network, Platform, StatusLed, System, Transport};
pub use relay::{Channel, PinLevel, RelayBank, RelayOutputs, RelayState, CHANNEL_COUNT};
pub use supervisor::{ConnectivityPhase, ConnectivitySupervisor};
pub use topics::*;
pub use update::{UpdateHooks, UpdateKind, UpdateService, UpdateTrigger};
