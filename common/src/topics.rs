pub const DEFAULT_COMMAND_TOPIC: &str = "powerstrip.command";
pub const DEFAULT_EVENT_TOPIC: &str = "powerstrip.event";

pub const EVENT_CONNECTED: &[u8] = b"connected";
