use crate::platform::{Delay, StatusLed};

/// Interval between LED toggles while waiting for network association.
pub const ASSOCIATION_BLINK_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkStep {
    pub lit: bool,
    pub hold_ms: u64,
}

/// Fast double blink followed by a pause, shown between broker retries.
pub const RECONNECT_BLINK: [BlinkStep; 4] = [
    BlinkStep { lit: false, hold_ms: 100 },
    BlinkStep { lit: true, hold_ms: 100 },
    BlinkStep { lit: false, hold_ms: 100 },
    BlinkStep { lit: true, hold_ms: 700 },
];

pub fn play<L, D>(pattern: &[BlinkStep], led: &mut L, delay: &mut D)
where
    L: StatusLed + ?Sized,
    D: Delay + ?Sized,
{
    for step in pattern {
        led.set(step.lit);
        delay.delay_ms(step.hold_ms);
    }
}
