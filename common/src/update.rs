use std::fmt;

use log::{error, info};

use crate::{error::UpdateError, platform::StatusLed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Application,
    Filesystem,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("application"),
            Self::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// Lifecycle callbacks the update service invokes on the control thread.
pub trait UpdateHooks {
    fn on_start(&mut self, kind: UpdateKind);
    fn on_progress(&mut self, progress: u64, total: u64);
    fn on_end(&mut self);
    fn on_error(&mut self, error: UpdateError);
}

/// Remote firmware update service.
pub trait UpdateService {
    fn set_reboot_on_success(&mut self, reboot: bool);
    fn begin(&mut self) -> std::io::Result<()>;
    /// Services a pending update, if any. Returns immediately when idle.
    fn poll(&mut self, hooks: &mut dyn UpdateHooks);
}

pub fn progress_percent(progress: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (progress.saturating_mul(100) / total).min(100) as u8
}

/// Reflects update progress on the status LED and logs the lifecycle.
pub struct UpdateTrigger<'a, L: ?Sized> {
    led: &'a mut L,
}

impl<'a, L: StatusLed + ?Sized> UpdateTrigger<'a, L> {
    pub fn new(led: &'a mut L) -> Self {
        Self { led }
    }
}

impl<L: StatusLed + ?Sized> UpdateHooks for UpdateTrigger<'_, L> {
    fn on_start(&mut self, kind: UpdateKind) {
        self.led.set(false);
        info!("OTA start updating {kind}");
    }

    fn on_progress(&mut self, progress: u64, total: u64) {
        info!("OTA progress: {}%", progress_percent(progress, total));
        self.led.toggle();
    }

    fn on_end(&mut self) {
        info!("OTA end");
    }

    fn on_error(&mut self, error: UpdateError) {
        error!("OTA error[{}]: {error}", error.code());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::MockLed;

    #[test]
    fn percentage_is_integer_and_bounded() {
        assert_eq!(progress_percent(0, 1_000), 0);
        assert_eq!(progress_percent(333, 1_000), 33);
        assert_eq!(progress_percent(1_000, 1_000), 100);
        assert_eq!(progress_percent(1_500, 1_000), 100);
        assert_eq!(progress_percent(10, 0), 0);
        assert_eq!(progress_percent(7, 50), 14);
    }

    #[test]
    fn led_goes_dark_on_start_and_toggles_on_progress() {
        let mut led = MockLed::default();
        led.set(true);
        {
            let mut trigger = UpdateTrigger::new(&mut led);
            trigger.on_start(UpdateKind::Application);
            trigger.on_progress(100, 400);
            trigger.on_progress(200, 400);
            trigger.on_progress(300, 400);
            trigger.on_end();
        }

        assert_eq!(led.history, vec![true, false, true, false, true]);
    }

    #[test]
    fn error_codes_follow_the_fixed_table() {
        let codes: Vec<_> = [
            UpdateError::Auth,
            UpdateError::Begin,
            UpdateError::Connect,
            UpdateError::Receive,
            UpdateError::End,
        ]
        .iter()
        .map(|error| (error.code(), error.to_string()))
        .collect();

        assert_eq!(
            codes,
            vec![
                (0, "OTA Auth Failed".to_string()),
                (1, "OTA Begin Failed".to_string()),
                (2, "OTA Connect Failed".to_string()),
                (3, "OTA Receive Failed".to_string()),
                (4, "OTA End Failed".to_string()),
            ]
        );
    }
}
