use log::{info, warn};

use crate::{
    command::CommandInterpreter,
    config::StripConfig,
    error::SupervisorError,
    platform::{Board, Platform, StatusLed, Transport},
    relay::{RelayBank, RelayState},
    supervisor::{ConnectivityPhase, ConnectivitySupervisor},
    update::{UpdateService, UpdateTrigger},
};

/// The whole device: relay register, command handling and connectivity,
/// driven from one control loop.
pub struct PowerStrip<P: Platform> {
    network: P::Network,
    transport: P::Transport,
    updater: P::Updater,
    status_led: P::StatusLed,
    delay: P::Delay,
    system: P::System,
    interpreter: CommandInterpreter<P::Outputs>,
    supervisor: ConnectivitySupervisor,
}

impl<P: Platform> PowerStrip<P> {
    pub fn new(config: &StripConfig, board: Board<P>) -> Self {
        let Board {
            network,
            transport,
            updater,
            outputs,
            status_led,
            delay,
            system,
        } = board;

        Self {
            network,
            transport,
            updater,
            status_led,
            delay,
            system,
            interpreter: CommandInterpreter::new(RelayBank::new(outputs), config.debug),
            supervisor: ConnectivitySupervisor::new(config),
        }
    }

    pub fn relay_state(&self) -> RelayState {
        self.interpreter.state()
    }

    pub fn phase(&self) -> ConnectivityPhase {
        self.supervisor.phase()
    }

    pub fn interpreter(&self) -> &CommandInterpreter<P::Outputs> {
        &self.interpreter
    }

    pub fn transport(&self) -> &P::Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut P::Transport {
        &mut self.transport
    }

    pub fn updater_mut(&mut self) -> &mut P::Updater {
        &mut self.updater
    }

    pub fn status_led(&self) -> &P::StatusLed {
        &self.status_led
    }

    pub fn system(&self) -> &P::System {
        &self.system
    }

    /// Startup sequence: all relays off, join the network, arm the update
    /// service, then open the broker session.
    pub fn setup(&mut self) -> Result<(), SupervisorError> {
        self.interpreter.bank_mut().apply();

        self.supervisor
            .associate(&mut self.network, &mut self.status_led, &mut self.delay);

        info!("starting OTA handler");
        self.updater.set_reboot_on_success(true);
        match self.updater.begin() {
            Ok(()) => info!("OTA initialized"),
            Err(err) => warn!("OTA handler unavailable: {err}"),
        }

        self.supervisor.reconnect(
            &mut self.transport,
            &mut self.status_led,
            &mut self.delay,
            &mut self.system,
        )?;
        self.status_led.set(false);
        Ok(())
    }

    /// One pass of the control loop.
    pub fn tick(&mut self) -> Result<(), SupervisorError> {
        self.supervisor.ensure_connected(
            &mut self.transport,
            &mut self.status_led,
            &mut self.delay,
            &mut self.system,
        )?;

        let interpreter = &mut self.interpreter;
        self.transport
            .poll(&mut |topic, payload| interpreter.dispatch(topic, payload));

        let mut trigger = UpdateTrigger::new(&mut self.status_led);
        self.updater.poll(&mut trigger);
        Ok(())
    }
}
