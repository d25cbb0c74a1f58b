use log::info;

use crate::error::RelayError;

pub const CHANNEL_COUNT: usize = 8;

/// A relay channel number, always within 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(u8);

impl Channel {
    pub fn new(number: u8) -> Result<Self, RelayError> {
        if (1..=CHANNEL_COUNT as u8).contains(&number) {
            Ok(Self(number))
        } else {
            Err(RelayError::InvalidChannel(number))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    fn mask(self) -> u8 {
        1 << (self.0 - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    High,
    Low,
}

/// Which channels are energized. Bit k is channel k+1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayState(u8);

impl RelayState {
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_all_off(self) -> bool {
        self.0 == 0
    }

    pub fn is_energized(self, channel: Channel) -> bool {
        self.0 & channel.mask() != 0
    }

    pub fn set_channel(&mut self, number: u8) -> Result<(), RelayError> {
        self.energize(Channel::new(number)?);
        Ok(())
    }

    pub fn clear_channel(&mut self, number: u8) -> Result<(), RelayError> {
        self.release(Channel::new(number)?);
        Ok(())
    }

    pub fn energize(&mut self, channel: Channel) {
        self.0 |= channel.mask();
    }

    pub fn release(&mut self, channel: Channel) {
        self.0 &= !channel.mask();
    }

    /// Physical line levels for every channel. The relay board is active-low,
    /// so an energized channel is driven low.
    pub fn line_levels(self) -> [PinLevel; CHANNEL_COUNT] {
        let mut levels = [PinLevel::High; CHANNEL_COUNT];
        for (index, level) in levels.iter_mut().enumerate() {
            if self.0 & (1 << index) != 0 {
                *level = PinLevel::Low;
            }
        }
        levels
    }
}

/// Physical outputs of the relay board plus the red "all off" indicator.
pub trait RelayOutputs {
    fn write_lines(&mut self, levels: &[PinLevel; CHANNEL_COUNT]);
    fn set_all_off_indicator(&mut self, lit: bool);
}

/// Owns the relay register and keeps the physical outputs in step with it.
pub struct RelayBank<O> {
    state: RelayState,
    outputs: O,
}

impl<O: RelayOutputs> RelayBank<O> {
    pub fn new(outputs: O) -> Self {
        Self {
            state: RelayState::default(),
            outputs,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    pub fn set_channel(&mut self, number: u8) -> Result<(), RelayError> {
        self.energize(Channel::new(number)?);
        Ok(())
    }

    pub fn clear_channel(&mut self, number: u8) -> Result<(), RelayError> {
        self.release(Channel::new(number)?);
        Ok(())
    }

    pub fn energize(&mut self, channel: Channel) {
        self.state.energize(channel);
        self.apply();
    }

    pub fn release(&mut self, channel: Channel) {
        self.state.release(channel);
        self.apply();
    }

    /// Re-derives every output line from the register in a single write.
    pub fn apply(&mut self) {
        info!(">> RELAY {:#010b}", self.state.bits());
        self.outputs.write_lines(&self.state.line_levels());
        self.outputs.set_all_off_indicator(self.state.is_all_off());
    }
}
