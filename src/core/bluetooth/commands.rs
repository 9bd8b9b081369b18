//! MetaWear commands implementation
//! This module contains the commands the fleet sends to a sensor board
//! (LED, on-board logging, connection parameters) and the LED identity
//! protocol built on top of them.

use log::{debug, info};

use crate::core::registry::LedColor;
use crate::error::Result;

const MODULE_LED: u8 = 0x02;
const MODULE_LOGGING: u8 = 0x0b;
const MODULE_SETTINGS: u8 = 0x11;

const LED_PLAY: u8 = 0x01;
const LED_STOP: u8 = 0x02;
const LED_CONFIG: u8 = 0x03;
const LOGGING_ENABLE: u8 = 0x01;
const LOGGING_CIRCULAR_BUFFER: u8 = 0x0b;
const SETTINGS_CONNECTION_PARAMS: u8 = 0x09;

/// Repeat count meaning "until stopped"
pub const REPEAT_FOREVER: u8 = 0xff;

/// Number of pulses shown as the low-battery overlay
pub const LOW_BATTERY_PULSE_REPEATS: u8 = 15;

/// Physical LED channel of the board. Discriminants are the firmware ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedChannel {
    Green = 0,
    Red = 1,
    Blue = 2,
}

/// LED pattern presets, timings as shipped by the MetaWear SDK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternPreset {
    Blink,
    Solid,
    Pulse,
}

impl PatternPreset {
    /// (high intensity, low intensity, rise ms, high ms, fall ms, pulse duration ms)
    fn timings(&self) -> (u8, u8, u16, u16, u16, u16) {
        match self {
            Self::Blink => (31, 0, 0, 50, 0, 500),
            Self::Solid => (31, 31, 0, 500, 0, 1000),
            Self::Pulse => (31, 0, 725, 500, 725, 2000),
        }
    }

    /// Identity pattern: blink while unpositioned, solid once placed.
    pub fn for_identity(positioned: bool) -> Self {
        if positioned { Self::Solid } else { Self::Blink }
    }
}

/// Board commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    /// Stop the LED, optionally clearing queued patterns
    LedStop { clear: bool },
    /// Program one LED channel
    LedPattern {
        channel: LedChannel,
        preset: PatternPreset,
        repeat_count: u8,
    },
    /// Play programmed patterns
    LedPlay,
    /// Start on-board logging
    LoggingStart { overwrite: bool },
    /// Stop on-board logging
    LoggingStop,
    /// BLE connection parameters; intervals in 1.25 ms units, timeout in 10 ms units
    ConnectionParameters {
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
    },
}

impl SensorCommand {
    /// Connection parameters used after every connect (max interval 11.25 ms)
    pub const FAST_CONNECTION: SensorCommand = SensorCommand::ConnectionParameters {
        min_interval: 6,
        max_interval: 9,
        latency: 0,
        timeout: 600,
    };

    /// Convert the command to its byte representation. Some commands expand
    /// to more than one register write.
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        match *self {
            Self::LedStop { clear } => vec![vec![MODULE_LED, LED_STOP, clear as u8]],
            Self::LedPattern {
                channel,
                preset,
                repeat_count,
            } => {
                let (high, low, rise, high_time, fall, duration) = preset.timings();
                let mut frame = vec![MODULE_LED, LED_CONFIG, channel as u8, 0x02, high, low];
                for value in [rise, high_time, fall, duration, 0] {
                    frame.extend_from_slice(&value.to_le_bytes());
                }
                frame.push(repeat_count);
                vec![frame]
            }
            Self::LedPlay => vec![vec![MODULE_LED, LED_PLAY, 0x01]],
            Self::LoggingStart { overwrite } => vec![
                vec![MODULE_LOGGING, LOGGING_CIRCULAR_BUFFER, overwrite as u8],
                vec![MODULE_LOGGING, LOGGING_ENABLE, 0x01],
            ],
            Self::LoggingStop => vec![vec![MODULE_LOGGING, LOGGING_ENABLE, 0x00]],
            Self::ConnectionParameters {
                min_interval,
                max_interval,
                latency,
                timeout,
            } => {
                let mut frame = vec![MODULE_SETTINGS, SETTINGS_CONNECTION_PARAMS];
                for value in [min_interval, max_interval, latency, timeout] {
                    frame.extend_from_slice(&value.to_le_bytes());
                }
                vec![frame]
            }
        }
    }
}

/// LED channels that render a color. The board has no yellow LED, so yellow
/// lights red and green together.
pub fn led_channels(color: LedColor) -> &'static [LedChannel] {
    match color {
        LedColor::Red => &[LedChannel::Red],
        LedColor::Green => &[LedChannel::Green],
        LedColor::Blue => &[LedChannel::Blue],
        LedColor::Yellow => &[LedChannel::Red, LedChannel::Green],
        LedColor::Unassigned => &[],
    }
}

/// Full command sequence for showing `color` with `preset`.
/// Empty for an unassigned color.
pub fn led_program(color: LedColor, preset: PatternPreset, repeat_count: u8) -> Vec<SensorCommand> {
    let channels = led_channels(color);
    if channels.is_empty() {
        return Vec::new();
    }

    let mut program = vec![SensorCommand::LedStop { clear: true }];
    program.extend(channels.iter().map(|&channel| SensorCommand::LedPattern {
        channel,
        preset,
        repeat_count,
    }));
    program.push(SensorCommand::LedPlay);
    program
}

/// Command sender trait
#[async_trait::async_trait]
pub trait CommandSender: Send + Sync {
    /// Send a command to the board
    async fn send_command(&self, command: SensorCommand) -> Result<()>;
}

/// Command executor for a board
pub struct CommandExecutor<'a, T: CommandSender + ?Sized> {
    command_sender: &'a T,
}

impl<'a, T: CommandSender + ?Sized> CommandExecutor<'a, T> {
    /// Create a new CommandExecutor
    pub fn new(command_sender: &'a T) -> Self {
        Self { command_sender }
    }

    async fn send_all(&self, commands: &[SensorCommand]) -> Result<()> {
        for command in commands {
            debug!("Sending command: {:?}", command);
            self.command_sender.send_command(*command).await?;
        }
        Ok(())
    }

    /// Show the identity color: blink when unpositioned, solid when positioned
    pub async fn show_identity(&self, color: LedColor, positioned: bool) -> Result<()> {
        let preset = PatternPreset::for_identity(positioned);
        info!("Showing identity LED {} ({:?})", color, preset);
        self.send_all(&led_program(color, preset, REPEAT_FOREVER)).await
    }

    /// Low-battery overlay, independent of the position state
    pub async fn low_battery_pulse(&self, color: LedColor) -> Result<()> {
        self.send_all(&led_program(color, PatternPreset::Pulse, LOW_BATTERY_PULSE_REPEATS))
            .await
    }

    pub async fn turn_off_led(&self) -> Result<()> {
        self.send_all(&[SensorCommand::LedStop { clear: true }]).await
    }

    pub async fn apply_connection_parameters(&self) -> Result<()> {
        self.send_all(&[SensorCommand::FAST_CONNECTION]).await
    }

    pub async fn start_logging(&self) -> Result<()> {
        info!("Starting on-board logging");
        self.send_all(&[SensorCommand::LoggingStart { overwrite: true }])
            .await
    }

    pub async fn stop_logging(&self) -> Result<()> {
        info!("Stopping on-board logging");
        self.send_all(&[SensorCommand::LoggingStop]).await
    }
}
