//! Console commands
//! This module defines all the commands that can be typed at the console and
//! runs them against the application state.

use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;

use log::error;

use crate::core::bluetooth::DeviceStatus;
use crate::core::bluetooth::constants::DEFAULT_SCAN_DURATION_SECS;
use crate::core::registry::{Position, format_elapsed};
use crate::error::FleetError;
use crate::state::AppState;

pub const HELP: &str = "\
Commands:
  scan [secs]                  look for sensors nearby
  add <address|#n>             add a sensor (#n picks the n-th scan result)
  remove <address>             remove a sensor and switch its LED off
  position <address> <pos>     wrist, waist, right-ankle, left-ankle or none
  name <address> <text>        rename a sensor
  start | stop                 start or stop the logging session
  reconnect                    cycle every link
  reset                        switch all LEDs off and forget every sensor
  led <address>                show the identity LED again
  status | refresh             show the fleet, refresh reads every battery first
  help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    Scan { secs: u64 },
    Add { target: String },
    Remove { address: String },
    Position { address: String, position: Option<Position> },
    Name { address: String, name: String },
    Start,
    Stop,
    Reconnect,
    Reset,
    Led { address: String },
    Status,
    Refresh,
    Help,
    Quit,
}

fn required<'a>(arg: Option<&'a str>, what: &str) -> Result<&'a str, String> {
    arg.ok_or_else(|| format!("missing {}", what))
}

impl FromStr for FleetCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let command = match verb.to_ascii_lowercase().as_str() {
            "scan" => Self::Scan {
                secs: match words.next() {
                    Some(secs) => secs.parse().map_err(|_| format!("invalid duration: {}", secs))?,
                    None => DEFAULT_SCAN_DURATION_SECS,
                },
            },
            "add" => Self::Add {
                target: required(words.next(), "address")?.to_string(),
            },
            "remove" => Self::Remove {
                address: required(words.next(), "address")?.to_string(),
            },
            "position" => {
                let address = required(words.next(), "address")?.to_string();
                let position = match required(words.next(), "position")? {
                    "none" | "-" => None,
                    text => Some(text.parse()?),
                };
                Self::Position { address, position }
            }
            "name" => {
                let address = required(words.next(), "address")?.to_string();
                let name = words.collect::<Vec<_>>().join(" ");
                if name.is_empty() {
                    return Err("missing name".to_string());
                }
                Self::Name { address, name }
            }
            "start" => Self::Start,
            "stop" => Self::Stop,
            "reconnect" => Self::Reconnect,
            "reset" => Self::Reset,
            "led" => Self::Led {
                address: required(words.next(), "address")?.to_string(),
            },
            "status" => Self::Status,
            "refresh" => Self::Refresh,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command: {}", other)),
        };
        Ok(command)
    }
}

/// Short message for expected failures; internal ones are logged and hidden.
fn describe(e: FleetError) -> String {
    if e.is_expected() {
        e.to_string()
    } else {
        error!("Command failed: {}", e);
        "operation failed, see the log".to_string()
    }
}

pub fn render_status(devices: &[DeviceStatus], logging: bool, elapsed: Duration) -> String {
    let mut out = String::new();
    if devices.is_empty() {
        out.push_str("No sensors configured\n");
    }
    for device in devices {
        let _ = writeln!(
            out,
            "{}. {} [{}] {:<8} {:<12} battery {:<8} {}{}",
            device.slot + 1,
            device.address,
            device.name,
            device.color,
            device.position.map(|p| p.label()).unwrap_or("unplaced"),
            device.battery,
            if device.connected { "connected" } else { "disconnected" },
            if device.ready { ", ready" } else { "" },
        );
    }
    let _ = write!(
        out,
        "Session: {} (recorded {})",
        if logging { "logging" } else { "idle" },
        format_elapsed(elapsed)
    );
    out
}

async fn status_text(state: &AppState, devices: Vec<DeviceStatus>) -> String {
    let (logging, elapsed) = {
        let mut registry = state.fleet.context().registry.lock().await;
        (registry.is_logging(), registry.session_elapsed())
    };
    render_status(&devices, logging, elapsed)
}

async fn resolve_target(state: &AppState, target: &str) -> Result<(String, Option<String>), String> {
    let last_scan = state.last_scan.lock().await;
    if let Some(index) = target.strip_prefix('#') {
        let index: usize = index.parse().map_err(|_| format!("invalid scan index: {}", target))?;
        let candidate = index
            .checked_sub(1)
            .and_then(|i| last_scan.get(i))
            .ok_or_else(|| format!("no scan result #{}", index))?;
        return Ok((candidate.address.clone(), candidate.name.clone()));
    }
    let address = target.to_uppercase();
    let name = last_scan
        .iter()
        .find(|c| c.address == address)
        .and_then(|c| c.name.clone());
    Ok((address, name))
}

/// Runs one command and returns the text to show.
pub async fn execute(state: &AppState, command: FleetCommand) -> Result<String, String> {
    let fleet = &state.fleet;
    match command {
        FleetCommand::Scan { secs } => {
            let found = state
                .scanner
                .lock()
                .await
                .scan_for(Duration::from_secs(secs))
                .await
                .map_err(|e| e.to_string())?;
            let candidates = fleet.filter_candidates(found).await;
            let mut out = format!("{} new sensors found", candidates.len());
            for (i, candidate) in candidates.iter().enumerate() {
                let _ = write!(
                    out,
                    "\n  #{} {} {} RSSI {}",
                    i + 1,
                    candidate.address,
                    candidate.name.as_deref().unwrap_or("(no name)"),
                    candidate.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into())
                );
            }
            *state.last_scan.lock().await = candidates;
            Ok(out)
        }
        FleetCommand::Add { target } => {
            let (address, name) = resolve_target(state, &target).await?;
            let slot = fleet
                .add_device(&address, name.as_deref())
                .await
                .map_err(describe)?;
            Ok(format!("Added {} as sensor {}", address, slot + 1))
        }
        FleetCommand::Remove { address } => {
            fleet.remove_device(&address).await.map_err(describe)?;
            Ok(format!("Removed {}", address))
        }
        FleetCommand::Position { address, position } => {
            let changed = fleet.set_position(&address, position).await.map_err(describe)?;
            Ok(if changed.len() > 1 {
                format!("Swapped positions of {}", changed.join(" and "))
            } else {
                format!("Updated {}", address)
            })
        }
        FleetCommand::Name { address, name } => {
            fleet.set_name(&address, &name).await.map_err(describe)?;
            Ok(format!("Renamed {} to {}", address, name))
        }
        FleetCommand::Start => {
            let report = fleet.sessions().start_session().await.map_err(describe)?.wait().await;
            Ok(format!("Session started ({})", report))
        }
        FleetCommand::Stop => {
            let report = fleet.sessions().stop_session().await.map_err(describe)?.wait().await;
            Ok(format!("Session stopped ({})", report))
        }
        FleetCommand::Reconnect => {
            let report = fleet.sessions().reconnect_all().await.map_err(describe)?.wait().await;
            Ok(report.to_string())
        }
        FleetCommand::Reset => {
            let report = fleet.sessions().reset_fleet().await.map_err(describe)?.wait().await;
            Ok(format!("Fleet reset ({})", report))
        }
        FleetCommand::Led { address } => {
            fleet.sessions().update_device_led(&address).await.map_err(describe)?;
            Ok(format!("LED of {} refreshed", address))
        }
        FleetCommand::Status => Ok(status_text(state, fleet.status().await).await),
        FleetCommand::Refresh => {
            let devices = fleet.battery().refresh_status().await;
            Ok(status_text(state, devices).await)
        }
        FleetCommand::Help => Ok(HELP.to_string()),
        FleetCommand::Quit => Ok("Bye".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::LedColor;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            "scan 5".parse::<FleetCommand>(),
            Ok(FleetCommand::Scan { secs: 5 })
        );
        assert_eq!(
            "scan".parse::<FleetCommand>(),
            Ok(FleetCommand::Scan { secs: DEFAULT_SCAN_DURATION_SECS })
        );
        assert_eq!(
            "position AA:BB right-ankle".parse::<FleetCommand>(),
            Ok(FleetCommand::Position {
                address: "AA:BB".into(),
                position: Some(Position::RightAnkle)
            })
        );
        assert_eq!(
            "position AA:BB none".parse::<FleetCommand>(),
            Ok(FleetCommand::Position { address: "AA:BB".into(), position: None })
        );
        assert_eq!(
            "name AA:BB left wrist unit".parse::<FleetCommand>(),
            Ok(FleetCommand::Name { address: "AA:BB".into(), name: "left wrist unit".into() })
        );
        assert_eq!("START".parse::<FleetCommand>(), Ok(FleetCommand::Start));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!("".parse::<FleetCommand>().is_err());
        assert!("fly".parse::<FleetCommand>().is_err());
        assert!("add".parse::<FleetCommand>().is_err());
        assert!("scan soon".parse::<FleetCommand>().is_err());
        assert!("position AA:BB elbow".parse::<FleetCommand>().is_err());
        assert!("name AA:BB".parse::<FleetCommand>().is_err());
    }

    #[test]
    fn status_lists_every_slot() {
        let devices = vec![DeviceStatus {
            slot: 0,
            address: "AA:BB".into(),
            name: "Device 1".into(),
            position: Some(Position::Waist),
            color: LedColor::Red,
            battery: "88%".into(),
            ready: true,
            connected: true,
        }];

        let text = render_status(&devices, true, Duration::from_secs(3_661));

        assert!(text.starts_with("1. AA:BB [Device 1] red"));
        assert!(text.contains("Waist"));
        assert!(text.contains("battery 88%"));
        assert!(text.ends_with("Session: logging (recorded 0D 1H 1M 1S)"));
    }
}
