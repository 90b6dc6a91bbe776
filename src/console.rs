//! Headless operator console
//!
//! One command per line. Parsing is separate from execution so the command
//! grammar can be tested without a machine.

use jogkit::{
    list_ports, Axis, Direction, Error, MachineController, MachineEvent, Priority, Result, WcsSlot,
};
use std::str::FromStr;

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect {
        port: Option<String>,
        baud_rate: Option<u32>,
    },
    Disconnect,
    Jog {
        axis: Axis,
        direction: Direction,
        distance: Option<f64>,
        feed_rate: Option<f64>,
    },
    JogContinuous {
        axis: Axis,
        direction: Direction,
        feed_rate: Option<f64>,
    },
    Stop(Option<Axis>),
    Home(Option<Vec<Axis>>),
    EmergencyStop,
    Reset,
    Wcs(WcsSlot),
    Zero(Vec<Axis>),
    Send(String),
    Status,
    State,
    Ports,
    Help,
    Quit,
}

pub const HELP: &str = "\
connect [port] [baud]        open the machine connection
disconnect                   close it
jog <axis> <+|-> [dist] [f]  incremental jog
jogc <axis> <+|-> [feed]     continuous jog until stop
stop [axis]                  stop jogging (one axis or all)
home [axes]                  home, e.g. `home zxy`
estop                        emergency stop
reset                        clear alarms after an emergency stop
wcs <1-6>                    select G54..G59
zero <axes>                  zero work coordinates, e.g. `zero xy`
send <text>                  send a raw line
status                       query a status report
state                        print the machine state
ports                        list serial ports
quit                         exit";

fn parse_axes(word: &str) -> Result<Vec<Axis>> {
    word.chars().map(Axis::try_from).collect()
}

fn parse_number<T: FromStr>(word: Option<&str>, what: &str) -> Result<Option<T>> {
    word.map(|w| {
        w.parse::<T>()
            .map_err(|_| Error::malformed(format!("invalid {} '{}'", what, w)))
    })
    .transpose()
}

fn required<'a>(word: Option<&'a str>, what: &str) -> Result<&'a str> {
    word.ok_or_else(|| Error::malformed(format!("missing {}", what)))
}

impl FromStr for ConsoleCommand {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let mut words = rest.split_whitespace();

        let command = match verb.to_ascii_lowercase().as_str() {
            "connect" => ConsoleCommand::Connect {
                port: words.next().map(str::to_string),
                baud_rate: parse_number(words.next(), "baud rate")?,
            },
            "disconnect" => ConsoleCommand::Disconnect,
            "jog" => ConsoleCommand::Jog {
                axis: required(words.next(), "axis")?.parse()?,
                direction: required(words.next(), "direction")?.parse()?,
                distance: parse_number(words.next(), "distance")?,
                feed_rate: parse_number(words.next(), "feed rate")?,
            },
            "jogc" => ConsoleCommand::JogContinuous {
                axis: required(words.next(), "axis")?.parse()?,
                direction: required(words.next(), "direction")?.parse()?,
                feed_rate: parse_number(words.next(), "feed rate")?,
            },
            "stop" => ConsoleCommand::Stop(words.next().map(str::parse::<Axis>).transpose()?),
            "home" => ConsoleCommand::Home(words.next().map(parse_axes).transpose()?),
            "estop" | "!" => ConsoleCommand::EmergencyStop,
            "reset" => ConsoleCommand::Reset,
            "wcs" => ConsoleCommand::Wcs(required(words.next(), "coordinate system")?.parse()?),
            "zero" => ConsoleCommand::Zero(parse_axes(required(words.next(), "axes")?)?),
            "send" if !rest.is_empty() => ConsoleCommand::Send(rest.to_string()),
            "send" => return Err(Error::malformed("nothing to send")),
            "status" | "?" => ConsoleCommand::Status,
            "state" => ConsoleCommand::State,
            "ports" => ConsoleCommand::Ports,
            "help" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            "" => return Err(Error::malformed("empty command")),
            other => return Err(Error::malformed(format!("unknown command '{}'", other))),
        };
        Ok(command)
    }
}

impl ConsoleCommand {
    /// Run the command; returns text to print
    pub async fn execute(self, controller: &MachineController) -> Result<Option<String>> {
        match self {
            ConsoleCommand::Connect { port, baud_rate } => {
                let settings = &controller.config().connection;
                let port = port.unwrap_or_else(|| settings.port.clone());
                controller
                    .connect(&port, baud_rate.unwrap_or(settings.baud_rate))
                    .await?;
                Ok(Some(format!("connected to {}", port)))
            }
            ConsoleCommand::Disconnect => {
                controller.disconnect().await?;
                Ok(None)
            }
            ConsoleCommand::Jog {
                axis,
                direction,
                distance,
                feed_rate,
            } => {
                let position = controller
                    .jog_incremental(axis, direction, distance, feed_rate)
                    .await?;
                Ok(Some(position.to_string()))
            }
            ConsoleCommand::JogContinuous {
                axis,
                direction,
                feed_rate,
            } => {
                controller.jog_continuous(axis, direction, feed_rate)?;
                Ok(None)
            }
            ConsoleCommand::Stop(Some(axis)) => {
                controller.stop_axis(axis)?;
                Ok(None)
            }
            ConsoleCommand::Stop(None) => {
                controller.stop_jog(None)?;
                Ok(None)
            }
            ConsoleCommand::Home(sequence) => {
                let position = controller.home_axes(sequence).await?;
                Ok(Some(position.to_string()))
            }
            ConsoleCommand::EmergencyStop => {
                controller.emergency_stop()?;
                Ok(Some("EMERGENCY STOP - `reset` to unlock".to_string()))
            }
            ConsoleCommand::Reset => {
                controller.reset().await?;
                Ok(None)
            }
            ConsoleCommand::Wcs(slot) => {
                controller.set_coordinate_system(slot).await?;
                Ok(None)
            }
            ConsoleCommand::Zero(axes) => {
                controller.zero_work_axes(&axes).await?;
                Ok(None)
            }
            ConsoleCommand::Send(text) => {
                let response = controller.send_command(&text, Priority::Normal).await?;
                let mut lines = response.messages;
                lines.push("ok".to_string());
                Ok(Some(lines.join("\n")))
            }
            ConsoleCommand::Status => {
                let report = controller.query_status().await?;
                Ok(Some(format!("{:?}", report)))
            }
            ConsoleCommand::State => {
                let state = controller.get_state();
                Ok(Some(format!(
                    "{} {} | {} | machine {} | work {} ({})",
                    state.connection.status,
                    state.connection.port.as_deref().unwrap_or("-"),
                    state
                        .status
                        .map_or_else(|| "-".to_string(), |s| s.to_string()),
                    state.position,
                    state.work_position,
                    state.coordinate_systems.active_slot(),
                )))
            }
            ConsoleCommand::Ports => {
                let ports = list_ports()?;
                if ports.is_empty() {
                    return Ok(Some("no serial ports found".to_string()));
                }
                Ok(Some(
                    ports
                        .iter()
                        .map(|p| format!("{}  {}", p.port_name, p.description))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ))
            }
            ConsoleCommand::Help => Ok(Some(HELP.to_string())),
            ConsoleCommand::Quit => Ok(None),
        }
    }
}

/// One-line rendering of an event for the console
pub fn describe(event: &MachineEvent) -> String {
    let kind = event.kind().name();
    match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => match map.get("payload") {
            Some(payload) if !payload.is_null() => format!("[{}] {}", kind, payload),
            _ => format!("[{}]", kind),
        },
        _ => format!("[{}]", kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jog() {
        let command: ConsoleCommand = "jog x + 10 1000".parse().unwrap();
        assert_eq!(
            command,
            ConsoleCommand::Jog {
                axis: Axis::X,
                direction: Direction::Positive,
                distance: Some(10.0),
                feed_rate: Some(1000.0),
            }
        );

        let command: ConsoleCommand = "JOG z -".parse().unwrap();
        assert_eq!(
            command,
            ConsoleCommand::Jog {
                axis: Axis::Z,
                direction: Direction::Negative,
                distance: None,
                feed_rate: None,
            }
        );
    }

    #[test]
    fn test_parse_home_and_zero() {
        assert_eq!(
            "home zxy".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Home(Some(vec![Axis::Z, Axis::X, Axis::Y]))
        );
        assert_eq!(
            "home".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Home(None)
        );
        assert_eq!(
            "zero xy".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Zero(vec![Axis::X, Axis::Y])
        );
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(
            "wcs 2".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Wcs(WcsSlot::G55)
        );
        assert_eq!(
            "send G0 X1 Y2".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Send("G0 X1 Y2".to_string())
        );
        assert_eq!(
            "connect mock".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Connect {
                port: Some("mock".to_string()),
                baud_rate: None
            }
        );
        assert_eq!(
            "stop y".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Stop(Some(Axis::Y))
        );
        assert_eq!(
            "ports".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Ports
        );
    }

    #[test]
    fn test_describe_event() {
        let event = MachineEvent::from(jogkit::event_bus::JogStopped {
            reason: "limit".to_string(),
        });
        assert_eq!(describe(&event), r#"[jog_stopped] {"reason":"limit"}"#);
        let event = MachineEvent::from(jogkit::event_bus::AlarmsCleared);
        assert_eq!(describe(&event), "[alarms_cleared]");
    }

    #[test]
    fn test_parse_errors() {
        for line in ["", "jog", "jog q +", "jog x up", "jog x + far", "send", "wcs 9", "fly"] {
            let err = line.parse::<ConsoleCommand>().unwrap_err();
            assert_eq!(err.kind(), jogkit::ErrorKind::Command, "{line}");
        }
    }
}
