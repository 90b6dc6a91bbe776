mod console;

use anyhow::Context;
use clap::Parser;
use console::{describe, ConsoleCommand, HELP};
use jogkit::{init_logging, Config, MachineController, MockDevice};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const MOCK_PORT: &str = "mock";

#[derive(Parser, Debug)]
#[command(version, about = "Operator console for GRBL jog control")]
struct Args {
    /// Configuration file; defaults to the per-user config path
    config: Option<PathBuf>,
    /// Serial port to use instead of the configured one (`mock` simulates a machine)
    port: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging()?;

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(port) = args.port {
        config.connection.port = port;
    }
    tracing::info!("JogKit {} using {}", jogkit::VERSION, config_path.display());

    let controller = if config.connection.port == MOCK_PORT {
        MachineController::new(config, Arc::new(MockDevice::new().factory()))?
    } else {
        MachineController::with_serial(config)?
    };

    let mut events = controller.events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", describe(&event)),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Console fell behind, {} events dropped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("error: {}", e);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        // Commands run concurrently with input; `estop` never waits behind a move.
        let controller = controller.clone();
        tokio::spawn(async move {
            match command.execute(&controller).await {
                Ok(Some(output)) => println!("{}", output),
                Ok(None) => {}
                Err(e) => println!("error ({:?}): {}", e.kind(), e),
            }
        });
    }

    controller.disconnect().await?;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_are_optional_and_positional() {
        let args = Args::try_parse_from(["jogkit", "machine.toml", "mock"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("machine.toml")));
        assert_eq!(args.port.as_deref(), Some("mock"));

        let args = Args::try_parse_from(["jogkit"]).unwrap();
        assert!(args.config.is_none() && args.port.is_none());

        assert!(Args::try_parse_from(["jogkit", "a", "b", "c"]).is_err());
    }
}
