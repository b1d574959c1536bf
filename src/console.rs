//! Local operator console: one command per line on stdin.
//!
//! ```text
//! status | plot | clear
//! connect [slot [port]] | disconnect [slot] | coef <slot> <value>
//! test | cycle | stop-test | reset
//! stab | stop-stab
//! help | quit
//! ```

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::app::HvApp;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentSlot;

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Print the current snapshot
    Status,
    /// Print the number of chart samples
    Plot,
    /// Clear the chart
    Clear,
    /// Connect one slot (optionally on a new port) or every bound slot
    Connect(Option<(InstrumentSlot, Option<String>)>),
    /// Disconnect one slot or all
    Disconnect(Option<InstrumentSlot>),
    /// Change a coefficient
    Coefficient(InstrumentSlot, f64),
    /// Start a single-pass ramp
    Test,
    /// Start a cyclic ramp
    Cycle,
    /// Stop the ramp
    StopTest,
    /// Drive HV to the safe voltage
    Reset,
    /// Start stabilization
    Stabilize,
    /// Stop stabilization
    StopStabilize,
    /// Show the command list
    Help,
    /// Leave the console
    Quit,
}

impl ConsoleCommand {
    /// Parses one line; blank lines yield `None`.
    pub fn parse(line: &str) -> AppResult<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let slot = |word: Option<&str>| -> AppResult<Option<InstrumentSlot>> {
            word.map(|w| w.parse::<InstrumentSlot>()).transpose()
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "status" => Self::Status,
            "plot" => Self::Plot,
            "clear" => Self::Clear,
            "connect" => {
                let target = slot(words.next())?;
                Self::Connect(target.map(|s| (s, words.next().map(str::to_string))))
            }
            "disconnect" => Self::Disconnect(slot(words.next())?),
            "coef" => {
                let target = slot(words.next())?.ok_or_else(|| usage("coef <slot> <value>"))?;
                let value = words
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(|| usage("coef <slot> <value>"))?;
                Self::Coefficient(target, value)
            }
            "test" => Self::Test,
            "cycle" => Self::Cycle,
            "stop-test" => Self::StopTest,
            "reset" => Self::Reset,
            "stab" => Self::Stabilize,
            "stop-stab" => Self::StopStabilize,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => {
                return Err(DaqError::ConfigInvalid(format!(
                    "unknown command '{}', try 'help'",
                    other
                )))
            }
        };
        Ok(Some(command))
    }
}

fn usage(text: &str) -> DaqError {
    DaqError::ConfigInvalid(format!("usage: {}", text))
}

/// Executes `command` and returns the text to show the operator.
pub async fn execute(app: &HvApp, command: ConsoleCommand) -> AppResult<String> {
    let text = match command {
        ConsoleCommand::Status => {
            serde_json::to_string_pretty(&app.snapshot()).map_err(DaqError::from)?
        }
        ConsoleCommand::Plot => format!("{} samples", app.plot().len()),
        ConsoleCommand::Clear => {
            app.clear_plot();
            "chart cleared".to_string()
        }
        ConsoleCommand::Connect(Some((slot, port))) => {
            app.connect(slot, port).await?;
            format!("{} connected", slot)
        }
        ConsoleCommand::Connect(None) => app
            .connect_all()
            .await
            .into_iter()
            .map(|o| match o.error {
                None => format!("{}: connected", o.slot),
                Some(err) => format!("{}: {}", o.slot, err),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        ConsoleCommand::Disconnect(Some(slot)) => {
            app.disconnect(slot).await?;
            format!("{} disconnected", slot)
        }
        ConsoleCommand::Disconnect(None) => {
            app.disconnect_all().await?;
            "all disconnected".to_string()
        }
        ConsoleCommand::Coefficient(slot, value) => {
            app.set_coefficient(slot, value).await?;
            format!("{} coefficient {}", slot, value)
        }
        ConsoleCommand::Test => {
            app.start_test().await?;
            "ramp test started".to_string()
        }
        ConsoleCommand::Cycle => {
            app.start_cycle_test().await?;
            "cycle test started".to_string()
        }
        ConsoleCommand::StopTest => format!("{:?}", app.stop_test().await?.phase),
        ConsoleCommand::Reset => {
            app.reset_voltage().await?;
            "HV reset to safe voltage".to_string()
        }
        ConsoleCommand::Stabilize => {
            app.start_stabilization().await?;
            "stabilization started".to_string()
        }
        ConsoleCommand::StopStabilize => format!("{:?}", app.stop_stabilization().await?.phase),
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => String::new(),
    };
    Ok(text)
}

const HELP: &str = "status | plot | clear
connect [slot [port]] | disconnect [slot] | coef <slot> <value>
test | cycle | stop-test | reset
stab | stop-stab
help | quit";

/// Reads commands from `input` until `quit` or end of input.
pub async fn run<R>(app: Arc<HvApp>, input: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Console input failed");
                break;
            }
        };
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{}", err);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        match execute(&app, command).await {
            Ok(text) => println!("{}", text),
            Err(err) => println!("error: {}", err),
        }
    }
}
