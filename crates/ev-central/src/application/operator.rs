//! Operator command surface: parsing and executing console commands.
//!
//! The stdin loop lives in `infrastructure::console`; everything here is
//! testable without a terminal.
//!
//! ```text
//! list               table of charging points
//! sessions           active sessions, then recently ended ones
//! stop [cp_id]       stop one CP, or every CP when no id is given
//! resume [cp_id]     resume one CP, or every CP
//! help               this text
//! quit | exit        shut the coordinator down
//! ```

use std::fmt::Write as _;
use std::str::FromStr;

use ev_core::protocol::OperatorAction;
use ev_core::{ChargingPoint, SupplySession};
use thiserror::Error;

use crate::application::coordinator::Coordinator;

pub const HELP: &str = "\
commands:
  list               show every charging point
  sessions           show active and recently ended sessions
  stop [cp_id]       stop one charging point (all when omitted)
  resume [cp_id]     resume one charging point (all when omitted)
  help               show this text
  quit | exit        shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    List,
    Sessions,
    Stop(Option<String>),
    Resume(Option<String>),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperatorParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}; type `help`")]
    Unknown(String),

    #[error("`{0}` takes at most one charging point id")]
    TooManyArguments(&'static str),
}

impl FromStr for OperatorCommand {
    type Err = OperatorParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(OperatorParseError::Empty)?.to_ascii_lowercase();
        let target = words.next().map(str::to_string);
        let extra = words.next().is_some();

        let command = match verb.as_str() {
            "list" | "ls" => OperatorCommand::List,
            "sessions" => OperatorCommand::Sessions,
            "stop" if extra => return Err(OperatorParseError::TooManyArguments("stop")),
            "stop" => return Ok(OperatorCommand::Stop(target)),
            "resume" if extra => return Err(OperatorParseError::TooManyArguments("resume")),
            "resume" => return Ok(OperatorCommand::Resume(target)),
            "help" | "?" => OperatorCommand::Help,
            "quit" | "exit" => OperatorCommand::Quit,
            _ => return Err(OperatorParseError::Unknown(verb)),
        };
        Ok(command)
    }
}

/// What the console should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleOutcome {
    /// Print this text and keep reading.
    Continue(String),
    Quit,
}

pub async fn execute(coordinator: &Coordinator, command: OperatorCommand) -> ConsoleOutcome {
    let text = match command {
        OperatorCommand::List => render_charging_points(&coordinator.charging_points().await),
        OperatorCommand::Sessions => {
            let mut text = String::from("active:\n");
            text.push_str(&render_sessions(&coordinator.active_sessions().await));
            text.push_str("\nrecent:\n");
            text.push_str(&render_sessions(&coordinator.recent_sessions().await));
            text
        }
        OperatorCommand::Stop(target) => remote(coordinator, OperatorAction::Stop, target).await,
        OperatorCommand::Resume(target) => remote(coordinator, OperatorAction::Resume, target).await,
        OperatorCommand::Help => HELP.to_string(),
        OperatorCommand::Quit => return ConsoleOutcome::Quit,
    };
    ConsoleOutcome::Continue(text)
}

async fn remote(coordinator: &Coordinator, action: OperatorAction, target: Option<String>) -> String {
    let verb = match action {
        OperatorAction::Stop => "stopped",
        OperatorAction::Resume => "resumed",
    };
    match coordinator.remote_command(action, target.as_deref()).await {
        Ok(ids) if ids.is_empty() => "no charging points registered".to_string(),
        Ok(ids) => format!("{verb}: {}", ids.join(", ")),
        Err(e) => format!("error: {e}"),
    }
}

pub fn render_charging_points(cps: &[ChargingPoint]) -> String {
    if cps.is_empty() {
        return "no charging points registered".to_string();
    }
    let mut out = format!(
        "{:<12} {:<24} {:<13} {:<6} {:>7} {:>6}  {}\n",
        "ID", "LOCATION", "STATUS", "HEALTH", "€/kWh", "kW", "SESSION"
    );
    for cp in cps {
        let session = cp.current_session_id.as_ref().map_or("-", |s| s.as_str());
        let _ = writeln!(
            out,
            "{:<12} {:<24} {:<13} {:<6} {:>7.2} {:>6.1}  {}",
            cp.id,
            cp.location,
            cp.status.as_str(),
            cp.health.to_string(),
            cp.price_per_kwh,
            cp.max_power,
            session
        );
    }
    out.trim_end().to_string()
}

pub fn render_sessions(sessions: &[SupplySession]) -> String {
    if sessions.is_empty() {
        return "  (none)".to_string();
    }
    let mut out = String::new();
    for s in sessions {
        let _ = writeln!(
            out,
            "  {} {:<10} {:<10} {:<11} {:>8.2} kWh {:>8.2}  {}",
            s.id,
            s.cp_id,
            s.driver_id,
            s.state.to_string(),
            s.energy_delivered,
            s.amount_due,
            s.reason.as_deref().unwrap_or("")
        );
    }
    out.trim_end().to_string()
}
