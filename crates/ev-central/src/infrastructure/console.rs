//! Operator console on stdin.
//!
//! Reads one command per line, prints the result, and clears the shared
//! `running` flag on `quit`/`exit`.  End of input only stops the console;
//! the service keeps running.  Parsing and execution live in
//! `application::operator`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::application::coordinator::Coordinator;
use crate::application::operator::{execute, ConsoleOutcome, OperatorCommand, HELP};

const INPUT_POLL: Duration = Duration::from_millis(200);

pub async fn run_console(coordinator: Arc<Coordinator>, running: Arc<AtomicBool>) {
    println!("{HELP}");
    read_commands(BufReader::new(tokio::io::stdin()), &coordinator, &running, |text| {
        println!("{text}")
    })
    .await;
}

/// Executes commands from `input` until `quit`, end of input, or shutdown.
/// Every reply is handed to `print`.
async fn read_commands<R, P>(input: R, coordinator: &Coordinator, running: &AtomicBool, mut print: P)
where
    R: AsyncBufRead + Unpin,
    P: FnMut(&str),
{
    let mut lines = input.lines();
    while running.load(Ordering::Relaxed) {
        let line = match timeout(INPUT_POLL, lines.next_line()).await {
            Err(_) => continue,
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                info!("console input closed; service keeps running");
                break;
            }
            Ok(Err(e)) => {
                warn!("console read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<OperatorCommand>() {
            Ok(command) => command,
            Err(e) => {
                print(&e.to_string());
                continue;
            }
        };
        match execute(coordinator, command).await {
            ConsoleOutcome::Continue(text) => print(&text),
            ConsoleOutcome::Quit => {
                info!("shutdown requested from console");
                running.store(false, Ordering::Relaxed);
                break;
            }
        }
    }
}
