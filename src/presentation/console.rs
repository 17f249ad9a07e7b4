//! Operator console
//!
//! Line-oriented stand-in for the slider panel. Reads commands from stdin,
//! turns them into [`LinkCommand`]s and prints link events as they arrive.

use crate::domain::error::LinkError;
use crate::domain::models::{
    ActuatorAngles, AppEvent, ConnectionState, LinkCommand, MessageSeverity, ACTUATOR_COUNT,
};
use crate::domain::motion::MotionGate;
use std::io::BufRead;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const HELP: &str = "\
Commands:
  set a b c d     move the actuators and upload (slider released)
  move a b c d    drag the sliders; uploads only after a large enough move
  demo on|off     start or stop demo mode
  refresh         read the current positions from the rig
  reconnect       retry the connection
  quit            close the link and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Set(ActuatorAngles),
    Move(ActuatorAngles),
    Demo(bool),
    Refresh,
    Reconnect,
    Quit,
    Help,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command '{0}' (try 'help')")]
    UnknownCommand(String),

    #[error("Expected {expected} angles, got {actual}")]
    AngleCount { expected: usize, actual: usize },

    #[error("'{0}' is not a number")]
    NotANumber(String),

    #[error(transparent)]
    Angle(#[from] LinkError),

    #[error("Usage: demo on|off")]
    DemoUsage,
}

pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(keyword) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let input = match keyword.to_lowercase().as_str() {
        "set" => ConsoleInput::Set(parse_angles(&args)?),
        "move" => ConsoleInput::Move(parse_angles(&args)?),
        "demo" => match args.as_slice() {
            ["on"] => ConsoleInput::Demo(true),
            ["off"] => ConsoleInput::Demo(false),
            _ => return Err(ConsoleError::DemoUsage),
        },
        "refresh" => ConsoleInput::Refresh,
        "reconnect" => ConsoleInput::Reconnect,
        "quit" | "exit" => ConsoleInput::Quit,
        "help" | "?" => ConsoleInput::Help,
        other => return Err(ConsoleError::UnknownCommand(other.to_string())),
    };
    Ok(Some(input))
}

fn parse_angles(args: &[&str]) -> Result<ActuatorAngles, ConsoleError> {
    if args.len() != ACTUATOR_COUNT {
        return Err(ConsoleError::AngleCount {
            expected: ACTUATOR_COUNT,
            actual: args.len(),
        });
    }

    let mut values = [0i64; ACTUATOR_COUNT];
    for (slot, arg) in values.iter_mut().zip(args) {
        *slot = arg
            .parse()
            .map_err(|_| ConsoleError::NotANumber(arg.to_string()))?;
    }
    Ok(ActuatorAngles::from_values(values)?)
}

/// Operator-side view of the link.
pub struct OperatorConsole {
    gate: MotionGate,
    state: ConnectionState,
    demo_running: bool,
}

impl OperatorConsole {
    pub fn new(motion_threshold: u8) -> Self {
        Self {
            gate: MotionGate::new(motion_threshold),
            state: ConnectionState::Disconnected,
            demo_running: false,
        }
    }

    /// The command to send for `input`, if any, plus a line for the operator.
    pub fn handle_input(&mut self, input: ConsoleInput) -> (Option<LinkCommand>, Option<String>) {
        match input {
            ConsoleInput::Set(_) | ConsoleInput::Move(_) if self.demo_running => (
                None,
                Some("Demo mode active. Stop it to move the actuators.".to_string()),
            ),
            ConsoleInput::Set(_) | ConsoleInput::Move(_)
                if self.state != ConnectionState::Connected =>
            {
                (None, Some("Not connected. Waiting for the link.".to_string()))
            }
            ConsoleInput::Set(target) => {
                (Some(LinkCommand::SetAngles(self.gate.release(target))), None)
            }
            ConsoleInput::Move(target) => match self.gate.drag(target) {
                Some(angles) => (Some(LinkCommand::SetAngles(angles)), None),
                None => (None, Some(format!("Holding {} (below threshold)", target))),
            },
            ConsoleInput::Demo(true) if self.state != ConnectionState::Connected => {
                (None, Some("Not connected. Waiting for the link.".to_string()))
            }
            ConsoleInput::Demo(true) => {
                self.demo_running = true;
                (Some(LinkCommand::StartDemo), None)
            }
            ConsoleInput::Demo(false) => {
                self.demo_running = false;
                (Some(LinkCommand::StopDemo), None)
            }
            ConsoleInput::Refresh => (Some(LinkCommand::Refresh), None),
            ConsoleInput::Reconnect => (Some(LinkCommand::Reconnect), None),
            ConsoleInput::Quit => (Some(LinkCommand::CancelConnection), None),
            ConsoleInput::Help => (None, Some(HELP.to_string())),
        }
    }

    /// Update local state from `event` and describe it.
    pub fn render_event(&mut self, event: &AppEvent) -> Option<String> {
        match event {
            AppEvent::ConnectionState(state) => {
                self.state = *state;
                if *state != ConnectionState::Connected {
                    self.demo_running = false;
                }
                let text = match state {
                    ConnectionState::Disconnected => "Disconnected",
                    ConnectionState::Connecting => "Waiting for connection...",
                    ConnectionState::Connected => "Link up",
                    ConnectionState::Failed => "Bluetooth unavailable",
                };
                Some(format!("[state] {}", text))
            }
            AppEvent::ConnectStarted { address } => Some(format!("Connecting to {}", address)),
            AppEvent::ConnectFinished {
                success: true,
                positions: Some(positions),
            } => {
                self.gate.rebase(*positions);
                Some(format!("Connected. Positions {}", positions))
            }
            AppEvent::ConnectFinished { .. } => Some("Connection attempt failed".to_string()),
            AppEvent::UploadFinished { success: true } => None,
            AppEvent::UploadFinished { success: false } => Some("Upload failed".to_string()),
            AppEvent::DownloadFinished {
                positions: Some(positions),
            } => {
                self.gate.rebase(*positions);
                Some(format!("Positions {}", positions))
            }
            AppEvent::DownloadFinished { positions: None } => {
                Some("Could not read positions".to_string())
            }
            // Ticks never restart the lockout; a late one may follow DemoStopped.
            AppEvent::DemoTick(angles) => {
                self.gate.rebase(*angles);
                Some(format!("[demo] {}", angles))
            }
            AppEvent::DemoStopped => {
                self.demo_running = false;
                Some("Demo mode stopped".to_string())
            }
            AppEvent::LogMessage(status) => {
                let tag = match status.severity {
                    MessageSeverity::Info => "info",
                    MessageSeverity::Success => "ok",
                    MessageSeverity::Warning => "warn",
                    MessageSeverity::Error => "error",
                };
                Some(format!("[{}] {}", tag, status.message))
            }
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub fn is_demo_running(&self) -> bool {
        self.demo_running
    }
}

/// Forward stdin lines from a detached thread; blocking reads never hold up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("stdin closed");
        })
        .map_err(|e| warn!("Failed to start console input: {}", e))
        .ok();
    rx
}

/// Run the console until the event stream ends.
///
/// End of input counts as `quit`.
pub async fn run(
    motion_threshold: u8,
    commands: mpsc::UnboundedSender<LinkCommand>,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
) {
    let mut console = OperatorConsole::new(motion_threshold);
    let mut lines = spawn_stdin_reader();
    let mut input_open = true;

    println!("{}", HELP);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(text) = console.render_event(&event) {
                        println!("{}", text);
                    }
                }
                None => break,
            },
            line = lines.recv(), if input_open => {
                let input = match line {
                    Some(line) => match parse_line(&line) {
                        Ok(Some(input)) => input,
                        Ok(None) => continue,
                        Err(e) => {
                            println!("{}", e);
                            continue;
                        }
                    },
                    None => {
                        input_open = false;
                        ConsoleInput::Quit
                    }
                };

                let (command, note) = console.handle_input(input);
                if let Some(note) = note {
                    println!("{}", note);
                }
                if let Some(command) = command {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
            }
        }
    }
}
