//! Inbound management commands.
//!
//! Commands arrive as text payloads on the management topic: a keyword
//! followed by space-separated arguments. They are resolved once at the
//! boundary into a closed set of typed variants; unknown keywords and
//! malformed arguments never reach the handlers.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open a new log file and enable logging, persisting the boot flag.
    StartLogging,
    /// Close the current log file and disable logging.
    StopLogging,
    /// Start a log retrieval session.
    GetAllLogs,
    /// Acknowledge the current file; the session moves to the next one.
    GetNextLog,
    /// Ask the session to resend the current file.
    GetPreviousLog,
    /// Delete all log files except the currently open one.
    DeleteLogs,
    /// Apply filter constants without persisting them.
    TestFilter { kp: f64, kd: f64 },
    /// Apply filter constants and persist them to configuration.
    SaveFilter { kp: f64, kd: f64 },
    /// Change the sampling period (seconds) and persist it.
    SetSamplingPeriod { secs: u32 },
    /// Queue an event description for the next sample record.
    RegisterEvent { description: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command payload")]
    Empty,

    #[error("unknown command keyword: {0}")]
    UnknownKeyword(String),

    #[error("{command} expects {expected}")]
    BadArguments {
        command: &'static str,
        expected: &'static str,
    },
}

impl Command {
    pub fn parse(payload: &str) -> Result<Command, CommandParseError> {
        let mut words = payload.split_whitespace();
        let keyword = words.next().ok_or(CommandParseError::Empty)?;
        let args: Vec<&str> = words.collect();

        match keyword {
            "START_LOGGING" => Ok(Command::StartLogging),
            "STOP_LOGGING" => Ok(Command::StopLogging),
            "GET_ALL_LOGS" => Ok(Command::GetAllLogs),
            "GET_NEXT_LOG" => Ok(Command::GetNextLog),
            "GET_PREVIOUS_LOG" => Ok(Command::GetPreviousLog),
            "DELETE_LOGS" => Ok(Command::DeleteLogs),
            "TEST_FILTER" => {
                let (kp, kd) = parse_filter_args(&args, "TEST_FILTER")?;
                Ok(Command::TestFilter { kp, kd })
            }
            "SAVE_FILTER" => {
                let (kp, kd) = parse_filter_args(&args, "SAVE_FILTER")?;
                Ok(Command::SaveFilter { kp, kd })
            }
            "SET_SAMPLING_PERIOD" => {
                let secs = args
                    .first()
                    .and_then(|s| s.parse::<u32>().ok())
                    .filter(|&secs| secs > 0)
                    .ok_or(CommandParseError::BadArguments {
                        command: "SET_SAMPLING_PERIOD",
                        expected: "one positive integer argument (seconds)",
                    })?;
                Ok(Command::SetSamplingPeriod { secs })
            }
            "REGISTER_EVENT" => {
                if args.is_empty() {
                    return Err(CommandParseError::BadArguments {
                        command: "REGISTER_EVENT",
                        expected: "an event description",
                    });
                }
                Ok(Command::RegisterEvent {
                    description: args.join(" "),
                })
            }
            other => Err(CommandParseError::UnknownKeyword(other.to_string())),
        }
    }

    /// The acknowledgment published on the log topic when the command is
    /// accepted.
    pub fn acknowledgment(&self) -> String {
        match self {
            Command::StartLogging => "received start logging".to_string(),
            Command::StopLogging => "received stop logging".to_string(),
            Command::GetAllLogs => "received get all logs".to_string(),
            Command::GetNextLog => "received get next log".to_string(),
            Command::GetPreviousLog => "received get previous log".to_string(),
            Command::DeleteLogs => "received delete log files".to_string(),
            Command::TestFilter { kp, kd } => {
                format!("received test filter kp={kp}, kd={kd}")
            }
            Command::SaveFilter { kp, kd } => {
                format!("received save filter kp={kp}, kd={kd}")
            }
            Command::SetSamplingPeriod { secs } => {
                format!("received set sampling period {secs}")
            }
            Command::RegisterEvent { .. } => "received event register".to_string(),
        }
    }
}

fn parse_filter_args(
    args: &[&str],
    command: &'static str,
) -> Result<(f64, f64), CommandParseError> {
    let bad = || CommandParseError::BadArguments {
        command,
        expected: "two floating-point arguments (kp kd)",
    };
    if args.len() != 2 {
        return Err(bad());
    }
    let kp = args[0].parse::<f64>().map_err(|_| bad())?;
    let kd = args[1].parse::<f64>().map_err(|_| bad())?;
    Ok((kp, kd))
}
