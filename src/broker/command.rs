//! The in-session command parser.
//!
//! One command is executed per SSH connection. Arg counts are strict;
//! anything unrecognised becomes a diagnostic on stderr and exit status 1.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Spinup { box_name: String },
    Connect { box_name: String },
    Help,
    Version,
    Whoami,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Spinup { box_name } => write!(f, "spinup {}", box_name),
            Command::Connect { box_name } => write!(f, "connect {}", box_name),
            Command::Help => write!(f, "help"),
            Command::Version => write!(f, "version"),
            Command::Whoami => write!(f, "whoami"),
        }
    }
}

/// A malformed command line, with the diagnostic shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn box_name_ok(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Parses one command line. Whitespace-normalising and idempotent:
/// re-parsing a parsed command's display form yields the same command.
pub fn parse_args(input: &str) -> Result<Command, ParseError> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    let Some(&command) = tokens.first() else {
        return Err(ParseError {
            message: "no command given; try 'help'".to_string(),
        });
    };
    match command {
        "spinup" | "connect" => {
            if tokens.len() != 2 {
                return Err(ParseError {
                    message: format!("usage: {} <box_name>", command),
                });
            }
            let box_name = tokens[1].to_string();
            if !box_name_ok(&box_name) {
                return Err(ParseError {
                    message: format!(
                        "invalid box name {:?}: use lowercase letters, digits and dashes",
                        box_name
                    ),
                });
            }
            if command == "spinup" {
                Ok(Command::Spinup { box_name })
            } else {
                Ok(Command::Connect { box_name })
            }
        }
        "help" | "version" | "whoami" => {
            if tokens.len() != 1 {
                return Err(ParseError {
                    message: format!("{} takes no arguments", command),
                });
            }
            Ok(match command {
                "help" => Command::Help,
                "version" => Command::Version,
                _ => Command::Whoami,
            })
        }
        other => Err(ParseError {
            message: format!("unknown command {:?}; try 'help'", other),
        }),
    }
}

pub fn usage() -> &'static str {
    "shellbox commands:\n\
     \x20 spinup <box_name>   provision a fresh box and open a shell\n\
     \x20 connect <box_name>  open a shell on a box\n\
     \x20 help                show this help\n\
     \x20 version             print the server version\n\
     \x20 whoami              print your key fingerprint\n"
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
