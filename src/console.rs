//! Line-oriented lock console.
//!
//! Commands (verbs are case-insensitive):
//!
//! ```text
//! LOCK <name> [<timeoutSeconds>]   acquire on the console thread
//! UNLOCK <name>                    release one hold
//! DUMP                             print every lock holder
//! SERVER                           print member status and metrics
//! EXIT                             leave the shell
//! ```

use crate::error::{Error, Result};
use crate::locks::{Lock, Locks};
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Lock {
        name: String,
        timeout: Option<Duration>,
    },
    Unlock {
        name: String,
    },
    Dump,
    Server,
    Exit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| Error::InvalidCommand("empty command".to_string()))?;
        let args: Vec<&str> = words.collect();

        let command = match (verb.to_ascii_uppercase().as_str(), args.as_slice()) {
            ("LOCK", [name]) => Command::Lock {
                name: name.to_string(),
                timeout: None,
            },
            ("LOCK", [name, seconds]) => {
                let seconds: f64 = seconds.parse().map_err(|_| {
                    Error::InvalidCommand(format!("invalid timeout '{}'", seconds))
                })?;
                let timeout = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    Error::InvalidCommand(format!("invalid timeout '{}'", seconds))
                })?;
                Command::Lock {
                    name: name.to_string(),
                    timeout: Some(timeout),
                }
            }
            ("UNLOCK", [name]) => Command::Unlock {
                name: name.to_string(),
            },
            ("DUMP", []) => Command::Dump,
            ("SERVER", []) => Command::Server,
            ("EXIT", []) => Command::Exit,
            ("LOCK", _) => return Err(usage("LOCK <name> [<timeoutSeconds>]")),
            ("UNLOCK", _) => return Err(usage("UNLOCK <name>")),
            _ => return Err(Error::InvalidCommand(line.trim().to_string())),
        };
        Ok(command)
    }
}

fn usage(text: &str) -> Error {
    Error::InvalidCommand(format!("usage: {}", text))
}

/// Executes console commands against one member's locks.
pub struct Console {
    locks: Arc<Locks>,
}

impl Console {
    pub fn new(locks: Arc<Locks>) -> Self {
        Self { locks }
    }

    /// Run a command. Returns the lines to print, or `None` for `EXIT`.
    pub fn execute(&self, command: Command) -> Result<Option<Vec<String>>> {
        debug!(?command, "Executing console command");
        let lines = match command {
            Command::Lock { name, timeout } => {
                let lock = self.locks.exclusive_lock(&name);
                let acquired = match timeout {
                    Some(timeout) => lock.try_lock_for(timeout)?,
                    None => lock.lock().map(|_| true)?,
                };
                if acquired {
                    vec![format!("Locked {}", name)]
                } else {
                    vec![format!("Timed out acquiring {}", name)]
                }
            }
            Command::Unlock { name } => {
                self.locks.exclusive_lock(&name).unlock()?;
                vec![format!("Unlocked {}", name)]
            }
            Command::Dump => self.locks.service().dump(),
            Command::Server => self.status(),
            Command::Exit => return Ok(None),
        };
        Ok(Some(lines))
    }

    fn status(&self) -> Vec<String> {
        let config = self.locks.config();
        let service = self.locks.service();
        let mut lines = vec![
            format!("Member {} (client={})", config.member_id, config.client),
            format!("Exclusive locks: {}", service.exclusive_map().len()),
            format!("Read/write locks: {}", service.read_write_map().len()),
            format!("Metrics: {}", self.locks.metrics().snapshot()),
        ];
        lines.extend(self.locks.metrics().to_prometheus().lines().map(str::to_string));
        lines
    }

    /// Read commands from `input` until `EXIT` or end of input. Command
    /// errors are printed and do not stop the loop.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut output: W) -> Result<()> {
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>().and_then(|command| self.execute(command)) {
                Ok(Some(lines)) => {
                    for text in lines {
                        writeln!(output, "{}", text)?;
                    }
                }
                Ok(None) => break,
                Err(e) => writeln!(output, "Error: {}", e)?,
            }
            output.flush()?;
        }
        Ok(())
    }
}
