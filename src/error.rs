use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

/// Plumbing failures of the sandbox itself.
///
/// These never describe what the submission did; the supervisor turns them into
/// an [`crate::ExecutionOutcome::RuntimeError`] before they reach a library caller.
pub enum SnakeBoxError {
  Fork(String),
  Host(String),
  Config(String),
  Channel(String),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
}

/// Exit of the command line, printed the same way reports are
pub enum SnakeBoxExit {
  Ok,
  Err(SnakeBoxError),
}

impl SnakeBoxError {
  pub fn fork<MS: Into<String>>(msg: MS) -> SnakeBoxError {
    SnakeBoxError::Fork(msg.into())
  }

  pub fn host<MS: Into<String>>(msg: MS) -> SnakeBoxError {
    SnakeBoxError::Host(msg.into())
  }

  pub fn config<MS: Into<String>>(msg: MS) -> SnakeBoxError {
    SnakeBoxError::Config(msg.into())
  }

  pub fn channel<MS: Into<String>>(msg: MS) -> SnakeBoxError {
    SnakeBoxError::Channel(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> SnakeBoxError {
    SnakeBoxError::Cli(msg.into())
  }
}

impl Debug for SnakeBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for SnakeBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      SnakeBoxError::Fork(msg) => f.write_fmt(format_args!("SnakeBox Fork Error: {}", msg)),
      SnakeBoxError::Host(msg) => f.write_fmt(format_args!("SnakeBox Host Error: {}", msg)),
      SnakeBoxError::Config(msg) => f.write_fmt(format_args!("SnakeBox Config Error: {}", msg)),
      SnakeBoxError::Channel(msg) => f.write_fmt(format_args!("SnakeBox Channel Error: {}", msg)),
      SnakeBoxError::Nix(errno) => f.write_fmt(format_args!("SnakeBox Nix Error: {}", errno)),
      SnakeBoxError::Fs(msg) => f.write_fmt(format_args!("SnakeBox File System Error: {}", msg)),
      SnakeBoxError::Cli(msg) => f.write_fmt(format_args!("SnakeBox CLI Error: {}", msg)),
      SnakeBoxError::Logger(err) => f.write_fmt(format_args!("SnakeBox Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for SnakeBoxError {
  fn from(errno: Errno) -> Self {
    SnakeBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for SnakeBoxError {
  fn from(err: std::io::Error) -> Self {
    SnakeBoxError::Fs(err.to_string())
  }
}

impl From<serde_json::Error> for SnakeBoxError {
  fn from(err: serde_json::Error) -> Self {
    SnakeBoxError::Channel(err.to_string())
  }
}

impl From<regex::Error> for SnakeBoxError {
  fn from(err: regex::Error) -> Self {
    SnakeBoxError::Config(err.to_string())
  }
}

impl From<FlexiLoggerError> for SnakeBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    SnakeBoxError::Logger(err)
  }
}

impl Error for SnakeBoxError {}

impl<E: Into<SnakeBoxError>> From<Result<(), E>> for SnakeBoxExit {
  fn from(result: Result<(), E>) -> Self {
    match result {
      Ok(_) => SnakeBoxExit::Ok,
      Err(err) => SnakeBoxExit::Err(err.into()),
    }
  }
}

impl Termination for SnakeBoxExit {
  fn report(self) -> ExitCode {
    match self {
      SnakeBoxExit::Ok => ExitCode::SUCCESS.report(),
      SnakeBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!(
                "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
                prefix,
                message.replace('"', "'")
              )
            }
          }
          None => text,
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_prefix_messages_with_kind() {
    let err = SnakeBoxError::fork("no more processes");
    assert_eq!(err.to_string(), "SnakeBox Fork Error: no more processes");

    let err = SnakeBoxError::from(Errno::EAGAIN);
    assert!(err.to_string().starts_with("SnakeBox Nix Error: "));
  }

  #[test]
  fn it_should_convert_results_into_exits() {
    let exit: SnakeBoxExit = Ok::<(), SnakeBoxError>(()).into();
    assert!(matches!(exit, SnakeBoxExit::Ok));

    let exit: SnakeBoxExit = Err::<(), Errno>(Errno::ENOENT).into();
    assert!(matches!(exit, SnakeBoxExit::Err(SnakeBoxError::Nix(Errno::ENOENT))));
  }
}
