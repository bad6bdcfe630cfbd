use std::time::Duration;

use lazy_static::lazy_static;
use log::{error, warn};
use serde::{Deserialize, Serialize};

pub use config::{ResourceLimits, SandboxConfig, SandboxConfigBuilder};
pub use error::{SnakeBoxError, SnakeBoxExit};
pub use namespace::{MemorySink, NamespaceOutcome, OutputSink, PreparedNamespace, RestrictedNamespace};
pub use outcome::{ExecutionOutcome, ExecutionReport};
pub use policy::{PolicyDecision, PolicyFilter};
pub use submission::CodeSubmission;
pub use supervisor::Supervisor;
pub use verdict::{compare, VerdictResult};

pub mod config;
mod error;
mod host;
mod namespace;
mod outcome;
mod policy;
mod submission;
mod supervisor;
pub mod utils;
mod verdict;

lazy_static! {
  static ref DEFAULT_SUPERVISOR: Supervisor = Supervisor::default();
}

/// One request from the agent layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxRequest {
  pub code: String,
  #[serde(default)]
  pub timeout_seconds: Option<f64>,
  #[serde(default)]
  pub memory_limit_mb: Option<u64>,
  #[serde(default)]
  pub expected_output: Option<String>,
}

/// A report when no reference output was given, a verdict otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SandboxResponse {
  Outcome(ExecutionReport),
  Verdict(VerdictResult),
}

impl SandboxRequest {
  pub fn new<CS: Into<String>>(code: CS) -> Self {
    SandboxRequest {
      code: code.into(),
      ..SandboxRequest::default()
    }
  }

  pub fn into_submission(self) -> CodeSubmission {
    let timeout = match self.timeout_seconds {
      Some(seconds) => match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) if !timeout.is_zero() && timeout <= config::max_timeout() => Some(timeout),
        _ => {
          warn!("Ignore invalid timeout {} seconds, use the default", seconds);
          None
        }
      },
      None => None,
    };
    CodeSubmission::new(self.code)
      .set_timeout(timeout)
      .set_memory_limit(self.memory_limit_mb)
      .set_expected_output(self.expected_output)
  }
}

impl SandboxResponse {
  pub fn render(&self) -> String {
    match self {
      SandboxResponse::Outcome(report) => report.render(),
      SandboxResponse::Verdict(verdict) => verdict.render(),
    }
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string_pretty(self).unwrap_or_else(|err| outcome::json_error(&err))
  }
}

impl Supervisor {
  /// Execute the request and grade it when it carries an expected output
  pub fn evaluate(&self, request: SandboxRequest) -> SandboxResponse {
    let submission = request.into_submission();
    let report = self.run(&submission);
    match submission.expected() {
      Some(expected) => SandboxResponse::Verdict(compare(report.outcome(), expected)),
      None => SandboxResponse::Outcome(report),
    }
  }
}

/// Evaluate one request under `config`
pub fn evaluate(config: &SandboxConfig, request: SandboxRequest) -> SandboxResponse {
  match Supervisor::new(config.clone()) {
    Ok(supervisor) => supervisor.evaluate(request),
    Err(err) => {
      error!("Create supervisor fails: {}", err);
      let outcome = ExecutionOutcome::RuntimeError {
        message: format!("Sandbox error: {}", err),
        stdout_so_far: String::new(),
      };
      match request.expected_output {
        Some(expected) => SandboxResponse::Verdict(compare(&outcome, &expected)),
        None => SandboxResponse::Outcome(ExecutionReport::new(outcome, Duration::ZERO, None)),
      }
    }
  }
}

/// Execute `code` with the default configuration
pub fn execute(code: &str) -> ExecutionOutcome {
  DEFAULT_SUPERVISOR.execute(&CodeSubmission::new(code))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_ignore_invalid_request_timeouts() {
    for seconds in [0.0, -1.0, f64::NAN, 1e19] {
      let request = SandboxRequest {
        timeout_seconds: Some(seconds),
        ..SandboxRequest::new("print(1)")
      };
      assert_eq!(request.into_submission().timeout_limit(), None);
    }

    let request = SandboxRequest {
      timeout_seconds: Some(2.5),
      memory_limit_mb: Some(64),
      ..SandboxRequest::new("print(1)")
    };
    let submission = request.into_submission();
    assert_eq!(submission.timeout_limit(), Some(Duration::from_millis(2500)));
    assert_eq!(submission.memory_limit_mb(), Some(64));
  }
}
