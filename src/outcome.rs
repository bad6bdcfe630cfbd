use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// What happened to one submission; exactly one case applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
  Success {
    stdout: String,
  },
  SecurityViolation {
    reason: String,
  },
  Timeout {
    limit_seconds: f64,
  },
  MemoryExceeded {
    limit_mb: u64,
  },
  #[serde(rename = "error")]
  RuntimeError {
    message: String,
    stdout_so_far: String,
  },
}

/// An outcome together with how it was obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
  #[serde(flatten)]
  outcome: ExecutionOutcome,
  /// Wall-clock seconds, rounded to 0.1 ms
  execution_time: f64,
  /// Whether the host applied its address-space ceiling, unknown when it never reported
  memory_limit_enforced: Option<bool>,
}

impl ExecutionOutcome {
  /// Short machine-readable status
  pub fn status(&self) -> &'static str {
    match self {
      ExecutionOutcome::Success { .. } => "success",
      ExecutionOutcome::SecurityViolation { .. } => "security_violation",
      ExecutionOutcome::Timeout { .. } => "timeout",
      ExecutionOutcome::MemoryExceeded { .. } => "memory_exceeded",
      ExecutionOutcome::RuntimeError { .. } => "error",
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, ExecutionOutcome::Success { .. })
  }

  /// Whatever the submission printed before the outcome was decided
  pub fn stdout(&self) -> &str {
    match self {
      ExecutionOutcome::Success { stdout } => stdout,
      ExecutionOutcome::RuntimeError { stdout_so_far, .. } => stdout_so_far,
      _ => "",
    }
  }

  /// Feedback line for the agent layer, each kind with its own leading marker
  pub fn render(&self) -> String {
    match self {
      ExecutionOutcome::Success { stdout } => {
        format!("✅ Code executed successfully!\nOutput:\n{}", stdout)
      }
      ExecutionOutcome::SecurityViolation { reason } => format!("❌ Security Error: {}", reason),
      ExecutionOutcome::Timeout { limit_seconds } => format!(
        "❌ Timeout Error: Code execution exceeded {} seconds limit.",
        limit_seconds
      ),
      ExecutionOutcome::MemoryExceeded { limit_mb } => format!(
        "❌ Memory Error: Code execution exceeded {} MB memory limit.",
        limit_mb
      ),
      ExecutionOutcome::RuntimeError {
        message,
        stdout_so_far,
      } => {
        if stdout_so_far.is_empty() {
          format!("❌ Execution Error:\n{}", message)
        } else {
          format!(
            "❌ Execution Error:\n{}\nOutput before the error:\n{}",
            message, stdout_so_far
          )
        }
      }
    }
  }
}

impl ExecutionReport {
  pub(crate) fn new(
    outcome: ExecutionOutcome,
    elapsed: Duration,
    memory_limit_enforced: Option<bool>,
  ) -> Self {
    let execution_time = (elapsed.as_secs_f64() * 10000.0).round() / 10000.0;
    ExecutionReport {
      outcome,
      execution_time,
      memory_limit_enforced,
    }
  }

  pub fn outcome(&self) -> &ExecutionOutcome {
    &self.outcome
  }

  pub fn into_outcome(self) -> ExecutionOutcome {
    self.outcome
  }

  pub fn execution_time(&self) -> f64 {
    self.execution_time
  }

  pub fn memory_limit_enforced(&self) -> Option<bool> {
    self.memory_limit_enforced
  }

  pub fn render(&self) -> String {
    self.outcome.render()
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string_pretty(self).unwrap_or_else(|err| json_error(&err))
  }
}

/// Report for a value that could not be serialized
pub(crate) fn json_error(err: &serde_json::Error) -> String {
  json!({
    "status": "error",
    "message": format!("Serialize report fails: {}", err),
  })
  .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_render_distinct_prefixes() {
    let outcomes = vec![
      ExecutionOutcome::Success {
        stdout: "10".to_string(),
      },
      ExecutionOutcome::SecurityViolation {
        reason: "Forbidden term detected: 'import'".to_string(),
      },
      ExecutionOutcome::Timeout { limit_seconds: 3.0 },
      ExecutionOutcome::MemoryExceeded { limit_mb: 256 },
      ExecutionOutcome::RuntimeError {
        message: "NameError: name 'x' is not defined".to_string(),
        stdout_so_far: String::new(),
      },
    ];
    let prefixes = outcomes
      .iter()
      .map(|o| o.render().split(':').next().unwrap().to_string())
      .collect::<Vec<String>>();
    assert_eq!(
      prefixes,
      vec![
        "✅ Code executed successfully!\nOutput",
        "❌ Security Error",
        "❌ Timeout Error",
        "❌ Memory Error",
        "❌ Execution Error",
      ]
    );
    assert_eq!(
      outcomes[2].render(),
      "❌ Timeout Error: Code execution exceeded 3 seconds limit."
    );
  }

  #[test]
  fn it_should_serialize_with_status_tag() {
    let report = ExecutionReport::new(
      ExecutionOutcome::RuntimeError {
        message: "ZeroDivisionError: division by zero".to_string(),
        stdout_so_far: "1".to_string(),
      },
      Duration::from_micros(123456),
      Some(true),
    );
    assert_eq!(report.execution_time(), 0.1235);

    let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
    assert_eq!(value["status"], "error");
    assert_eq!(value["stdout_so_far"], "1");
    assert_eq!(value["memory_limit_enforced"], true);

    let back: ExecutionReport = serde_json::from_value(value).unwrap();
    assert_eq!(back, report);
  }

  #[test]
  fn it_should_escape_serialization_errors() {
    let err = serde_json::from_str::<ExecutionReport>("\"quoted\"").unwrap_err();
    let value: serde_json::Value = serde_json::from_str(&json_error(&err)).unwrap();
    assert_eq!(value["status"], "error");
    assert!(value["message"]
      .as_str()
      .unwrap()
      .starts_with("Serialize report fails: "));
  }

  #[test]
  fn it_should_expose_partial_stdout() {
    let outcome = ExecutionOutcome::RuntimeError {
      message: "boom".to_string(),
      stdout_so_far: "1\n2".to_string(),
    };
    assert_eq!(outcome.stdout(), "1\n2");
    assert_eq!(outcome.status(), "error");
    assert!(!outcome.is_success());
    assert!(outcome.render().ends_with("Output before the error:\n1\n2"));
  }
}
