use serde::{Deserialize, Serialize};

use crate::outcome::ExecutionOutcome;

/// Pass/fail judgement of one execution against a reference output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum VerdictResult {
  Pass,
  Fail {
    expected: String,
    actual: String,
    cause: ExecutionOutcome,
  },
}

/// Strict comparison: only a `Success` whose trimmed stdout equals the trimmed
/// expectation byte for byte passes. No tolerance for floats, ordering or case.
pub fn compare(outcome: &ExecutionOutcome, expected: &str) -> VerdictResult {
  if let ExecutionOutcome::Success { stdout } = outcome {
    if stdout.trim() == expected.trim() {
      return VerdictResult::Pass;
    }
  }
  VerdictResult::Fail {
    expected: expected.to_string(),
    actual: outcome.stdout().to_string(),
    cause: outcome.clone(),
  }
}

impl VerdictResult {
  pub fn is_pass(&self) -> bool {
    matches!(self, VerdictResult::Pass)
  }

  pub fn render(&self) -> String {
    match self {
      VerdictResult::Pass => "✅ pass".to_string(),
      VerdictResult::Fail {
        expected,
        actual,
        cause,
      } => {
        if cause.is_success() {
          format!(
            "❌ not pass\nExpected:\n{}\nActual:\n{}",
            expected.trim(),
            actual.trim()
          )
        } else {
          format!("❌ not pass\n{}", cause.render())
        }
      }
    }
  }
}
