use std::time::Duration;

/// One untrusted program, executed exactly once
#[derive(Debug, Clone, PartialEq)]
pub struct CodeSubmission {
  code: String,
  expected_output: Option<String>,
  timeout: Option<Duration>,
  memory_limit_mb: Option<u64>,
}

impl CodeSubmission {
  pub fn new<CS: Into<String>>(code: CS) -> Self {
    CodeSubmission {
      code: code.into(),
      expected_output: None,
      timeout: None,
      memory_limit_mb: None,
    }
  }

  /// Set the reference output used for grading
  pub fn expected_output<ES: Into<String>>(mut self, expected: ES) -> Self {
    self.expected_output = Some(expected.into());
    self
  }

  /// Set the reference output or do nothing
  pub fn set_expected_output<ES: Into<String>>(mut self, expected: Option<ES>) -> Self {
    self.expected_output = expected.map(|e| e.into());
    self
  }

  /// Set wall-clock timeout
  pub fn timeout(mut self, value: Duration) -> Self {
    self.timeout = Some(value);
    self
  }

  /// Set wall-clock timeout or keep the sandbox default
  pub fn set_timeout(mut self, value: Option<Duration>) -> Self {
    self.timeout = value;
    self
  }

  /// Set memory limit (unit: MB)
  pub fn memory_limit(mut self, value: u64) -> Self {
    self.memory_limit_mb = Some(value);
    self
  }

  /// Set memory limit or keep the sandbox default
  pub fn set_memory_limit(mut self, value: Option<u64>) -> Self {
    self.memory_limit_mb = value;
    self
  }

  pub fn code(&self) -> &str {
    &self.code
  }

  pub fn expected(&self) -> Option<&str> {
    self.expected_output.as_deref()
  }

  pub fn timeout_limit(&self) -> Option<Duration> {
    self.timeout
  }

  pub fn memory_limit_mb(&self) -> Option<u64> {
    self.memory_limit_mb
  }
}
