use std::env;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::submission::CodeSubmission;
use crate::SnakeBoxError;

/// Wall-clock budget of a submission when nothing else is said
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3;

/// Longest wall-clock budget any submission may ask for
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;

/// Address-space headroom granted to a submission (unit: MB)
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;

/// Captured stdout beyond this many bytes is dropped
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Whole-word tokens that make the policy filter reject a submission
pub const DEFAULT_DENYLIST: [&str; 8] = [
  "import",
  "os",
  "sys",
  "subprocess",
  "open",
  "input",
  "eval",
  "exec",
];

/// The only builtins reachable from submitted code
pub const DEFAULT_BUILTINS: [&str; 20] = [
  "print",
  "range",
  "len",
  "sum",
  "min",
  "max",
  "abs",
  "round",
  "int",
  "str",
  "list",
  "dict",
  "tuple",
  "set",
  "float",
  "bool",
  "sorted",
  "enumerate",
  "zip",
  "reversed",
];

lazy_static! {
  static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Resource ceilings of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
  /// Wall-clock timeout
  pub timeout: Duration,
  /// Address-space ceiling above the host baseline (unit: MB), 0 disables it
  pub memory_limit_mb: u64,
  /// Upper bound of captured stdout
  pub max_output_bytes: usize,
}

/// Sandbox configuration, handed to the supervisor once at construction
#[derive(Debug, Clone)]
pub struct SandboxConfig {
  limits: ResourceLimits,
  denylist: Vec<String>,
  builtins: Vec<String>,
  require_memory_limit: bool,
}

/// Build SandboxConfig
pub struct SandboxConfigBuilder {
  config: SandboxConfig,
}

impl Default for ResourceLimits {
  fn default() -> Self {
    ResourceLimits {
      timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
      memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
      max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
    }
  }
}

impl ResourceLimits {
  /// Apply the per-submission overrides on top of these limits
  pub fn for_submission(&self, submission: &CodeSubmission) -> ResourceLimits {
    let mut limits = self.clone();
    if let Some(timeout) = submission.timeout_limit() {
      limits.timeout = timeout.min(max_timeout());
    }
    if let Some(memory_limit_mb) = submission.memory_limit_mb() {
      limits.memory_limit_mb = memory_limit_mb;
    }
    limits
  }
}

impl Default for SandboxConfig {
  fn default() -> Self {
    SandboxConfig {
      limits: ResourceLimits::default(),
      denylist: DEFAULT_DENYLIST.iter().map(|t| t.to_string()).collect(),
      builtins: DEFAULT_BUILTINS.iter().map(|b| b.to_string()).collect(),
      require_memory_limit: false,
    }
  }
}

impl SandboxConfig {
  /// Start from the defaults
  pub fn builder() -> SandboxConfigBuilder {
    SandboxConfigBuilder {
      config: SandboxConfig::default(),
    }
  }

  /// Defaults overridden by `SNAKEBOX_TIMEOUT`, `SNAKEBOX_MEMORY` and
  /// `SNAKEBOX_REQUIRE_MEMORY_LIMIT`; unparsable values are logged and ignored
  pub fn from_env() -> Self {
    let mut config = SandboxConfig::default();
    if let Some(seconds) = read_env::<f64>("SNAKEBOX_TIMEOUT") {
      match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) if !timeout.is_zero() && timeout <= max_timeout() => {
          config.limits.timeout = timeout
        }
        _ => warn!("Ignore out of range SNAKEBOX_TIMEOUT={}", seconds),
      }
    }
    if let Some(memory) = read_env::<u64>("SNAKEBOX_MEMORY") {
      config.limits.memory_limit_mb = memory;
    }
    if let Some(flag) = read_env::<bool>("SNAKEBOX_REQUIRE_MEMORY_LIMIT") {
      config.require_memory_limit = flag;
    }
    config
  }

  pub fn limits(&self) -> &ResourceLimits {
    &self.limits
  }

  pub fn denylist(&self) -> &Vec<String> {
    &self.denylist
  }

  pub fn builtins(&self) -> &Vec<String> {
    &self.builtins
  }

  pub fn require_memory_limit(&self) -> bool {
    self.require_memory_limit
  }
}

impl From<SandboxConfig> for SandboxConfigBuilder {
  fn from(config: SandboxConfig) -> Self {
    SandboxConfigBuilder { config }
  }
}

impl SandboxConfigBuilder {
  /// Set default wall-clock timeout
  pub fn timeout(mut self, value: Duration) -> Self {
    self.config.limits.timeout = value;
    self
  }

  /// Set default memory limit (unit: MB)
  pub fn memory_limit(mut self, value: u64) -> Self {
    self.config.limits.memory_limit_mb = value;
    self
  }

  /// Set default memory limit or do nothing
  pub fn set_memory_limit(mut self, value: Option<u64>) -> Self {
    if let Some(value) = value {
      self.config.limits.memory_limit_mb = value;
    }
    self
  }

  /// Set default wall-clock timeout or do nothing
  pub fn set_timeout(mut self, value: Option<Duration>) -> Self {
    if let Some(value) = value {
      self.config.limits.timeout = value;
    }
    self
  }

  /// Set captured stdout bound (unit: bytes)
  pub fn max_output(mut self, value: usize) -> Self {
    self.config.limits.max_output_bytes = value;
    self
  }

  /// Replace the policy denylist
  pub fn denylist<TS: Into<String>>(mut self, tokens: Vec<TS>) -> Self {
    self.config.denylist = tokens.into_iter().map(|t| t.into()).collect();
    self
  }

  /// Replace the builtin whitelist
  pub fn builtins<BS: Into<String>>(mut self, names: Vec<BS>) -> Self {
    self.config.builtins = names.into_iter().map(|b| b.into()).collect();
    self
  }

  /// Refuse to run when the address-space ceiling cannot be applied
  pub fn require_memory_limit(mut self, flag: bool) -> Self {
    self.config.require_memory_limit = flag;
    self
  }

  /// Validate and finish building
  pub fn build(self) -> Result<SandboxConfig, SnakeBoxError> {
    let config = self.config;
    if config.limits.timeout.is_zero() {
      return Err(SnakeBoxError::config("Timeout should be positive"));
    }
    if config.limits.timeout > max_timeout() {
      return Err(SnakeBoxError::config(format!(
        "Timeout should not exceed {} seconds",
        MAX_TIMEOUT_SECONDS
      )));
    }
    if config.limits.max_output_bytes == 0 {
      return Err(SnakeBoxError::config("Output limit should be positive"));
    }
    for token in config.denylist.iter() {
      if token.trim().is_empty() {
        return Err(SnakeBoxError::config("Denylist token should not be empty"));
      }
    }
    for name in config.builtins.iter() {
      if !IDENTIFIER.is_match(name) {
        return Err(SnakeBoxError::config(format!(
          "Builtin {:?} is not an identifier",
          name
        )));
      }
    }
    Ok(config)
  }
}

pub(crate) fn max_timeout() -> Duration {
  Duration::from_secs(MAX_TIMEOUT_SECONDS)
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
  let text = env::var(key).ok()?;
  match text.trim().parse::<T>() {
    Ok(value) => {
      info!("Read environment variable {} = {}", key, text);
      Some(value)
    }
    Err(_) => {
      warn!("Wrong environment variable {} ({}) format", key, text);
      None
    }
  }
}
