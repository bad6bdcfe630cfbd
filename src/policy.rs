use lazy_static::lazy_static;
use regex::Regex;

use crate::config::DEFAULT_DENYLIST;
use crate::SnakeBoxError;

lazy_static! {
  static ref DEFAULT_PATTERN: Regex = compile_denylist(&DEFAULT_DENYLIST)
    .unwrap()
    .unwrap();
}

/// Verdict of the static filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
  Allow,
  Reject(String),
}

/// Textual denylist over whole words.
///
/// This is only the cheap first line: it runs before any process exists, and the
/// restricted namespace inside the host stays the binding guarantee. Matching is by
/// word boundary, so `import_count` passes while a variable literally named `os`
/// is still rejected.
#[derive(Debug, Clone)]
pub struct PolicyFilter {
  pattern: Option<Regex>,
}

impl Default for PolicyFilter {
  fn default() -> Self {
    PolicyFilter {
      pattern: Some(DEFAULT_PATTERN.clone()),
    }
  }
}

impl PolicyFilter {
  pub fn new<TS: AsRef<str>>(denylist: &[TS]) -> Result<Self, SnakeBoxError> {
    Ok(PolicyFilter {
      pattern: compile_denylist(denylist)?,
    })
  }

  /// Reject on the first denylisted token in source order
  pub fn filter(&self, code: &str) -> PolicyDecision {
    let token = self
      .pattern
      .as_ref()
      .and_then(|pattern| pattern.find(code))
      .map(|m| m.as_str());
    match token {
      Some(token) => PolicyDecision::Reject(format!("Forbidden term detected: '{}'", token)),
      None => PolicyDecision::Allow,
    }
  }
}

fn compile_denylist<TS: AsRef<str>>(denylist: &[TS]) -> Result<Option<Regex>, SnakeBoxError> {
  let tokens = denylist
    .iter()
    .map(|t| t.as_ref().trim())
    .filter(|t| !t.is_empty())
    .map(regex::escape)
    .collect::<Vec<String>>();
  if tokens.is_empty() {
    return Ok(None);
  }
  let pattern = Regex::new(&format!(r"\b(?:{})\b", tokens.join("|")))?;
  Ok(Some(pattern))
}
