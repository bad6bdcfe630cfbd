use std::ffi::CString;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use libc_stdhandle::{stderr, stdin, stdout};
use log::LevelFilter;
use nix::libc::{self, freopen};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::{sysconf, SysconfVar};
use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;
use crate::namespace::{NamespaceOutcome, OutputSink, RestrictedNamespace};
use crate::utils::{close_inherited_fds, truncate_utf8, SnakeBoxPipe, SnakeBoxWritePipe};
use crate::SnakeBoxError;

/// The interpreter recurses on the native stack
const HOST_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Keeps the report well below the pipe buffer, so the write never blocks
const MAX_MESSAGE_BYTES: usize = 8 * 1024;

/// The single message the host leaves in the result channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct HostReport {
  pub(crate) outcome: NamespaceOutcome,
  pub(crate) memory_limit_enforced: bool,
}

/// Everything the forked host needs, copied before fork
pub(crate) struct HostTask {
  pub(crate) code: String,
  pub(crate) limits: ResourceLimits,
  pub(crate) namespace: RestrictedNamespace,
  pub(crate) require_memory_limit: bool,
}

/// Run `f` on a thread with a stack large enough for the interpreter
pub(crate) fn on_host_stack<F, R>(f: F) -> Result<R, SnakeBoxError>
where
  F: FnOnce() -> R + Send + 'static,
  R: Send + 'static,
{
  let handle = thread::Builder::new()
    .name("snakebox-host".to_string())
    .stack_size(HOST_STACK_SIZE)
    .spawn(f)?;
  handle
    .join()
    .map_err(|_| SnakeBoxError::host("Host thread panicked"))
}

/// Body of the forked process. Never returns into the caller's stack.
pub(crate) fn enter(task: HostTask, result: SnakeBoxPipe, output: SnakeBoxPipe) -> ! {
  // 子进程中不再打日志，fork 时日志锁可能被其他线程持有
  log::set_max_level(LevelFilter::Off);

  let status = catch_unwind(AssertUnwindSafe(move || {
    let (result, output) = match (result.write(), output.write()) {
      (Ok(result), Ok(output)) => (result, output),
      _ => return 1,
    };
    close_inherited_fds(&[result.fd(), output.fd()]);
    redirect_io();

    let report = run(task, output);
    let message = match serde_json::to_string(&report) {
      Ok(message) => message,
      Err(_) => return 1,
    };
    match result.write_all(message.as_bytes()) {
      Ok(_) => 0,
      Err(_) => 1,
    }
  }))
  .unwrap_or(1);

  unsafe { libc::_exit(status) };
}

/// Build the namespace, cap the address space, then run the submission
fn run(task: HostTask, output: SnakeBoxWritePipe) -> HostReport {
  let report = on_host_stack(move || {
    let sink: Arc<dyn OutputSink> = Arc::new(output);
    let namespace = match task.namespace.prepare(sink) {
      Ok(namespace) => namespace,
      Err(err) => {
        return HostReport {
          outcome: NamespaceOutcome::Raised {
            message: format!("Sandbox error: {}", err),
          },
          memory_limit_enforced: false,
        }
      }
    };

    let memory_limit_enforced = if task.limits.memory_limit_mb == 0 {
      false
    } else {
      apply_memory_limit(task.limits.memory_limit_mb).is_ok()
    };
    if !memory_limit_enforced && task.require_memory_limit {
      return HostReport {
        outcome: NamespaceOutcome::Raised {
          message: "Memory limit unavailable: the address-space ceiling could not be applied"
            .to_string(),
        },
        memory_limit_enforced,
      };
    }

    HostReport {
      outcome: namespace.run(&task.code),
      memory_limit_enforced,
    }
  });

  let mut report = report.unwrap_or_else(|err| HostReport {
    outcome: NamespaceOutcome::Raised {
      message: format!("Sandbox error: {}", err),
    },
    memory_limit_enforced: false,
  });
  match &mut report.outcome {
    NamespaceOutcome::MemoryError { message } | NamespaceOutcome::Raised { message } => {
      truncate_utf8(message, MAX_MESSAGE_BYTES)
    }
    NamespaceOutcome::Completed => {}
  }
  report
}

/// 设置地址空间上限：当前地址空间 + limit_mb
///
/// The host is forked from the caller and inherits all of its mappings, so an absolute
/// ceiling would mostly measure the caller. Without `/proc` the ceiling is absolute.
fn apply_memory_limit(limit_mb: u64) -> Result<u64, SnakeBoxError> {
  let headroom = limit_mb.saturating_mul(1024 * 1024);
  let ceiling = match current_address_space() {
    Some(current) => current.saturating_add(headroom),
    None => headroom,
  };
  let (_, hard) = getrlimit(Resource::RLIMIT_AS)?;
  let ceiling = ceiling.min(hard);
  setrlimit(Resource::RLIMIT_AS, ceiling, ceiling)?;
  Ok(ceiling)
}

fn current_address_space() -> Option<u64> {
  let statm = fs::read_to_string("/proc/self/statm").ok()?;
  let pages = statm.split_whitespace().next()?.parse::<u64>().ok()?;
  let page_size = sysconf(SysconfVar::PAGE_SIZE).ok()??;
  Some(pages.saturating_mul(page_size as u64))
}

/// 重定向标准输入输出到 /dev/null
fn redirect_io() {
  let null = CString::new("/dev/null").unwrap_or_default();
  let read = CString::new("r").unwrap_or_default();
  let write = CString::new("w").unwrap_or_default();
  unsafe {
    freopen(null.as_ptr(), read.as_ptr(), stdin());
    freopen(null.as_ptr(), write.as_ptr(), stdout());
    freopen(null.as_ptr(), write.as_ptr(), stderr());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_measure_address_space() {
    let current = current_address_space().unwrap();
    assert!(current > 0);
  }

  #[test]
  fn it_should_run_on_named_host_thread() {
    let name = on_host_stack(|| thread::current().name().map(|n| n.to_string())).unwrap();
    assert_eq!(name, Some("snakebox-host".to_string()));
  }

  #[test]
  fn it_should_turn_panics_into_errors() {
    let result = on_host_stack(|| -> u32 { panic!("host failure") });
    assert!(result.is_err());
  }

  #[test]
  fn it_should_round_trip_report() {
    let report = HostReport {
      outcome: NamespaceOutcome::Raised {
        message: "NameError: name 'x' is not defined".to_string(),
      },
      memory_limit_enforced: true,
    };
    let text = serde_json::to_string(&report).unwrap();
    assert!(text.contains("\"kind\":\"raised\""));
    assert_eq!(serde_json::from_str::<HostReport>(&text).unwrap(), report);
  }
}
