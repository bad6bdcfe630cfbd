use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::{max_timeout, ResourceLimits, SandboxConfig};
use crate::host::{self, HostReport, HostTask};
use crate::namespace::{NamespaceOutcome, RestrictedNamespace};
use crate::outcome::{ExecutionOutcome, ExecutionReport};
use crate::policy::{PolicyDecision, PolicyFilter};
use crate::submission::CodeSubmission;
use crate::utils::{SnakeBoxPipe, SnakeBoxReadPipe};
use crate::SnakeBoxError;

/// Upper bound of one wait step, so the deadline is overshot by at most this much
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Runs each accepted submission in its own forked host and decides its outcome.
///
/// Calls are synchronous. Concurrent callers are fine, every call owns its process
/// and channels.
pub struct Supervisor {
  config: SandboxConfig,
  policy: PolicyFilter,
  namespace: RestrictedNamespace,
  spawned: AtomicUsize,
}

/// A forked host, killed and reaped on drop unless it was already reaped
struct HostProcess {
  pid: Pid,
  reaped: bool,
}

/// Stdout of the host, drained while it runs
struct StdoutCollector {
  pipe: SnakeBoxReadPipe,
  buf: Vec<u8>,
  limit: usize,
  received: usize,
}

impl Default for Supervisor {
  fn default() -> Self {
    let config = SandboxConfig::default();
    Supervisor {
      policy: PolicyFilter::default(),
      namespace: RestrictedNamespace::new(config.builtins()),
      config,
      spawned: AtomicUsize::new(0),
    }
  }
}

impl Supervisor {
  pub fn new(config: SandboxConfig) -> Result<Self, SnakeBoxError> {
    Ok(Supervisor {
      policy: PolicyFilter::new(config.denylist())?,
      namespace: RestrictedNamespace::new(config.builtins()),
      config,
      spawned: AtomicUsize::new(0),
    })
  }

  pub fn config(&self) -> &SandboxConfig {
    &self.config
  }

  /// Number of host processes forked so far
  pub fn spawned(&self) -> usize {
    self.spawned.load(Ordering::SeqCst)
  }

  pub fn execute(&self, submission: &CodeSubmission) -> ExecutionOutcome {
    self.run(submission).into_outcome()
  }

  /// Filter, spawn, wait and classify. Never fails: plumbing errors become a `RuntimeError`.
  pub fn run(&self, submission: &CodeSubmission) -> ExecutionReport {
    let started = Instant::now();

    if let PolicyDecision::Reject(reason) = self.policy.filter(submission.code()) {
      info!("Reject submission before spawning host: {}", reason);
      return ExecutionReport::new(
        ExecutionOutcome::SecurityViolation { reason },
        Duration::ZERO,
        None,
      );
    }

    let limits = self.config.limits().for_submission(submission);
    match self.spawn(submission.code(), &limits, started) {
      Ok(report) => report,
      Err(err) => {
        error!("Sandbox fails: {}", err);
        ExecutionReport::new(
          ExecutionOutcome::RuntimeError {
            message: format!("Sandbox error: {}", err),
            stdout_so_far: String::new(),
          },
          started.elapsed(),
          None,
        )
      }
    }
  }

  fn spawn(
    &self,
    code: &str,
    limits: &ResourceLimits,
    started: Instant,
  ) -> Result<ExecutionReport, SnakeBoxError> {
    let result_pipe = SnakeBoxPipe::new()?;
    let stdout_pipe = SnakeBoxPipe::new()?;
    let task = HostTask {
      code: code.to_string(),
      limits: limits.clone(),
      namespace: self.namespace.clone(),
      require_memory_limit: self.config.require_memory_limit(),
    };

    match unsafe { fork() } {
      Ok(ForkResult::Parent { child }) => {
        let mut process = HostProcess::new(child);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        info!("Start running submission in host process #{}", child);

        let mut result = result_pipe.read()?;
        let mut stdout = StdoutCollector::new(stdout_pipe.read()?, limits.max_output_bytes);
        let deadline = started
          .checked_add(limits.timeout)
          .unwrap_or_else(|| started + max_timeout());
        let status = wait_with_deadline(&mut process, &mut stdout, deadline)?;
        let elapsed = started.elapsed();

        if stdout.truncated() {
          warn!(
            "Host process #{} printed {} bytes, keep the first {}",
            child, stdout.received, limits.max_output_bytes
          );
        }

        let status = match status {
          Some(status) => status,
          None => {
            info!(
              "Host process #{} is killed after {:.3}s (time limit exceeded)",
              child,
              elapsed.as_secs_f64()
            );
            return Ok(ExecutionReport::new(
              ExecutionOutcome::Timeout {
                limit_seconds: limits.timeout.as_secs_f64(),
              },
              elapsed,
              None,
            ));
          }
        };

        let message = result.read_message()?;
        debug!("Recv message from host process #{}: {:?}", child, message);
        let stdout = stdout.into_string();

        if message.trim().is_empty() {
          let outcome = infer_outcome(status, limits, stdout);
          info!("Host process #{} left no report: {}", child, outcome.status());
          return Ok(ExecutionReport::new(outcome, elapsed, None));
        }

        let report: HostReport = serde_json::from_str(&message)?;
        if !report.memory_limit_enforced && limits.memory_limit_mb > 0 {
          warn!(
            "Host process #{} ran without its {} MB address-space ceiling",
            child, limits.memory_limit_mb
          );
        }
        let outcome = match report.outcome {
          NamespaceOutcome::Completed => ExecutionOutcome::Success { stdout },
          NamespaceOutcome::MemoryError { .. } => ExecutionOutcome::MemoryExceeded {
            limit_mb: limits.memory_limit_mb,
          },
          NamespaceOutcome::Raised { message } => ExecutionOutcome::RuntimeError {
            message,
            stdout_so_far: stdout,
          },
        };
        info!("Host process #{} finished: {}", child, outcome.status());
        Ok(ExecutionReport::new(
          outcome,
          elapsed,
          Some(report.memory_limit_enforced),
        ))
      }
      Ok(ForkResult::Child) => host::enter(task, result_pipe, stdout_pipe),
      Err(errno) => Err(SnakeBoxError::fork(format!("Fork host process fails: {}", errno))),
    }
  }
}

/// Wait until the host exits or the deadline passes, draining stdout meanwhile.
/// `None` means the host was killed at the deadline.
fn wait_with_deadline(
  process: &mut HostProcess,
  stdout: &mut StdoutCollector,
  deadline: Instant,
) -> Result<Option<WaitStatus>, SnakeBoxError> {
  loop {
    if let Some(status) = process.try_wait()? {
      stdout.drain()?;
      return Ok(Some(status));
    }

    let now = Instant::now();
    if now >= deadline {
      process.kill()?;
      stdout.drain()?;
      return Ok(None);
    }

    stdout.wait_readable((deadline - now).min(POLL_SLICE))?;
  }
}

/// Classify a host that died without writing its report
fn infer_outcome(status: WaitStatus, limits: &ResourceLimits, stdout: String) -> ExecutionOutcome {
  match status {
    WaitStatus::Signaled(_, signal, _) => match signal {
      // 超出地址空间上限时，分配失败可能直接终止进程
      Signal::SIGKILL | Signal::SIGABRT | Signal::SIGSEGV | Signal::SIGBUS
        if limits.memory_limit_mb > 0 =>
      {
        ExecutionOutcome::MemoryExceeded {
          limit_mb: limits.memory_limit_mb,
        }
      }
      _ => ExecutionOutcome::RuntimeError {
        message: format!("Sandbox host was terminated by {}", signal),
        stdout_so_far: stdout,
      },
    },
    WaitStatus::Exited(_, code) => ExecutionOutcome::RuntimeError {
      message: format!(
        "Sandbox host exited with status {} without reporting a result",
        code
      ),
      stdout_so_far: stdout,
    },
    other => ExecutionOutcome::RuntimeError {
      message: format!("Sandbox host stopped unexpectedly: {:?}", other),
      stdout_so_far: stdout,
    },
  }
}

impl HostProcess {
  fn new(pid: Pid) -> Self {
    HostProcess { pid, reaped: false }
  }

  fn try_wait(&mut self) -> Result<Option<WaitStatus>, SnakeBoxError> {
    match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
      Ok(WaitStatus::Exited(pid, code)) => {
        self.reaped = true;
        Ok(Some(WaitStatus::Exited(pid, code)))
      }
      Ok(WaitStatus::Signaled(pid, signal, core)) => {
        self.reaped = true;
        Ok(Some(WaitStatus::Signaled(pid, signal, core)))
      }
      Ok(_) | Err(Errno::EINTR) => Ok(None),
      Err(errno) => Err(errno.into()),
    }
  }

  /// SIGKILL and reap
  fn kill(&mut self) -> Result<(), SnakeBoxError> {
    if self.reaped {
      return Ok(());
    }
    match kill(self.pid, Signal::SIGKILL) {
      Ok(_) | Err(Errno::ESRCH) => {}
      Err(errno) => return Err(errno.into()),
    }
    loop {
      match waitpid(self.pid, None) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => break,
        Ok(_) | Err(Errno::EINTR) => continue,
        Err(errno) => return Err(errno.into()),
      }
    }
    self.reaped = true;
    Ok(())
  }
}

impl Drop for HostProcess {
  fn drop(&mut self) {
    if let Err(err) = self.kill() {
      error!("Kill host process #{} fails: {}", self.pid, err);
    }
  }
}

impl StdoutCollector {
  fn new(pipe: SnakeBoxReadPipe, limit: usize) -> Self {
    StdoutCollector {
      pipe,
      buf: vec![],
      limit,
      received: 0,
    }
  }

  /// Block for at most `slice` until the host prints, then drain
  fn wait_readable(&mut self, slice: Duration) -> Result<(), SnakeBoxError> {
    if self.pipe.is_eof() {
      thread::sleep(slice);
      return Ok(());
    }
    let mut fds = [PollFd::new(self.pipe.fd(), PollFlags::POLLIN)];
    let timeout = slice.as_millis().max(1) as i32;
    match poll(&mut fds, timeout) {
      Ok(_) | Err(Errno::EINTR) => {}
      Err(errno) => return Err(errno.into()),
    }
    self.drain()
  }

  fn drain(&mut self) -> Result<(), SnakeBoxError> {
    self.received += self.pipe.read_available(&mut self.buf, self.limit)?;
    Ok(())
  }

  fn truncated(&self) -> bool {
    self.received > self.buf.len()
  }

  fn into_string(self) -> String {
    String::from_utf8_lossy(&self.buf).trim().to_string()
  }
}
