//! The restricted namespace submitted code runs in.
//!
//! Submissions are executed by an embedded interpreter whose builtins module is
//! pruned down to a whitelist of pure callables before any user code is compiled.
//! Nothing else is reachable: no `__import__`, no `open`, no `eval`/`exec`, no
//! `getattr`/`globals`, no `__build_class__`. The absence is the boundary.
//!
//! `sys.stdout` is replaced by a writer that forwards every `print` to an
//! [`OutputSink`]; `sys.stderr` writes are swallowed.

use std::sync::{Arc, Mutex};

use rustpython_vm::{
  builtins::PyBaseExceptionRef, compiler::Mode, function::FuncArgs, AsObject, Interpreter,
  PyObjectRef, PyResult, Settings, VirtualMachine,
};
use serde::{Deserialize, Serialize};

use crate::utils::SnakeBoxWritePipe;
use crate::SnakeBoxError;

/// Where `print` output goes
pub trait OutputSink: Send + Sync {
  fn write(&self, bytes: &[u8]) -> Result<(), SnakeBoxError>;
}

/// How the submitted code finished inside the namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NamespaceOutcome {
  Completed,
  MemoryError { message: String },
  Raised { message: String },
}

/// The whitelist, ready to be installed into a fresh interpreter
#[derive(Debug, Clone)]
pub struct RestrictedNamespace {
  builtins: Vec<String>,
}

/// An interpreter with the whitelist installed and stdout captured
pub struct PreparedNamespace {
  interpreter: Interpreter,
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemorySink(Mutex<Vec<u8>>);

impl OutputSink for MemorySink {
  fn write(&self, bytes: &[u8]) -> Result<(), SnakeBoxError> {
    let mut buf = self
      .0
      .lock()
      .map_err(|_| SnakeBoxError::host("Output buffer poisoned"))?;
    buf.extend_from_slice(bytes);
    Ok(())
  }
}

impl MemorySink {
  pub fn contents(&self) -> String {
    match self.0.lock() {
      Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
      Err(_) => String::new(),
    }
  }
}

impl OutputSink for SnakeBoxWritePipe {
  fn write(&self, bytes: &[u8]) -> Result<(), SnakeBoxError> {
    self.write_all(bytes)
  }
}

impl RestrictedNamespace {
  pub fn new<BS: AsRef<str>>(builtins: &[BS]) -> Self {
    RestrictedNamespace {
      builtins: builtins.iter().map(|b| b.as_ref().to_string()).collect(),
    }
  }

  pub fn builtins(&self) -> &Vec<String> {
    &self.builtins
  }

  /// Build a fresh interpreter, capture its stdout into `sink` and prune its builtins
  pub fn prepare(&self, sink: Arc<dyn OutputSink>) -> Result<PreparedNamespace, SnakeBoxError> {
    let interpreter = Interpreter::without_stdlib(Settings::default());
    let source = self.prune_source();

    interpreter.enter(|vm| -> Result<(), SnakeBoxError> {
      install_output_capture(vm, sink);

      let code = vm
        .compile(&source, Mode::Exec, "<namespace>".to_owned())
        .map_err(|err| SnakeBoxError::host(format!("Namespace setup fails: {}", err)))?;
      vm.run_code_obj(code, vm.new_scope_with_builtins())
        .map_err(|exc| {
          SnakeBoxError::host(format!(
            "Namespace setup fails: {}",
            format_exception(vm, &exc)
          ))
        })?;
      Ok(())
    })?;

    Ok(PreparedNamespace { interpreter })
  }

  /// Python run once with the full builtins, deleting everything not whitelisted
  fn prune_source(&self) -> String {
    let keep = self
      .builtins
      .iter()
      .map(|name| format!("'{}', ", name))
      .collect::<String>();
    format!(
      "import builtins\n\
       def prune(table, keep):\n    \
       for name in [name for name in table]:\n        \
       if name not in keep:\n            \
       del table[name]\n\
       prune(builtins.__dict__, ({}))\n",
      keep
    )
  }
}

impl PreparedNamespace {
  /// Compile and execute `code` as `__main__`
  pub fn run(&self, code: &str) -> NamespaceOutcome {
    self.interpreter.enter(|vm| {
      let code = match vm.compile(code, Mode::Exec, "<submission>".to_owned()) {
        Ok(code) => code,
        Err(err) => {
          return NamespaceOutcome::Raised {
            message: format!("SyntaxError: {}", err),
          }
        }
      };

      let scope = vm.new_scope_with_builtins();
      let _ = scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);

      match vm.run_code_obj(code, scope) {
        Ok(_) => NamespaceOutcome::Completed,
        Err(exc) => {
          let message = format_exception(vm, &exc);
          let last_line = message.lines().rev().find(|l| !l.trim().is_empty());
          match last_line {
            Some(line) if line.starts_with("MemoryError") => NamespaceOutcome::MemoryError { message },
            _ => NamespaceOutcome::Raised { message },
          }
        }
      }
    })
  }
}

/// Traceback text, falling back to `str(exc)`
fn format_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
  let mut traceback = String::new();
  if vm.write_exception(&mut traceback, exc).is_ok() && !traceback.trim().is_empty() {
    return traceback.trim_end().to_string();
  }
  exc
    .as_object()
    .str(vm)
    .map(|s| s.as_str().to_owned())
    .unwrap_or_else(|_| "Unknown runtime error".to_owned())
}

fn install_output_capture(vm: &VirtualMachine, sink: Arc<dyn OutputSink>) {
  let stdout = build_writer_object(vm, Some(sink));
  let stderr = build_writer_object(vm, None);
  let _ = vm.sys_module.set_attr("stdout", stdout, vm);
  let _ = vm.sys_module.set_attr("stderr", stderr, vm);
}

/// A module used as a namespace carrying `write` and `flush`
fn build_writer_object(vm: &VirtualMachine, sink: Option<Arc<dyn OutputSink>>) -> PyObjectRef {
  let write_fn = vm.new_function(
    "write",
    move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
      let data: String = args
        .args
        .first()
        .and_then(|o| o.str(vm).ok())
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default();
      if let Some(sink) = &sink {
        sink
          .write(data.as_bytes())
          .map_err(|err| vm.new_runtime_error(err.to_string()))?;
      }
      Ok(vm.ctx.new_int(data.len()).into())
    },
  );
  let flush_fn = vm.new_function(
    "flush",
    |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
  );

  let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
  let _ = ns.set_attr("write", write_fn, vm);
  let _ = ns.set_attr("flush", flush_fn, vm);
  let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
  let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
  ns.into()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DEFAULT_BUILTINS;
  use crate::host::on_host_stack;

  fn run(code: &'static str) -> (NamespaceOutcome, String) {
    on_host_stack(move || {
      let sink = Arc::new(MemorySink::default());
      let namespace = RestrictedNamespace::new(&DEFAULT_BUILTINS)
        .prepare(sink.clone())
        .unwrap();
      let outcome = namespace.run(code);
      (outcome, sink.contents())
    })
    .unwrap()
  }

  fn raised(outcome: NamespaceOutcome) -> String {
    match outcome {
      NamespaceOutcome::Raised { message } => message,
      other => panic!("Expected a raised error, got {:?}", other),
    }
  }

  #[test]
  fn it_should_capture_print() {
    let (outcome, stdout) = run("def f(n):\n a=0\n for i in range(n): a+=i\n print(a)\nf(5)");
    assert_eq!(outcome, NamespaceOutcome::Completed);
    assert_eq!(stdout, "10\n");
  }

  #[test]
  fn it_should_expose_whitelisted_builtins() {
    let code = "xs = [3, 1, 2]\n\
                print(sorted(xs), len(xs), sum(xs), min(xs), max(xs), abs(-4))\n\
                print(list(reversed(xs)), list(zip(xs, range(3))), dict(a=1))\n\
                print(round(2.567, 2), int('7'), float('1.5'), str(5), bool(0))\n\
                print(tuple(xs), set([1, 1]), list(enumerate('ab')))";
    let (outcome, stdout) = run(code);
    assert_eq!(outcome, NamespaceOutcome::Completed);
    assert_eq!(
      stdout,
      "[1, 2, 3] 3 6 1 3 4\n\
       [2, 1, 3] [(3, 0), (1, 1), (2, 2)] {'a': 1}\n\
       2.57 7 1.5 5 False\n\
       (3, 1, 2) {1} [(0, 'a'), (1, 'b')]\n"
    );
  }

  #[test]
  fn it_should_hide_everything_else() {
    for code in [
      "__import__('math')",
      "getattr(1, 'real')",
      "globals()",
      "compile('1', 'x', 'eval')",
      "type(1)",
    ] {
      let (outcome, _) = run(code);
      assert!(raised(outcome).contains("NameError"), "{} should not resolve", code);
    }

    let (outcome, _) = run("class A:\n    pass");
    assert!(raised(outcome).contains("__build_class__"));
  }

  #[test]
  fn it_should_keep_partial_output_on_error() {
    let (outcome, stdout) = run("print(1)\nprint(2)\nx = 1 / 0\nprint(3)");
    assert!(raised(outcome).contains("ZeroDivisionError"));
    assert_eq!(stdout, "1\n2\n");
  }

  #[test]
  fn it_should_report_syntax_errors() {
    let (outcome, stdout) = run("def f(:\n  pass");
    assert!(raised(outcome).starts_with("SyntaxError"));
    assert_eq!(stdout, "");
  }

  #[test]
  fn it_should_honor_custom_whitelist() {
    let outcome = on_host_stack(|| {
      let sink = Arc::new(MemorySink::default());
      let namespace = RestrictedNamespace::new(&["print"]).prepare(sink).unwrap();
      namespace.run("print(len([1]))")
    })
    .unwrap();
    assert!(raised(outcome).contains("NameError"));
  }
}
