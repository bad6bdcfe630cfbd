use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::info;
use nix::libc::STDOUT_FILENO;
use nix::unistd::isatty;
use serde_json::json;

use snakebox::utils::default_format;
use snakebox::{
  ExecutionOutcome, PolicyDecision, PolicyFilter, SandboxConfig, SandboxConfigBuilder,
  SandboxRequest, SandboxResponse, SnakeBoxError, SnakeBoxExit, Supervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short, long, global = true, help = "Time limit (unit: seconds)")]
  time: Option<f64>,

  #[arg(short, long, global = true, help = "Memory limit (unit: MB, 0 disables it)")]
  memory: Option<u64>,

  #[arg(long, global = true, default_value_t = false)]
  verbose: bool,

  #[arg(long, global = true, default_value_t = false, help = "Always report in JSON")]
  json: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run a Python submission")]
  Run {
    #[arg(help = "Submission file, or - to read stdin")]
    submission: PathBuf,

    #[arg(short, long, help = "Expected output file")]
    expected: Option<PathBuf>,
  },

  #[command(about = "Only run the policy filter on a submission")]
  Check {
    #[arg(help = "Submission file, or - to read stdin")]
    submission: PathBuf,
  },
}

impl Cli {
  fn resolve_config(&self) -> Result<SandboxConfig, SnakeBoxError> {
    let timeout = match self.time {
      Some(seconds) => match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) => Some(timeout),
        Err(_) => {
          return Err(SnakeBoxError::cli(format!(
            "Time limit {} should be a positive number",
            seconds
          )))
        }
      },
      None => None,
    };

    SandboxConfigBuilder::from(SandboxConfig::from_env())
      .set_timeout(timeout)
      .set_memory_limit(self.memory)
      .build()
  }
}

fn read_source(path: &PathBuf) -> Result<String, SnakeBoxError> {
  if path.as_os_str() == "-" {
    let mut text = String::new();
    io::stdin().read_to_string(&mut text)?;
    Ok(text)
  } else {
    fs::read_to_string(path).map_err(|err| {
      SnakeBoxError::cli(format!("Read {} fails: {}", path.to_string_lossy(), err))
    })
  }
}

fn report(text: String, json: String, force_json: bool) {
  let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
  if is_tty && !force_json {
    println!("{}", text);
  } else {
    println!("{}", json);
  }
}

fn start() -> Result<(), SnakeBoxError> {
  let cli = Cli::parse();

  let _logger = Logger::try_with_str(if cli.verbose {
    "snakebox=debug"
  } else {
    "snakebox=info"
  })?
  .log_to_file(
    FileSpec::default()
      .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
      .basename("snakebox")
      .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
      .suppress_timestamp(),
  )
  .append()
  .duplicate_to_stderr(Duplicate::Warn)
  .format_for_files(default_format)
  .start()?;

  let config = cli.resolve_config()?;

  match &cli.command {
    Commands::Run {
      submission,
      expected,
    } => {
      info!("Start running submission {}", submission.to_string_lossy());

      let code = read_source(submission)?;
      let expected_output = match expected {
        Some(path) => Some(fs::read_to_string(path).map_err(|err| {
          SnakeBoxError::cli(format!("Read {} fails: {}", path.to_string_lossy(), err))
        })?),
        None => None,
      };

      let supervisor = Supervisor::new(config)?;
      let response = supervisor.evaluate(SandboxRequest {
        expected_output,
        ..SandboxRequest::new(code)
      });
      if let SandboxResponse::Outcome(outcome) = &response {
        info!(
          "Running submission finished: {} in {}s",
          outcome.outcome().status(),
          outcome.execution_time()
        );
      }
      report(response.render(), response.to_json(), cli.json);
    }
    Commands::Check { submission } => {
      let code = read_source(submission)?;
      let filter = PolicyFilter::new(config.denylist())?;
      match filter.filter(&code) {
        PolicyDecision::Allow => report(
          "✅ Policy check passed".to_string(),
          json!({ "status": "allowed" }).to_string(),
          cli.json,
        ),
        PolicyDecision::Reject(reason) => {
          let outcome = ExecutionOutcome::SecurityViolation { reason };
          report(
            outcome.render(),
            serde_json::to_string_pretty(&outcome)?,
            cli.json,
          )
        }
      }
    }
  }

  Ok(())
}

fn main() -> SnakeBoxExit {
  start().into()
}
