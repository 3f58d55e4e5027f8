use crate::config::types::{SandboxConfig, SandboxError};
use crate::core::coordinator::ExecutionCoordinator;
use crate::exec::script::Code;
use crate::protection::builtin::{DenyCalls, DenyNames};
use crate::value::{Namespace, Value};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code used when the confined code itself failed
const EXIT_CONFINED_ERROR: i32 = 1;
/// Exit code used for a timeout, as coreutils `timeout` does
const EXIT_TIMEOUT: i32 = 124;
/// Exit code for every other confinement failure
const EXIT_SANDBOX_ERROR: i32 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a code block under confinement and print the resulting globals as JSON
    Run {
        /// Script file to run (`-` reads standard input)
        #[arg(conflicts_with = "code", required_unless_present = "code")]
        script: Option<PathBuf>,
        /// Code given inline instead of a script file
        #[arg(long, short = 'c')]
        code: Option<String>,
        /// Where the code runs
        #[arg(long, value_enum, default_value_t = Mode::SingleUse)]
        mode: Mode,
        /// Seconds to wait for a worker's answer
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
        /// Worker address-space cap in MiB (0 leaves it uncapped)
        #[arg(long, default_value_t = 512)]
        max_memory: u64,
        /// Seed a global (format: NAME=JSON)
        #[arg(long = "set", value_name = "NAME=JSON")]
        globals: Vec<String>,
        /// Attribute or item name confined code may not touch (repeatable)
        #[arg(long = "deny-attr", value_name = "NAME")]
        deny_attrs: Vec<String>,
        /// Block every attribute and item name starting with `__`
        #[arg(long)]
        deny_dunder: bool,
        /// Function confined code may not call (repeatable)
        #[arg(long = "deny-call", value_name = "NAME")]
        deny_calls: Vec<String>,
    },
    /// Parse a script and list the functions it calls, without running it
    Check {
        /// Script file to check (`-` reads standard input)
        script: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// In the calling process
    InProcess,
    /// In one long-lived worker process
    Persistent,
    /// In a fresh worker process per run
    SingleUse,
}

extern "C" fn signal_handler(sig: i32) {
    // Only async-signal-safe calls here. Exiting closes the task channel,
    // which makes any live worker exit as well.
    let msg = b"confine: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            script,
            code,
            mode,
            timeout,
            max_memory,
            globals,
            deny_attrs,
            deny_dunder,
            deny_calls,
        } => {
            let source = match (code, script) {
                (Some(code), _) => code,
                (None, Some(path)) => read_source(&path)?,
                (None, None) => anyhow::bail!("either a script file or --code is required"),
            };
            let code = Code::parse(&source).map_err(|e| anyhow::anyhow!("{}", e))?;

            if !timeout.is_finite() || timeout <= 0.0 {
                anyhow::bail!("--timeout must be a positive number of seconds");
            }
            let mut config = SandboxConfig::default()
                .with_timeout(Duration::from_secs_f64(timeout))
                .with_max_memory((max_memory > 0).then(|| max_memory.saturating_mul(1024 * 1024)))
                .with_subprocess(mode != Mode::InProcess)
                .with_persistent_worker(mode == Mode::Persistent);
            if !deny_attrs.is_empty() || deny_dunder {
                let mut policy = DenyNames::new(deny_attrs);
                if deny_dunder {
                    policy = policy.with_prefix("__");
                }
                config = config.with_policy(policy);
            }
            if !deny_calls.is_empty() {
                config = config.with_policy(DenyCalls::new(deny_calls));
            }

            let mut namespace = Namespace::new();
            for binding in &globals {
                let (name, value) = parse_binding(binding)?;
                namespace.insert(name, value);
            }

            let coordinator = ExecutionCoordinator::new(config)?;
            log::debug!("running {} statement(s) in {} mode", code.len(), coordinator.mode());
            let outcome = coordinator.execute(&code, Some(&mut namespace), None);
            coordinator.close();

            println!("{}", serde_json::to_string_pretty(&namespace_json(&namespace))?);
            if let Err(e) = outcome {
                eprintln!("Error: {}", e);
                std::process::exit(exit_code(&e));
            }
            Ok(())
        }
        Commands::Check { script } => {
            let source = read_source(&script)?;
            let code = Code::parse(&source).map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{} statement(s)", code.len());
            for name in code.called_functions() {
                let origin = if crate::exec::builtins::lookup(name).is_some() {
                    "builtin"
                } else {
                    "external"
                };
                println!("  calls {} ({})", name, origin);
            }
            Ok(())
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut source)
            .context("failed to read script from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn exit_code(err: &SandboxError) -> i32 {
    match err {
        SandboxError::Confined(_) => EXIT_CONFINED_ERROR,
        SandboxError::Timeout(_) => EXIT_TIMEOUT,
        _ => EXIT_SANDBOX_ERROR,
    }
}

/// Split `NAME=JSON` into a global binding
fn parse_binding(binding: &str) -> Result<(String, Value)> {
    let (name, json) = binding
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected NAME=JSON, got '{}'", binding))?;
    let json: serde_json::Value = serde_json::from_str(json)
        .with_context(|| format!("invalid JSON for global '{}'", name))?;
    Ok((name.trim().to_string(), value_from_json(json)?))
}

fn value_from_json(json: serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(
                n.as_f64()
                    .ok_or_else(|| anyhow::anyhow!("number {} is out of range", n))?,
            ),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::List(
            items
                .into_iter()
                .map(value_from_json)
                .collect::<Result<_>>()?,
        ),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, value_from_json(v)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => serde_json::Value::from(bytes.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_json(v)))
                .collect(),
        ),
    }
}

fn namespace_json(namespace: &Namespace) -> serde_json::Value {
    serde_json::Value::Object(
        namespace
            .iter()
            .map(|(name, value)| (name.clone(), value_json(value)))
            .collect(),
    )
}
