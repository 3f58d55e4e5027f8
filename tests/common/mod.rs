//! Shared fixtures for the integration tests

#![allow(dead_code)]

use confine::kernel::rlimit::current_virtual_size;
use confine::{Args, CallArgs, CallContext, ConfinedError, Function, FunctionRegistry, SandboxConfig, Value};
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

fn getpid(_: &CallContext<'_>, _: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    Ok(Value::Int(i64::from(std::process::id())))
}

fn sleep(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    std::thread::sleep(Duration::from_secs_f64(args.float(0)?));
    Ok(Value::None)
}

/// Reserve and touch `n` MiB
fn hog(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    let bytes = args.int(0)? as usize * MIB as usize;
    let mut block: Vec<u8> = Vec::new();
    block
        .try_reserve_exact(bytes)
        .map_err(|e| ConfinedError::new("MemoryError", e.to_string()))?;
    block.resize(bytes, 1);
    Ok(Value::Int(block.iter().step_by(4096).map(|b| i64::from(*b)).sum()))
}

fn add(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("add", 2)?;
    match (args.require(0)?.as_int(), args.require(1)?.as_int()) {
        (Some(a), Some(b)) => Ok(Value::Int(a + b)),
        _ => Ok(Value::Float(args.float(0)? + args.float(1)?)),
    }
}

fn reject(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    Err(ConfinedError::new(
        "ValueError",
        format!("bad input: {}", args.str(0)?),
    ))
}

fn explode(_: &CallContext<'_>, _: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    panic!("native function exploded");
}

/// Leaves the process without answering
fn vanish(_: &CallContext<'_>, _: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    unsafe { libc::_exit(3) }
}

/// Reports where it ran
fn site(ctx: &CallContext<'_>, _: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    Ok(Value::from(ctx.confinement().site().to_string()))
}

/// Reads a dunder attribute of its first argument
fn introspect(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    Ok(args.require(0)?.attr("__class__")?.to_value())
}

/// Returns a value JSON cannot carry
fn infinity(_: &CallContext<'_>, _: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    Ok(Value::Float(f64::INFINITY))
}

pub const GETPID: Function = Function::new("getpid", getpid);
pub const SLEEP: Function = Function::new("sleep", sleep);
pub const HOG: Function = Function::new("hog", hog);
pub const ADD: Function = Function::new("add", add);
pub const REJECT: Function = Function::new("reject", reject);
pub const EXPLODE: Function = Function::new("explode", explode);
pub const VANISH: Function = Function::new("vanish", vanish);
pub const SITE: Function = Function::new("site", site);
pub const INTROSPECT: Function = Function::new("introspect", introspect);
pub const INFINITY: Function = Function::new("infinity", infinity);

pub fn registry() -> FunctionRegistry {
    [
        GETPID, SLEEP, HOG, ADD, REJECT, EXPLODE, VANISH, SITE, INTROSPECT, INFINITY,
    ]
    .into_iter()
    .collect()
}

/// Address-space cap `headroom_mib` above what this process already maps
pub fn memory_cap(headroom_mib: u64) -> Option<u64> {
    Some(current_virtual_size().unwrap_or(0) + headroom_mib * MIB)
}

pub fn single_use_config() -> SandboxConfig {
    SandboxConfig::default()
        .with_timeout(Duration::from_secs(10))
        .with_max_memory(memory_cap(512))
}

pub fn persistent_config() -> SandboxConfig {
    single_use_config().with_persistent_worker(true)
}

pub fn in_process_config() -> SandboxConfig {
    SandboxConfig::in_process()
}

pub fn no_args() -> Args {
    Args::new()
}

/// Whether `pid` is a running (non-zombie) process
pub fn pid_alive(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // state is the first field after the parenthesised command name
    match stat.rfind(')') {
        Some(end) => !matches!(stat[end + 1..].trim_start().chars().next(), Some('Z' | 'X') | None),
        None => false,
    }
}

/// Poll until `pid` is gone, up to `limit`
pub fn wait_until_gone(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    !pid_alive(pid)
}

pub fn as_pid(value: Value) -> i32 {
    match value {
        Value::Int(pid) => pid as i32,
        other => panic!("expected a pid, got {:?}", other),
    }
}
