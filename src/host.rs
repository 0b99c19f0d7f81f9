//! Host callback surface.
//!
//! The engine stores callback and predicate *names* and resolves them
//! through a caller-supplied [`Host`] at invocation time. Failures
//! reported by the host never cross the engine boundary: the engine logs
//! them, and a failing condition counts as not eligible.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Failure reported by a host callback or predicate.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Capability supplied by the caller that owns the actual callback and
/// predicate implementations.
///
/// All callbacks are zero-argument from the engine's perspective; the
/// host is free to close over whatever subject data it likes. Callbacks
/// must return promptly: the engine is single-threaded and evaluates
/// them synchronously inside the tick.
pub trait Host {
    /// Runs a named action (state enter/update/leave, transition taken).
    fn run_action(&mut self, name: &str) -> Result<(), HostError>;

    /// Evaluates a named boolean predicate.
    fn eval_condition(&mut self, name: &str) -> Result<bool, HostError>;
}

/// Host that ignores every action and reports every condition as false.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    fn run_action(&mut self, _name: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn eval_condition(&mut self, _name: &str) -> Result<bool, HostError> {
        Ok(false)
    }
}

/// Host backed by named boolean flags and an action log.
///
/// Useful for simple embeddings and for driving the engine from tests:
/// conditions read `flags` (absent means false), actions append to `log`,
/// and any name listed in `failing` reports a [`HostError`] instead.
#[derive(Debug, Default)]
pub struct ScriptedHost {
    pub flags: HashMap<String, bool>,
    pub log: Vec<String>,
    pub failing: HashSet<String>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a condition flag.
    pub fn set_flag(&mut self, name: impl Into<String>, value: bool) {
        self.flags.insert(name.into(), value);
    }

    /// Marks a name as failing when invoked.
    pub fn fail_on(&mut self, name: impl Into<String>) {
        self.failing.insert(name.into());
    }
}

impl Host for ScriptedHost {
    fn run_action(&mut self, name: &str) -> Result<(), HostError> {
        if self.failing.contains(name) {
            return Err(HostError::new(format!("action '{}' failed", name)));
        }
        self.log.push(name.to_string());
        Ok(())
    }

    fn eval_condition(&mut self, name: &str) -> Result<bool, HostError> {
        if self.failing.contains(name) {
            return Err(HostError::new(format!("condition '{}' failed", name)));
        }
        Ok(self.flags.get(name).copied().unwrap_or(false))
    }
}
