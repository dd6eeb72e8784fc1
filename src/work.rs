//! Jobs and the result envelope that travels back from each child.
//!
//! A [`WorkUnit`] pairs a user job (anything implementing [`Work`]) with its
//! [`Outcome`]. The job runs only inside a forked child and never crosses the
//! process boundary; the outcome is what the child reports back and what the
//! caller receives from [`Pool::run`](crate::Pool::run).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use thiserror::Error;

use crate::error::{PoolError, Result};
use crate::wire::{Closure, ClosureRegistry, Value};

/// An error raised by a job's own logic.
///
/// The optional code becomes the child's exit status when it falls in
/// `1..=254`; anything else maps to `1`. `255` stays reserved for fatal
/// crashes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkError {
    message: String,
    code: Option<i32>,
}

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Exit status the child uses when the job fails with this error.
    pub fn exit_status(&self) -> i32 {
        match self.code {
            Some(code) if (1..=254).contains(&code) => code,
            _ => 1,
        }
    }
}

impl From<String> for WorkError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for WorkError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A unit of work executed in its own child process.
pub trait Work: Send {
    /// Human-readable name used in lifecycle logs.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Do the work. The returned value becomes the unit's `result`.
    fn execute(&mut self) -> std::result::Result<Value, WorkError>;
}

/// Adapts a closure into a [`Work`] job.
pub struct FnWork<F> {
    name: String,
    body: F,
}

impl<F> FnWork<F>
where
    F: FnMut() -> std::result::Result<Value, WorkError> + Send,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> Work for FnWork<F>
where
    F: FnMut() -> std::result::Result<Value, WorkError> + Send,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn execute(&mut self) -> std::result::Result<Value, WorkError> {
        (self.body)()
    }
}

/// Runs a serializable [`Closure`] resolved through a [`ClosureRegistry`].
#[derive(Debug, Clone)]
pub struct ClosureWork {
    closure: Closure,
    registry: ClosureRegistry,
    args: Vec<Value>,
}

impl ClosureWork {
    pub fn new(closure: Closure, registry: ClosureRegistry) -> Self {
        Self {
            closure,
            registry,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

impl Work for ClosureWork {
    fn name(&self) -> String {
        self.closure.name().to_string()
    }

    fn execute(&mut self) -> std::result::Result<Value, WorkError> {
        let bound = self
            .registry
            .bind(&self.closure)
            .map_err(|e| WorkError::new(e.to_string()))?;
        bound.call(&self.args)
    }
}

/// The result envelope of one unit.
///
/// Identity fields are write-once; setting one twice is a programming error
/// and fails with [`PoolError::AlreadyBound`].
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub(crate) id: Option<usize>,
    pub(crate) name: String,
    pub(crate) parent_pid: Option<Pid>,
    pub(crate) pid: Option<Pid>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) success: bool,
    pub(crate) error: Option<String>,
    pub(crate) result: Value,
    pub(crate) duration: Duration,
    pub(crate) memory_usage: u64,
    pub(crate) timeout: Option<Duration>,
    pub(crate) started_at: Option<DateTime<Utc>>,
}

impl Outcome {
    pub(crate) fn new(name: String) -> Self {
        Self {
            id: None,
            name,
            parent_pid: None,
            pid: None,
            exit_code: Some(0),
            success: true,
            error: None,
            result: Value::Null,
            duration: Duration::ZERO,
            memory_usage: 0,
            timeout: None,
            started_at: None,
        }
    }

    /// Mark the unit failed with `message`.
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.error = Some(message.into());
    }
}

fn bind_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(PoolError::AlreadyBound { field });
    }
    *slot = Some(value);
    Ok(())
}

/// One job plus its result envelope.
pub struct WorkUnit {
    job: Option<Box<dyn Work>>,
    outcome: Outcome,
}

impl WorkUnit {
    pub fn new(job: impl Work + 'static) -> Self {
        let outcome = Outcome::new(job.name());
        Self {
            job: Some(Box::new(job)),
            outcome,
        }
    }

    /// Shorthand for `WorkUnit::new(FnWork::new(name, body))`.
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut() -> std::result::Result<Value, WorkError> + Send + 'static,
    {
        Self::new(FnWork::new(name, body))
    }

    /// Limit how long the job may run inside its child.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.outcome.timeout = Some(timeout);
        self
    }

    /// Position in submission order.
    pub fn id(&self) -> Option<usize> {
        self.outcome.id
    }

    pub fn name(&self) -> &str {
        &self.outcome.name
    }

    pub fn parent_pid(&self) -> Option<Pid> {
        self.outcome.parent_pid
    }

    pub fn pid(&self) -> Option<Pid> {
        self.outcome.pid
    }

    /// Exit status; `None` only if the child was stopped rather than exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.exit_code
    }

    pub fn is_success(&self) -> bool {
        self.outcome.success
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.error.as_deref()
    }

    pub fn result(&self) -> &Value {
        &self.outcome.result
    }

    pub fn duration(&self) -> Duration {
        self.outcome.duration
    }

    /// Peak resident memory of the child, in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.outcome.memory_usage
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.outcome.timeout
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.outcome.started_at
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub(crate) fn outcome_mut(&mut self) -> &mut Outcome {
        &mut self.outcome
    }

    pub(crate) fn bind_id(&mut self, id: usize) -> Result<()> {
        bind_once(&mut self.outcome.id, id, "id")
    }

    pub(crate) fn bind_parent_pid(&mut self, pid: Pid) -> Result<()> {
        bind_once(&mut self.outcome.parent_pid, pid, "parent_pid")
    }

    pub(crate) fn bind_pid(&mut self, pid: Pid) -> Result<()> {
        bind_once(&mut self.outcome.pid, pid, "pid")
    }

    /// Apply a default timeout if the unit did not declare its own.
    pub(crate) fn default_timeout(&mut self, timeout: Option<Duration>) {
        if self.outcome.timeout.is_none() {
            self.outcome.timeout = timeout;
        }
    }

    pub(crate) fn take_job(&mut self) -> Option<Box<dyn Work>> {
        self.job.take()
    }

    /// Merge the envelope a child reported for this unit.
    ///
    /// The parent's copy never has `pid` bound, so the reported pid is bound
    /// here; identity fields that disagree mean the report is not ours.
    pub(crate) fn absorb(&mut self, report: Outcome) -> Result<()> {
        let pid = report.pid.ok_or(PoolError::MalformedReport {
            pid: Pid::from_raw(0),
            reason: "report carries no pid".to_string(),
        })?;
        if report.id != self.outcome.id || report.parent_pid != self.outcome.parent_pid {
            return Err(PoolError::MalformedReport {
                pid,
                reason: format!(
                    "identity mismatch: report is unit {:?} of parent {:?}",
                    report.id, report.parent_pid
                ),
            });
        }
        self.bind_pid(pid)?;

        let outcome = &mut self.outcome;
        outcome.exit_code = report.exit_code;
        outcome.success = report.success;
        outcome.error = report.error;
        outcome.result = report.result;
        outcome.duration = report.duration;
        outcome.memory_usage = report.memory_usage;
        outcome.started_at = report.started_at;
        Ok(())
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("pending", &self.job.is_some())
            .field("outcome", &self.outcome)
            .finish()
    }
}
