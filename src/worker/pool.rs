//! Pool scheduler: admits, forks, reaps and orders units of work.
//!
//! The parent never blocks on a single child. Admission polls the semaphore
//! and reaps between attempts, and every reap pass drains whatever frames
//! a child has already pushed, so a child blocked on a full queue always
//! makes progress.

use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::Instant;

use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpid};
use tracing::instrument;

use super::hooks::{ExitHooks, HookHandle, HookScope};
use super::ipc::{Channel, ChannelError, IpcKey, Receiver};
use super::lifecycle::{EXIT_FATAL, Lifecycle};
use super::proc::ChildProc;
use super::protocol;
use super::semaphore::Semaphore;
use super::signals::{self, InterruptGuard, TerminationReason};
use super::spawn::{self, Forked};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::work::{Outcome, WorkUnit};

/// `ftok` project id of the admission semaphore.
pub const SEMAPHORE_PROJECT: u8 = b's';

/// `ftok` project id of the report channel.
pub const CHANNEL_PROJECT: u8 = b'm';

/// Counters for the last run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Children forked.
    pub dispatched: usize,
    /// Children reaped with a merged result.
    pub finished: usize,
    /// Finished units that did not succeed.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Running,
    Stopped(Signal),
    Terminated(TerminationReason),
}

/// A dispatched unit and what the parent knows about its process.
struct Child {
    proc: ChildProc,
    unit: WorkUnit,
    state: ChildState,
    report: Option<Outcome>,
    /// Last signal that stopped the child, if it was ever stopped.
    stopped: Option<Signal>,
    /// Reap passes since termination that found no report.
    attempts: u32,
}

type PostForkChild = Box<dyn FnMut()>;
type PostForkParent = Box<dyn FnMut(Pid)>;

/// Runs units of work in forked children, at most `workers` at a time.
pub struct Pool {
    config: PoolConfig,
    root: Pid,
    queue: VecDeque<WorkUnit>,
    next_id: usize,
    children: BTreeMap<i32, Child>,
    /// Keyed by pid, then id, so a recycled pid cannot overwrite a result.
    finished: BTreeMap<(i32, usize), WorkUnit>,
    admission: Option<Semaphore>,
    channel: Option<Channel>,
    receiver: Option<Receiver>,
    hooks: ExitHooks,
    post_fork_child: Option<PostForkChild>,
    post_fork_parent: Option<PostForkParent>,
    stats: PoolStats,
}

impl Pool {
    /// Create a pool owned by the calling process.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            root: getpid(),
            queue: VecDeque::new(),
            next_id: 0,
            children: BTreeMap::new(),
            finished: BTreeMap::new(),
            admission: None,
            channel: None,
            receiver: None,
            hooks: ExitHooks::new(),
            post_fork_child: None,
            post_fork_parent: None,
            stats: PoolStats::default(),
        }
    }

    pub fn set_workers(&mut self, workers: usize) -> &mut Self {
        self.config.workers = workers;
        self
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Queue a unit. Its id and parent pid are bound here.
    pub fn submit(&mut self, mut unit: WorkUnit) -> Result<&mut Self> {
        unit.bind_id(self.next_id)?;
        unit.bind_parent_pid(self.root)?;
        self.next_id += 1;
        self.queue.push_back(unit);
        Ok(self)
    }

    pub fn submit_all(&mut self, units: impl IntoIterator<Item = WorkUnit>) -> Result<&mut Self> {
        for unit in units {
            self.submit(unit)?;
        }
        Ok(self)
    }

    /// Units waiting to be dispatched.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Children dispatched and not yet reaped.
    pub fn running(&self) -> usize {
        self.children.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn root_pid(&self) -> Pid {
        self.root
    }

    /// Whether the calling process is the one that created the pool.
    pub fn is_root(&self) -> bool {
        getpid() == self.root
    }

    /// Register a hook for the end of a run (parent) or of a unit (child).
    pub fn register_exit_hook<F>(&mut self, scope: HookScope, callback: F) -> HookHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.hooks.register(scope, callback)
    }

    pub fn unregister_exit_hook(&mut self, handle: HookHandle) -> bool {
        self.hooks.unregister(handle)
    }

    /// Run `callback` in every child right after fork, before its unit starts.
    pub fn set_post_fork_child<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut() + 'static,
    {
        self.post_fork_child = Some(Box::new(callback));
        self
    }

    /// Run `callback` in the parent after every successful fork.
    pub fn set_post_fork_parent<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(Pid) + 'static,
    {
        self.post_fork_parent = Some(Box::new(callback));
        self
    }

    /// Run every queued unit and return them ordered by child pid.
    ///
    /// Semaphore and channel are removed before this returns, whether the
    /// run succeeded or not.
    pub fn run(&mut self) -> Result<Vec<WorkUnit>> {
        if !self.is_root() {
            return Err(PoolError::InvalidConfig(
                "run() called outside the pool's root process".to_string(),
            ));
        }
        self.finished.clear();
        self.stats = PoolStats::default();

        let outcome = self.run_inner();
        if let Err(e) = &outcome {
            tracing::error!(error = %e, running = self.children.len(), "Pool run stopped");
        }
        self.hooks.run(self.root);
        let cleaned = self.cleanup();

        let results = outcome?;
        cleaned?;
        Ok(results)
    }

    #[instrument(level = "debug", skip(self), fields(workers = self.config.workers, units = self.queue.len()))]
    fn run_inner(&mut self) -> Result<Vec<WorkUnit>> {
        self.config.validate()?;
        self.setup()?;
        let _interrupts = InterruptGuard::install()?;
        let started = Instant::now();

        while let Some(unit) = self.queue.pop_front() {
            self.admit()?;
            self.reap()?;
            self.dispatch(unit)?;
        }

        while !self.children.is_empty() {
            check_interrupt()?;
            self.reap()?;
            if !self.children.is_empty() {
                thread::sleep(self.config.poll_interval);
            }
        }

        let results: Vec<WorkUnit> = std::mem::take(&mut self.finished).into_values().collect();
        tracing::info!(
            units = results.len(),
            failed = self.stats.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pool run finished"
        );
        Ok(results)
    }

    fn setup(&mut self) -> Result<()> {
        let semaphore_key = IpcKey::derive(&self.config.key_seed, SEMAPHORE_PROJECT)?;
        let channel_key = IpcKey::derive(&self.config.key_seed, CHANNEL_PROJECT)?;

        let admission = Semaphore::create(semaphore_key, self.config.workers)?;
        self.admission = Some(admission);
        let channel = Channel::create(channel_key, self.config.max_message_size)?;
        self.receiver = Some(channel.receiver());
        self.channel = Some(channel);

        tracing::debug!(
            semaphore = %semaphore_key,
            channel = %channel_key,
            workers = self.config.workers,
            "Pool resources created"
        );
        Ok(())
    }

    /// Take one permit, reaping while none is free.
    ///
    /// With no child left alive every permit must be free; any still taken
    /// belonged to a child killed between reporting and releasing, and is
    /// returned here.
    fn admit(&mut self) -> Result<()> {
        loop {
            check_interrupt()?;
            let admission = self.admission.as_mut().ok_or(PoolError::NotSetUp)?;
            if admission.try_acquire()? {
                return Ok(());
            }
            if self.children.is_empty() {
                let leaked = admission
                    .capacity()
                    .saturating_sub(admission.available()?);
                if leaked > 0 {
                    tracing::warn!(leaked, "Restoring permits lost by killed children");
                    for _ in 0..leaked {
                        admission.release_for_child()?;
                    }
                    continue;
                }
            }
            self.reap()?;
            thread::sleep(self.config.poll_interval);
        }
    }

    fn dispatch(&mut self, mut unit: WorkUnit) -> Result<()> {
        unit.default_timeout(self.config.timeout);

        let child = match spawn::fork_child() {
            Ok(Forked::Child) => self.become_child(unit),
            Ok(Forked::Parent { child }) => child,
            Err(errno) => {
                if let Some(admission) = self.admission.as_mut()
                    && let Err(e) = admission.release()
                {
                    tracing::warn!(error = %e, "Failed to return permit after fork failure");
                }
                return Err(PoolError::Fork(errno));
            }
        };

        if let Some(admission) = self.admission.as_mut() {
            admission.hand_off();
        }
        if let Some(callback) = self.post_fork_parent.as_mut() {
            callback(child);
        }
        tracing::debug!(pid = %child, unit = unit.name(), id = unit.id(), "Dispatched");
        self.stats.dispatched += 1;
        self.children.insert(
            child.as_raw(),
            Child {
                proc: ChildProc::new(child),
                unit,
                state: ChildState::Running,
                report: None,
                stopped: None,
                attempts: 0,
            },
        );
        Ok(())
    }

    /// Child side of a fork: run the unit and exit.
    fn become_child(&mut self, unit: WorkUnit) -> ! {
        let (Some(channel), Some(admission)) = (self.channel.take(), self.admission.take()) else {
            std::process::exit(EXIT_FATAL)
        };
        let sender = channel.sender().with_compression(self.config.compress);
        let hooks = std::mem::take(&mut self.hooks);
        Lifecycle::new(sender, admission, hooks)
            .with_prelude(self.post_fork_child.take())
            .run(unit)
    }

    /// One pass over all dispatched children.
    fn reap(&mut self) -> Result<()> {
        let pids: Vec<i32> = self.children.keys().copied().collect();
        for pid in pids {
            self.reap_child(pid)?;
        }
        Ok(())
    }

    fn reap_child(&mut self, raw: i32) -> Result<()> {
        let Some(child) = self.children.get_mut(&raw) else {
            return Ok(());
        };
        let pid = child.proc.pid();

        match child.proc.try_wait()? {
            Some(TerminationReason::Stopped(signal)) => {
                if child.state != ChildState::Stopped(signal) {
                    tracing::warn!(
                        %pid,
                        unit = child.unit.name(),
                        "{}",
                        TerminationReason::Stopped(signal).description()
                    );
                    child.state = ChildState::Stopped(signal);
                    child.stopped = Some(signal);
                }
            }
            Some(TerminationReason::Continued) => {
                tracing::trace!(%pid, unit = child.unit.name(), "Continued");
                child.state = ChildState::Running;
            }
            Some(reason) if reason.is_terminal() => child.state = ChildState::Terminated(reason),
            _ => {}
        }

        if child.report.is_none() {
            let receiver = self.receiver.as_mut().ok_or(PoolError::NotSetUp)?;
            match receiver.try_pull(protocol::report_tag(pid)) {
                Ok(Some(value)) => {
                    let report = protocol::from_value(value).map_err(|e| {
                        PoolError::MalformedReport {
                            pid,
                            reason: e.to_string(),
                        }
                    })?;
                    child.report = Some(report);
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(%pid, error = %e, "Transient receive failure");
                }
                Err(ChannelError::Wire(e)) => {
                    return Err(PoolError::MalformedReport {
                        pid,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let ChildState::Terminated(reason) = child.state else {
            return Ok(());
        };
        // A signal death may never have reached the push; anything else must
        // have reported before exiting.
        if child.report.is_none() && !matches!(reason, TerminationReason::Signaled { .. }) {
            child.attempts += 1;
            if child.attempts > self.config.receive_retries {
                return Err(PoolError::ReportLost {
                    pid,
                    attempts: child.attempts,
                    reason: format!("{} without a report", reason),
                });
            }
            tracing::debug!(%pid, attempts = child.attempts, "Report not yet available");
            return Ok(());
        }

        match self.children.remove(&raw) {
            Some(child) => self.finish(child, reason),
            None => Ok(()),
        }
    }

    /// Merge the report and the real wait status, then file the unit.
    fn finish(&mut self, child: Child, reason: TerminationReason) -> Result<()> {
        let Child {
            proc,
            mut unit,
            report,
            stopped,
            ..
        } = child;
        let pid = proc.pid();

        match report {
            Some(report) => {
                if report.pid != Some(pid) {
                    return Err(PoolError::MalformedReport {
                        pid,
                        reason: format!("report names pid {:?}", report.pid),
                    });
                }
                unit.absorb(report)?;
            }
            None => {
                unit.bind_pid(pid)?;
                // It died holding the permit it was handed
                if let Some(admission) = self.admission.as_ref()
                    && let Err(e) = admission.release_for_child()
                {
                    tracing::warn!(%pid, error = %e, "Failed to return permit for child");
                }
            }
        }

        let outcome = unit.outcome_mut();
        match reason {
            TerminationReason::Exited(code) => {
                outcome.exit_code = Some(code);
                if code != 0 && outcome.success {
                    outcome.fail(format!("child exited with status {}", code));
                }
            }
            TerminationReason::Signaled { .. } => {
                tracing::warn!(%pid, unit = %outcome.name, "{}", reason.description());
                outcome.fail(reason.description());
                outcome.exit_code = reason.exit_status();
            }
            _ => {}
        }
        // A stop fails the unit even if it was continued and then exited cleanly
        if let Some(signal) = stopped
            && outcome.success
        {
            outcome.fail(TerminationReason::Stopped(signal).description());
        }

        if let Some(receiver) = self.receiver.as_mut() {
            receiver.discard(protocol::report_tag(pid));
        }
        self.stats.finished += 1;
        if !unit.is_success() {
            self.stats.failed += 1;
        }
        tracing::debug!(
            %pid,
            unit = unit.name(),
            exit_code = unit.exit_code(),
            success = unit.is_success(),
            "Reaped"
        );

        let id = unit.id().unwrap_or_default();
        self.finished.insert((pid.as_raw(), id), unit);
        Ok(())
    }

    fn kill_children(&mut self) {
        for (_, mut child) in std::mem::take(&mut self.children) {
            let pid = child.proc.pid();
            if child.proc.is_reaped() {
                tracing::debug!(%pid, unit = child.unit.name(), "Dropping exited child without a report");
                continue;
            }
            tracing::warn!(%pid, unit = child.unit.name(), "Killing child");
            if let Err(e) = child.proc.kill() {
                tracing::error!(%pid, error = %e, "Failed to kill child");
            }
        }
    }

    /// Kill remaining children and remove the semaphore and channel.
    ///
    /// Only the root process cleans up. Calling this again is a no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        if !self.is_root() {
            return Ok(());
        }
        self.kill_children();
        if !self.queue.is_empty() {
            tracing::warn!(units = self.queue.len(), "Dropping undispatched units");
            self.queue.clear();
        }

        let mut first_error = None;
        if let Some(mut admission) = self.admission.take()
            && let Err(e) = admission.remove()
        {
            tracing::error!(error = %e, "Failed to remove semaphore");
            first_error.get_or_insert(e);
        }
        self.receiver = None;
        if let Some(channel) = self.channel.take() {
            match channel.remove() {
                Ok(()) => {}
                Err(e) if e.is_removed() => {}
                Err(e) => {
                    tracing::error!(error = %e, "Failed to remove channel");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn has_resources(&self) -> bool {
        self.admission.is_some() || self.channel.is_some() || !self.children.is_empty()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.is_root()
            && self.has_resources()
            && let Err(e) = self.cleanup()
        {
            tracing::error!(error = %e, "Pool cleanup on drop failed");
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("root", &self.root)
            .field("queued", &self.queue.len())
            .field("running", &self.children.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn check_interrupt() -> Result<()> {
    match signals::take_interrupt() {
        Some(signal) => Err(PoolError::Interrupted(signal)),
        None => Ok(()),
    }
}
