//! Child-side lifecycle of one unit of work.
//!
//! ```text
//! Starting ──► Running ──┬──► Completed   exit 0
//!                        ├──► Failed      exit from WorkError (1..=254)
//!                        ├──► TimedOut    exit 255
//!                        └──► Crashed     exit 255
//!                                 │
//!                                 ▼
//!        Finishing: push report ─► release permit ─► exit hooks ─► exit
//! ```
//!
//! The job runs on its own thread so the controller can enforce the timeout
//! with a channel deadline and notice panics as a dropped sender. Finishing
//! lives in a drop guard, so even a panic in the controller itself still
//! sends a report and gives the permit back. While the job runs, the
//! finalizer is parked where an `atexit` handler can reach it, so a job
//! that calls `exit()` is reported as crashed instead of vanishing.

use std::any::Any;
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::unistd::{Pid, getpid};
use tracing::{debug, error, trace, warn};

use super::hooks::ExitHooks;
use super::ipc::Sender;
use super::protocol;
use super::semaphore::Semaphore;
use super::spawn;
use crate::error::Result;
use crate::memory::{self, MemorySize};
use crate::wire::Value;
use crate::work::{Work, WorkError, WorkUnit};

/// Exit status of a child whose unit completed.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status of a child that hit a fatal condition.
pub const EXIT_FATAL: i32 = 255;

/// An error the unit's own code could not recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    message: String,
    location: Option<(String, u32)>,
}

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.location = Some((file.into(), line));
        self
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(format!(
            "timeout exceeded: {} second(s)",
            limit.as_secs_f64()
        ))
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some((file, line)) => write!(
                f,
                "Fatal error: {} on line {} in file {}",
                self.message, line, file
            ),
            None => write!(f, "Fatal error: {}", self.message),
        }
    }
}

/// How the running phase ended.
#[derive(Debug)]
enum Termination {
    Completed(Value),
    Failed(WorkError),
    TimedOut(Duration),
    Crashed(FatalError),
}

type FatalSlot = Arc<Mutex<Option<FatalError>>>;

fn take_fatal(slot: &FatalSlot) -> Option<FatalError> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Record the first panic in this process (message plus location), then
/// defer to the previously installed hook.
fn capture_panics() -> FatalSlot {
    let slot = FatalSlot::default();
    let sink = Arc::clone(&slot);
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let mut fatal = FatalError::new(panic_message(info.payload()));
        if let Some(location) = info.location() {
            fatal = fatal.at(location.file(), location.line());
        }
        error!(pid = %getpid(), %fatal, "Unit panicked");
        if let Ok(mut guard) = sink.lock() {
            guard.get_or_insert(fatal);
        }
        previous(info);
    }));
    slot
}

/// Runs one unit inside a freshly forked child.
pub(crate) struct Lifecycle {
    sender: Sender,
    admission: Semaphore,
    hooks: ExitHooks,
    prelude: Option<Box<dyn FnMut()>>,
}

impl Lifecycle {
    /// `admission` must hold the permit taken for this unit.
    pub(crate) fn new(sender: Sender, admission: Semaphore, hooks: ExitHooks) -> Self {
        Self {
            sender,
            admission,
            hooks,
            prelude: None,
        }
    }

    /// Callback to run after the pid is bound and before the job starts.
    pub(crate) fn with_prelude(mut self, prelude: Option<Box<dyn FnMut()>>) -> Self {
        self.prelude = prelude;
        self
    }

    /// Run the unit and exit the process. Never returns.
    pub(crate) fn run(self, unit: WorkUnit) -> ! {
        let status =
            panic::catch_unwind(AssertUnwindSafe(move || self.drive(unit))).unwrap_or(EXIT_FATAL);
        std::process::exit(status)
    }

    fn drive(self, mut unit: WorkUnit) -> i32 {
        let pid = getpid();
        let fatal = capture_panics();
        let job = unit.take_job();
        let timeout = unit.timeout();

        let Lifecycle {
            sender,
            admission,
            mut hooks,
            prelude,
        } = self;
        hooks.clear_foreign(pid);

        let mut finalizer = Finalizer {
            pid,
            unit: Some(unit),
            sender,
            admission,
            hooks,
            started: Instant::now(),
            fatal: Arc::clone(&fatal),
        };

        if let Err(e) = finalizer.start() {
            return finalizer.finish(Termination::Crashed(FatalError::new(e.to_string())));
        }
        arm(finalizer);
        // SAFETY: the handler only takes the armed finalizer and exits.
        if unsafe { libc::atexit(finish_on_exit) } != 0 {
            warn!(%pid, "Could not register exit handler; exit() in the job will lose the report");
        }
        if let Some(mut prelude) = prelude {
            prelude();
        }

        let termination = match job {
            Some(job) => execute(job, timeout, &fatal),
            None => Termination::Crashed(FatalError::new("unit has no job to run")),
        };
        match disarm() {
            Some(mut finalizer) => finalizer.finish(termination),
            // Another thread is inside exit() and already reporting
            None => loop {
                std::thread::park();
            },
        }
    }
}

/// The finalizer of the unit running in this process, while its job runs.
static ARMED: Mutex<Option<Finalizer>> = Mutex::new(None);

fn arm(finalizer: Finalizer) {
    let mut slot = ARMED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(finalizer);
}

fn disarm() -> Option<Finalizer> {
    ARMED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

/// Finish the armed unit as crashed. Returns its exit status, or `None` if
/// nothing was armed.
fn finish_armed() -> Option<i32> {
    let mut finalizer = disarm()?;
    let fatal = take_fatal(&finalizer.fatal)
        .unwrap_or_else(|| FatalError::new("unit exited the process before reporting"));
    Some(finalizer.finish(Termination::Crashed(fatal)))
}

/// `atexit` handler for jobs that call `exit()` themselves.
extern "C" fn finish_on_exit() {
    if let Some(status) = finish_armed() {
        let _ = std::io::stdout().flush();
        // SAFETY: _exit skips the remaining handlers, which have nothing left to do.
        unsafe { libc::_exit(status) };
    }
}

/// Run `job` on its own thread and wait for it, up to `timeout`.
fn execute(mut job: Box<dyn Work>, timeout: Option<Duration>, fatal: &FatalSlot) -> Termination {
    let (tx, rx) = mpsc::channel();
    let spawned = spawn::spawn_job_thread(move || {
        // The receiver is gone only if the controller already gave up
        let _ = tx.send(job.execute());
    });
    if let Err(e) = spawned {
        return Termination::Crashed(FatalError::new(format!(
            "failed to start job thread: {}",
            e
        )));
    }

    let received = match timeout {
        Some(limit) => rx.recv_timeout(limit),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(Ok(value)) => Termination::Completed(value),
        Ok(Err(err)) => Termination::Failed(err),
        Err(RecvTimeoutError::Timeout) => Termination::TimedOut(timeout.unwrap_or_default()),
        Err(RecvTimeoutError::Disconnected) => Termination::Crashed(
            take_fatal(fatal)
                .unwrap_or_else(|| FatalError::new("job thread ended without a result")),
        ),
    }
}

/// Reports the unit exactly once: from `finish`, or from `drop` if the
/// controller unwinds before getting there.
struct Finalizer {
    pid: Pid,
    unit: Option<WorkUnit>,
    sender: Sender,
    admission: Semaphore,
    hooks: ExitHooks,
    started: Instant,
    fatal: FatalSlot,
}

impl Finalizer {
    fn start(&mut self) -> Result<()> {
        let Some(unit) = self.unit.as_mut() else {
            return Ok(());
        };
        unit.bind_pid(self.pid)?;
        unit.outcome_mut().started_at = Some(Utc::now());
        trace!(pid = %self.pid, unit = unit.name(), "Starting: {}", unit.name());
        Ok(())
    }

    /// Seal the envelope, push it, release the permit and run exit hooks.
    /// Returns the exit status for the process.
    fn finish(&mut self, termination: Termination) -> i32 {
        let Some(mut unit) = self.unit.take() else {
            return EXIT_FATAL;
        };
        let outcome = unit.outcome_mut();
        outcome.duration = self.started.elapsed();
        outcome.memory_usage = memory::peak_rss().as_bytes();

        let mut status = EXIT_SUCCESS;
        let fatal = match termination {
            Termination::Completed(value) => {
                outcome.result = value;
                None
            }
            Termination::Failed(err) => {
                outcome.fail(err.message());
                status = err.exit_status();
                None
            }
            Termination::TimedOut(limit) => Some(FatalError::timeout(limit)),
            Termination::Crashed(fatal) => Some(fatal),
        }
        .or_else(|| take_fatal(&self.fatal));

        if let Some(fatal) = fatal {
            outcome.fail(fatal.to_string());
            status = EXIT_FATAL;
        }
        outcome.exit_code = Some(status);

        debug!(
            pid = %self.pid,
            unit = %outcome.name,
            exit_code = status,
            success = outcome.success,
            "Finished: {} ({}/{:.3} s)",
            outcome.name,
            MemorySize::from_bytes(outcome.memory_usage),
            outcome.duration.as_secs_f64()
        );

        let report = protocol::to_value(outcome);
        if let Err(e) = self.sender.push(protocol::report_tag(self.pid), &report) {
            error!(pid = %self.pid, error = %e, "Failed to push report");
            status = EXIT_FATAL;
        }
        if let Err(e) = self.admission.release() {
            error!(pid = %self.pid, error = %e, "Failed to release admission permit");
        }
        self.hooks.run(self.pid);
        status
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if self.unit.is_some() {
            let fatal = take_fatal(&self.fatal)
                .unwrap_or_else(|| FatalError::new("unit lifecycle aborted before reporting"));
            self.finish(Termination::Crashed(fatal));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
    use crate::worker::ipc::{Channel, IpcKey};
    use crate::worker::HookScope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _seed: tempfile::NamedTempFile,
        channel: Channel,
        admission: Semaphore,
    }

    impl Fixture {
        fn new() -> Self {
            let seed = tempfile::NamedTempFile::new().unwrap();
            let channel = Channel::create(
                IpcKey::derive(seed.path(), b'm').unwrap(),
                DEFAULT_MAX_MESSAGE_SIZE,
            )
            .unwrap();
            let admission =
                Semaphore::create(IpcKey::derive(seed.path(), b's').unwrap(), 1).unwrap();
            Self {
                _seed: seed,
                channel,
                admission,
            }
        }

        fn finalizer(&self, unit: WorkUnit, hooks: ExitHooks) -> Finalizer {
            let mut permit = self.admission.handle();
            permit.acquire().unwrap();
            Finalizer {
                pid: getpid(),
                unit: Some(unit),
                sender: self.channel.sender(),
                admission: permit,
                hooks,
                started: Instant::now(),
                fatal: FatalSlot::default(),
            }
        }

        fn report(&self) -> crate::work::Outcome {
            let value = self
                .channel
                .receiver()
                .try_pull(protocol::report_tag(getpid()))
                .unwrap()
                .expect("report was pushed");
            protocol::from_value(value).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.admission.remove();
            let _ = self.channel.remove();
        }
    }

    fn unit(body: impl FnMut() -> std::result::Result<Value, WorkError> + Send + 'static) -> WorkUnit {
        WorkUnit::from_fn("test-unit", body)
    }

    #[test]
    fn test_fatal_error_format() {
        let fatal = FatalError::new("boom").at("src/job.rs", 12);
        assert_eq!(
            fatal.to_string(),
            "Fatal error: boom on line 12 in file src/job.rs"
        );
        assert_eq!(
            FatalError::timeout(Duration::from_millis(1500)).to_string(),
            "Fatal error: timeout exceeded: 1.5 second(s)"
        );
    }

    #[test]
    fn test_execute_outcomes() {
        let slot = FatalSlot::default();

        let done = execute(Box::new(crate::work::FnWork::new("ok", || Ok(Value::Int(1)))), None, &slot);
        assert!(matches!(done, Termination::Completed(Value::Int(1))));

        let failed = execute(
            Box::new(crate::work::FnWork::new("err", || {
                Err(WorkError::new("bad input").with_code(4))
            })),
            Some(Duration::from_secs(5)),
            &slot,
        );
        assert!(matches!(failed, Termination::Failed(ref e) if e.exit_status() == 4));
    }

    #[test]
    fn test_execute_times_out() {
        let slot = FatalSlot::default();
        let slow = crate::work::FnWork::new("slow", || {
            std::thread::sleep(Duration::from_secs(2));
            Ok(Value::Null)
        });
        let started = Instant::now();
        let result = execute(Box::new(slow), Some(Duration::from_millis(50)), &slot);
        assert!(matches!(result, Termination::TimedOut(d) if d == Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_execute_notices_panics() {
        let slot = FatalSlot::default();
        let job = crate::work::FnWork::new("panics", || -> std::result::Result<Value, WorkError> {
            panic!("job exploded")
        });
        match execute(Box::new(job), None, &slot) {
            Termination::Crashed(fatal) => assert!(fatal.to_string().starts_with("Fatal error:")),
            other => panic!("expected a crash, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_reports_and_releases() {
        let fixture = Fixture::new();
        let mut finalizer = fixture.finalizer(unit(|| Ok(Value::Null)), ExitHooks::new());
        finalizer.start().unwrap();
        assert_eq!(fixture.admission.available().unwrap(), 0);

        let status = finalizer.finish(Termination::Completed(Value::from("done")));
        assert_eq!(status, EXIT_SUCCESS);
        assert_eq!(fixture.admission.available().unwrap(), 1);

        let report = fixture.report();
        assert!(report.success);
        assert_eq!(report.pid, Some(getpid()));
        assert_eq!(report.result, Value::from("done"));
        assert_eq!(report.exit_code, Some(0));
        assert!(report.started_at.is_some());
        assert!(report.memory_usage > 0);
    }

    #[test]
    fn test_finish_failed_unit() {
        let fixture = Fixture::new();
        let mut finalizer = fixture.finalizer(unit(|| Ok(Value::Null)), ExitHooks::new());
        let status = finalizer.finish(Termination::Failed(
            WorkError::new("no such record").with_code(3),
        ));
        assert_eq!(status, 3);

        let report = fixture.report();
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("no such record"));
        assert_eq!(report.exit_code, Some(3));
    }

    #[test]
    fn test_pending_fatal_overrides_result() {
        let fixture = Fixture::new();
        let mut finalizer = fixture.finalizer(unit(|| Ok(Value::Null)), ExitHooks::new());
        *finalizer.fatal.lock().unwrap() = Some(FatalError::new("late crash").at("a.rs", 1));

        let status = finalizer.finish(Termination::Completed(Value::Int(1)));
        assert_eq!(status, EXIT_FATAL);

        let report = fixture.report();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(EXIT_FATAL));
        assert!(report.error.unwrap().contains("on line 1 in file a.rs"));
    }

    #[test]
    fn test_timeout_is_reported_as_fatal() {
        let fixture = Fixture::new();
        let mut finalizer = fixture.finalizer(unit(|| Ok(Value::Null)), ExitHooks::new());
        let status = finalizer.finish(Termination::TimedOut(Duration::from_secs(2)));
        assert_eq!(status, EXIT_FATAL);
        assert!(fixture.report().error.unwrap().contains("timeout exceeded: 2 second(s)"));
    }

    #[test]
    fn test_drop_without_finish_still_reports() {
        let fixture = Fixture::new();
        let finalizer = fixture.finalizer(unit(|| Ok(Value::Null)), ExitHooks::new());
        drop(finalizer);

        let report = fixture.report();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(EXIT_FATAL));
        assert_eq!(fixture.admission.available().unwrap(), 1);
    }

    #[test]
    fn test_armed_finalizer_reports_on_exit() {
        let fixture = Fixture::new();
        arm(fixture.finalizer(unit(|| Ok(Value::Null)), ExitHooks::new()));
        assert_eq!(fixture.admission.available().unwrap(), 0);

        assert_eq!(finish_armed(), Some(EXIT_FATAL));
        assert_eq!(fixture.admission.available().unwrap(), 1);
        let report = fixture.report();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(EXIT_FATAL));
        assert!(report.error.unwrap().contains("exited the process before reporting"));

        // Nothing left for a second exit path
        assert_eq!(finish_armed(), None);
    }

    #[test]
    fn test_exit_hooks_run_once() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = ExitHooks::new();
        let counter = Arc::clone(&calls);
        hooks.register(HookScope::Process, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut finalizer = fixture.finalizer(unit(|| Ok(Value::Null)), hooks);
        finalizer.finish(Termination::Completed(Value::Null));
        // A second finish is a no-op
        assert_eq!(finalizer.finish(Termination::Completed(Value::Null)), EXIT_FATAL);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let _ = fixture.report();
    }
}
