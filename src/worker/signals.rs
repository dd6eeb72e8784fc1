//! Child termination analysis and interrupt handling for the root process.

use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::WaitStatus;

use crate::error::{PoolError, Result};

/// Signals that interrupt a run when delivered to the root process.
pub const INTERRUPT_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGQUIT];

/// What `waitpid` reported about a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled { signal: Signal, core_dumped: bool },
    /// Stopped by a signal; the process still exists.
    Stopped(Signal),
    /// Resumed after a stop.
    Continued,
    /// Process is still running.
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// The process is gone and can no longer be waited for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled { .. })
    }

    /// The exit status a shell would report: the code itself, or
    /// `128 + signal` for a signal death.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled { signal, .. } => Some(signal_exit_status(*signal)),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled {
                signal,
                core_dumped: true,
            } => format!("Signal: {} caused this child to exit (core dumped)", signal),
            Self::Signaled { signal, .. } => {
                format!("Signal: {} caused this child to exit", signal)
            }
            Self::Stopped(signal) => format!("Signal: {} caused this child to stop.", signal),
            Self::Continued => "continued".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Exit status conventionally reported for a death by `signal`.
pub fn signal_exit_status(signal: Signal) -> i32 {
    128 + signal as i32
}

/// Map a `WaitStatus` onto a [`TerminationReason`].
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, core_dumped) => TerminationReason::Signaled {
            signal,
            core_dumped,
        },
        WaitStatus::Stopped(_, signal) => TerminationReason::Stopped(signal),
        WaitStatus::Continued(_) => TerminationReason::Continued,
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Last interrupt signal delivered, or 0.
static PENDING_INTERRUPT: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_interrupt(signal: c_int) {
    PENDING_INTERRUPT.store(signal, Ordering::SeqCst);
}

/// Take the pending interrupt, if any.
pub fn take_interrupt() -> Option<Signal> {
    match PENDING_INTERRUPT.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

/// Routes SIGINT/SIGQUIT into [`take_interrupt`] while alive and restores
/// the previous dispositions on drop.
pub struct InterruptGuard {
    previous: Vec<(Signal, SigAction)>,
}

impl InterruptGuard {
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(record_interrupt),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut guard = Self {
            previous: Vec::with_capacity(INTERRUPT_SIGNALS.len()),
        };
        for signal in INTERRUPT_SIGNALS {
            // SAFETY: the handler only performs an atomic store.
            let previous =
                unsafe { sigaction(signal, &action) }.map_err(PoolError::SignalHandler)?;
            guard.previous.push((signal, previous));
        }
        Ok(guard)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: restoring a disposition that was installed before.
            let _ = unsafe { sigaction(signal, &previous) };
        }
    }
}

/// Make a forked child deaf to interrupts so only the root decides how a
/// run ends, and drop any interrupt recorded before the fork.
pub fn ignore_interrupts() {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for signal in INTERRUPT_SIGNALS {
        // SAFETY: SIG_IGN installs no handler code.
        let _ = unsafe { sigaction(signal, &ignore) };
    }
    PENDING_INTERRUPT.store(0, Ordering::SeqCst);
}
