//! Parent-side handle to a forked child.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};

/// A forked child the parent still has to reap.
#[derive(Debug)]
pub struct ChildProc {
    pid: Pid,
    /// Set once waitpid has reported a terminal status.
    reaped: bool,
}

impl ChildProc {
    pub fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Poll the child without blocking.
    ///
    /// Returns `None` while it is running. Stops and continues are reported
    /// too; only exits and signal deaths mark the child reaped.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Ok(None);
        }
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let status = loop {
            match waitpid(self.pid, Some(flags)) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(PoolError::Wait {
                        pid: self.pid,
                        source,
                    });
                }
            }
        };
        match analyze_wait_status(status) {
            TerminationReason::StillAlive => Ok(None),
            reason => {
                self.reaped = reason.is_terminal();
                Ok(Some(reason))
            }
        }
    }

    /// Block until the child terminates.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    let reason = analyze_wait_status(status);
                    if reason.is_terminal() {
                        self.reaped = true;
                        return Ok(reason);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(PoolError::Wait {
                        pid: self.pid,
                        source,
                    });
                }
            }
        }
    }

    /// Send SIGKILL and wait for the child to die.
    ///
    /// A child that already exited is not an error.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => {
                return Err(PoolError::Wait {
                    pid: self.pid,
                    source,
                });
            }
        }
        match self.wait() {
            Ok(_) => Ok(()),
            // Someone else reaped it
            Err(PoolError::Wait {
                source: Errno::ECHILD,
                ..
            }) => {
                self.reaped = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn spawn(cmd: &str) -> ChildProc {
        let child = Command::new("sh").arg("-c").arg(cmd).spawn().unwrap();
        ChildProc::new(Pid::from_raw(child.id() as i32))
    }

    fn poll_until_done(proc: &mut ChildProc) -> TerminationReason {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(reason) = proc.try_wait().unwrap()
                && reason.is_terminal()
            {
                return reason;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("child did not finish in time");
    }

    #[test]
    fn test_try_wait_reports_exit_code() {
        let mut proc = spawn("exit 3");
        assert_eq!(poll_until_done(&mut proc), TerminationReason::Exited(3));
        assert!(proc.is_reaped());
        assert_eq!(proc.try_wait().unwrap(), None);
    }

    #[test]
    fn test_kill_running_child() {
        let mut proc = spawn("sleep 30");
        assert_eq!(proc.try_wait().unwrap(), None);
        proc.kill().unwrap();
        assert!(proc.is_reaped());
        // Killing again is a no-op
        proc.kill().unwrap();
    }

    #[test]
    fn test_stop_is_reported_without_reaping() {
        let mut proc = spawn("sleep 30");
        signal::kill(proc.pid(), Signal::SIGSTOP).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = None;
        while seen.is_none() && Instant::now() < deadline {
            seen = proc.try_wait().unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen, Some(TerminationReason::Stopped(Signal::SIGSTOP)));
        assert!(!proc.is_reaped());

        proc.kill().unwrap();
        assert!(proc.is_reaped());
    }
}
