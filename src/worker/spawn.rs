//! Forking children for units of work.
//!
//! Children are plain `fork()` copies of the parent: the job object, the
//! semaphore handle and the channel handle are already in the child's memory,
//! so nothing has to be serialized on the way in.

use nix::errno::Errno;
use nix::unistd::{ForkResult, Pid, fork};

use super::signals;

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent { child: Pid },
    Child,
}

/// Fork the current process.
///
/// In the child, interrupt signals are ignored before this returns so the
/// root alone reacts to Ctrl-C.
pub fn fork_child() -> Result<Forked, Errno> {
    // SAFETY: the child only runs the unit lifecycle and then exits through
    // `std::process::exit`; it never returns into the scheduler loop.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(Forked::Parent { child }),
        ForkResult::Child => {
            signals::ignore_interrupts();
            Ok(Forked::Child)
        }
    }
}

/// Name of the thread a child runs its job on.
pub const JOB_THREAD_NAME: &str = "forkpool-job";

/// Spawn the thread that executes a job inside a child.
pub fn spawn_job_thread<F>(f: F) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(JOB_THREAD_NAME.to_string())
        .spawn(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_thread_is_named() {
        let handle = spawn_job_thread(|| {
            assert_eq!(std::thread::current().name(), Some(JOB_THREAD_NAME));
        })
        .unwrap();
        handle.join().unwrap();
    }
}
