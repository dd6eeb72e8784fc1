//! Exit hooks that run when a process leaves the pool.
//!
//! A hook is either scoped to the process that registered it or global.
//! Process-scoped hooks run once and detach; global hooks run in every
//! process's exit path, including each forked child, and stay registered.

use std::panic::{self, AssertUnwindSafe};

use nix::unistd::{Pid, getpid};
use tracing::warn;

/// Where a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
    /// Only in the process that registered it.
    Process,
    /// In every process, parent and children alike.
    Global,
}

/// Identifies a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

struct Entry {
    handle: HookHandle,
    /// `None` for global hooks.
    owner: Option<Pid>,
    callback: Box<dyn FnMut() + Send>,
}

/// Insertion-ordered registry of exit hooks.
#[derive(Default)]
pub struct ExitHooks {
    entries: Vec<Entry>,
    next: u64,
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook owned by the calling process.
    pub fn register<F>(&mut self, scope: HookScope, callback: F) -> HookHandle
    where
        F: FnMut() + Send + 'static,
    {
        let owner = match scope {
            HookScope::Process => Some(getpid()),
            HookScope::Global => None,
        };
        self.insert(owner, Box::new(callback))
    }

    fn insert(&mut self, owner: Option<Pid>, callback: Box<dyn FnMut() + Send>) -> HookHandle {
        let handle = HookHandle(self.next);
        self.next += 1;
        self.entries.push(Entry {
            handle,
            owner,
            callback,
        });
        handle
    }

    pub fn unregister(&mut self, handle: HookHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.handle != handle);
        self.entries.len() != before
    }

    /// Drop process-scoped hooks that belong to any pid other than `pid`.
    ///
    /// Called in a freshly forked child, which inherits the parent's table.
    pub fn clear_foreign(&mut self, pid: Pid) {
        self.entries
            .retain(|e| e.owner.is_none() || e.owner == Some(pid));
    }

    /// Run every hook that applies to `pid`, in registration order.
    ///
    /// A panicking hook is logged and does not stop the rest. Process-scoped
    /// hooks are detached afterwards.
    pub fn run(&mut self, pid: Pid) {
        for entry in &mut self.entries {
            if entry.owner.is_some_and(|owner| owner != pid) {
                continue;
            }
            let callback = &mut entry.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                warn!(%pid, hook = entry.handle.0, "Exit hook panicked");
            }
        }
        self.entries.retain(|e| e.owner.is_none_or(|owner| owner != pid));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ExitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitHooks")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnMut() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> Box<dyn FnMut() + Send> {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_process_hooks_detach_global_hooks_stay() {
        let (log, make) = recorder();
        let mut hooks = ExitHooks::new();
        hooks.register(HookScope::Global, make("global"));
        hooks.register(HookScope::Process, make("local"));

        let me = getpid();
        hooks.run(me);
        hooks.run(me);

        assert_eq!(*log.lock().unwrap(), ["global", "local", "global"]);
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_clear_foreign_keeps_global_and_own() {
        let (log, make) = recorder();
        let mut hooks = ExitHooks::new();
        hooks.insert(Some(Pid::from_raw(1)), make("parent"));
        hooks.insert(None, make("global"));
        hooks.insert(Some(Pid::from_raw(2)), make("child"));

        hooks.clear_foreign(Pid::from_raw(2));
        assert_eq!(hooks.len(), 2);

        hooks.run(Pid::from_raw(2));
        assert_eq!(*log.lock().unwrap(), ["global", "child"]);
    }

    #[test]
    fn test_other_process_hooks_are_skipped() {
        let (log, make) = recorder();
        let mut hooks = ExitHooks::new();
        hooks.insert(Some(Pid::from_raw(1)), make("parent"));

        hooks.run(Pid::from_raw(2));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_panicking_hook_does_not_stop_others() {
        let (log, make) = recorder();
        let mut hooks = ExitHooks::new();
        hooks.register(HookScope::Global, || panic!("hook failure"));
        hooks.register(HookScope::Global, make("after"));

        hooks.run(getpid());
        assert_eq!(*log.lock().unwrap(), ["after"]);
    }

    #[test]
    fn test_unregister() {
        let mut hooks = ExitHooks::new();
        let handle = hooks.register(HookScope::Global, || {});
        assert!(hooks.unregister(handle));
        assert!(!hooks.unregister(handle));
        assert!(hooks.is_empty());
    }
}
