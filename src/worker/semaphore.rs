//! SysV counting semaphore used as the admission gate.
//!
//! The parent takes one permit before each fork and hands it to the child,
//! which gives it back just before exiting. `SEM_UNDO` is deliberately not
//! used: a permit belongs to the unit of work, not to the process that
//! happened to take it.

use libc::{c_int, c_short};
use nix::errno::Errno;
use tracing::warn;

use super::ipc::{IpcKey, PERMISSIONS};
use crate::error::{PoolError, Result};

/// A single-slot SysV semaphore set with a fixed capacity.
#[derive(Debug)]
pub struct Semaphore {
    id: c_int,
    key: IpcKey,
    capacity: usize,
    held: bool,
}

impl Semaphore {
    /// Create a semaphore for `key` holding `capacity` permits.
    ///
    /// A leftover semaphore under the same key is removed and recreated.
    pub fn create(key: IpcKey, capacity: usize) -> Result<Self> {
        let setup = |source| PoolError::Setup {
            resource: "semaphore",
            source,
        };
        let value = c_int::try_from(capacity).map_err(|_| {
            PoolError::InvalidConfig(format!("semaphore capacity {} is too large", capacity))
        })?;
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | PERMISSIONS;

        // SAFETY: semget has no memory-safety preconditions.
        let id = match Errno::result(unsafe { libc::semget(key.raw(), 1, flags) }) {
            Ok(id) => id,
            Err(Errno::EEXIST) => {
                warn!(%key, "Removing stale semaphore from an earlier run");
                let stale = Errno::result(unsafe { libc::semget(key.raw(), 1, PERMISSIONS) })
                    .map_err(setup)?;
                Errno::result(unsafe { libc::semctl(stale, 0, libc::IPC_RMID) })
                    .map_err(setup)?;
                Errno::result(unsafe { libc::semget(key.raw(), 1, flags) }).map_err(setup)?
            }
            Err(errno) => return Err(setup(errno)),
        };

        // SAFETY: SETVAL takes an int as its variadic argument.
        if let Err(errno) = Errno::result(unsafe { libc::semctl(id, 0, libc::SETVAL, value) }) {
            unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
            return Err(setup(errno));
        }

        Ok(Self {
            id,
            key,
            capacity,
            held: false,
        })
    }

    /// Whether a semaphore currently exists for `key`.
    pub fn exists(key: IpcKey) -> bool {
        // SAFETY: semget without IPC_CREAT only looks the key up.
        unsafe { libc::semget(key.raw(), 0, 0) != -1 }
    }

    pub fn id(&self) -> c_int {
        self.id
    }

    pub fn key(&self) -> IpcKey {
        self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this handle currently holds a permit.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&mut self) -> Result<()> {
        self.op(-1, 0, "acquire")?;
        self.held = true;
        Ok(())
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&mut self) -> Result<bool> {
        match self.op(-1, libc::IPC_NOWAIT as c_short, "acquire") {
            Ok(()) => {
                self.held = true;
                Ok(true)
            }
            Err(PoolError::Semaphore {
                source: Errno::EAGAIN,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Return the held permit. Does nothing if no permit is held.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.op(1, 0, "release")?;
        self.held = false;
        Ok(())
    }

    /// Forget the held permit without returning it; the forked child now
    /// owns it and will release it.
    pub fn hand_off(&mut self) {
        self.held = false;
    }

    /// Return a permit on behalf of a child that died without releasing.
    pub(crate) fn release_for_child(&self) -> Result<()> {
        self.op(1, 0, "release")
    }

    /// Number of permits currently free.
    pub fn available(&self) -> Result<usize> {
        // SAFETY: GETVAL takes no extra argument.
        let value = Errno::result(unsafe { libc::semctl(self.id, 0, libc::GETVAL) }).map_err(
            |source| PoolError::Semaphore {
                op: "read",
                source,
            },
        )?;
        Ok(value as usize)
    }

    /// Destroy the semaphore, first releasing a held permit.
    ///
    /// Removing one that is already gone is not an error.
    pub fn remove(&mut self) -> Result<()> {
        if self.held {
            // The set is about to disappear; a failed release changes nothing.
            let _ = self.release();
            self.held = false;
        }
        // SAFETY: IPC_RMID takes no extra argument.
        match Errno::result(unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) }) {
            Ok(_) | Err(Errno::EINVAL) | Err(Errno::EIDRM) => Ok(()),
            Err(source) => Err(PoolError::Semaphore {
                op: "remove",
                source,
            }),
        }
    }

    /// A second handle on the same kernel semaphore, holding nothing.
    #[cfg(test)]
    pub(crate) fn handle(&self) -> Self {
        Self {
            id: self.id,
            key: self.key,
            capacity: self.capacity,
            held: false,
        }
    }

    fn op(&self, delta: c_short, flags: c_short, name: &'static str) -> Result<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        };
        loop {
            // SAFETY: op is a valid sembuf and we pass a count of one.
            match Errno::result(unsafe { libc::semop(self.id, &mut op, 1) }) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(PoolError::Semaphore { op: name, source }),
            }
        }
    }
}
