//! Process pool: forked children coordinated over SysV IPC.
//!
//! Each unit of work runs in its own forked child. The parent and its
//! children share exactly two kernel objects, both derived from one key
//! seed: a counting semaphore that bounds how many children run at once,
//! and a message queue on which every child pushes one report tagged with
//! its own pid.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────┐
//!                  │     Root process     │
//!                  │  Pool (scheduler)    │
//!                  └──┬───────────────▲───┘
//!     acquire permit, │               │ try_pull(tag = child pid)
//!               fork  │               │ waitpid(WNOHANG)
//!        ┌────────────┼───────────┐   │
//!        │            │           │   │
//!  ┌─────▼─────┐ ┌────▼──────┐ ┌──▼───┴────┐
//!  │  Child 1  │ │  Child 2  │ │  Child N  │   Lifecycle: run job,
//!  │ Lifecycle │ │ Lifecycle │ │ Lifecycle │   push report, release
//!  └─────┬─────┘ └────┬──────┘ └─────┬─────┘   permit, exit hooks
//!        └────────────┴──────────────┘
//!               SysV message queue
//! ```
//!
//! # Features
//!
//! - **Bounded admission**: at most `workers` units execute at once
//! - **Crash containment**: panics, timeouts and signal deaths fail only
//!   their own unit
//! - **Guaranteed report**: a child always reports before it exits, or the
//!   parent synthesizes the result from the wait status
//! - **Deterministic output**: results come back ordered by child pid

mod hooks;
mod ipc;
mod lifecycle;
mod pool;
mod proc;
mod protocol;
mod semaphore;
mod signals;
mod spawn;

pub use hooks::{ExitHooks, HookHandle, HookScope};
pub use ipc::{Channel, ChannelError, ChannelStatus, IpcKey, Receiver, Sender};
pub use lifecycle::{EXIT_FATAL, EXIT_SUCCESS, FatalError};
pub use pool::{CHANNEL_PROJECT, Pool, PoolStats, SEMAPHORE_PROJECT};
pub use semaphore::Semaphore;
pub use signals::{TerminationReason, signal_exit_status};
