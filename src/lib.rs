//! forkpool - run units of work in parallel forked processes.
//!
//! ```no_run
//! use forkpool::{Pool, PoolConfig, Value, WorkUnit};
//!
//! let mut pool = Pool::new(PoolConfig::default().with_workers(2));
//! for n in 0..5 {
//!     pool.submit(WorkUnit::from_fn(format!("square-{}", n), move || {
//!         Ok(Value::Int(n * n))
//!     }))?;
//! }
//! for unit in pool.run()? {
//!     println!("{} -> {:?}", unit.name(), unit.result());
//! }
//! # Ok::<(), forkpool::PoolError>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod wire;
pub mod work;
pub mod worker;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use wire::{Closure, ClosureRegistry, Value, WireError};
pub use work::{ClosureWork, FnWork, Outcome, Work, WorkError, WorkUnit};
pub use worker::{
    Channel, ChannelError, ExitHooks, HookHandle, HookScope, IpcKey, Pool, PoolStats, Semaphore,
    TerminationReason,
};
