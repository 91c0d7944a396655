// SPDX-License-Identifier: MPL-2.0

//! What the interrupt core expects from the OS scheduler.
//!
//! Deferred workers are ordinary kernel threads. The core only needs to
//! create them at an elevated priority, park and wake them, pin them to the
//! affinity of their line and join them when a handler is removed.

use crate::prelude::*;

/// The real-time priority of deferred workers.
pub const IRQ_THREAD_PRIORITY: u8 = 50;

/// The scheduling class of a spawned thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    /// First-in-first-out real-time scheduling at the given priority.
    Fifo {
        /// Higher values run first.
        priority: u8,
    },
    /// The general-purpose class.
    Normal,
}

/// The entry point of a spawned thread.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// The OS scheduler collaborator.
pub trait Scheduler: Send + Sync {
    /// Spawns a new thread that runs `entry` under `policy`.
    ///
    /// The thread must be runnable right away. `name` is for diagnostics only.
    fn spawn(&self, name: String, policy: SchedPolicy, entry: ThreadEntry)
    -> Result<Box<dyn ThreadHandle>>;

    /// Blocks the current thread unless `has_woken()` returns `true`.
    ///
    /// A wake-up delivered by [`ThreadHandle::unpark`] between the check and
    /// the actual blocking must not be lost. Note that this method may return
    /// due to spurious wake events. It's the caller's responsibility to detect
    /// them.
    fn park_current(&self, has_woken: &dyn Fn() -> bool);

    /// Yields the current CPU to other runnable threads.
    fn yield_now(&self);

    /// Restricts the current thread to run on `cpus`.
    fn set_current_affinity(&self, cpus: &CpuSet);
}

/// A handle to a thread created by [`Scheduler::spawn`].
pub trait ThreadHandle: Send + Sync {
    /// Wakes up the thread if it is parked in [`Scheduler::park_current`].
    fn unpark(&self);

    /// Waits for the thread to exit.
    ///
    /// Calling it more than once returns immediately.
    fn join(&self);
}
