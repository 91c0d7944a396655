// SPDX-License-Identifier: MPL-2.0

//! CPU identities and the per-CPU operations the interrupt core relies on.

mod set;

use core::ops::{Deref, DerefMut};

pub use set::CpuSet;

/// The ID of a CPU in the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a CPU ID from its raw number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw number.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the raw number as a `usize`.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<CpuId> for u32 {
    fn from(cpu_id: CpuId) -> Self {
        cpu_id.0
    }
}

/// The CPU-local operations that the interrupt core consumes from the platform.
///
/// The methods are invoked from both hard-interrupt context and task context,
/// so implementations must never block.
pub trait CpuOps: Send + Sync {
    /// Returns the ID of the CPU that executes the call.
    fn current_cpu(&self) -> CpuId;

    /// Returns the set of CPUs that are currently online.
    fn online_cpus(&self) -> CpuSet;

    /// Returns whether IRQs are enabled on the current CPU.
    fn is_local_irq_enabled(&self) -> bool;

    /// Disables IRQs on the current CPU.
    fn disable_local_irq(&self);

    /// Enables IRQs on the current CPU.
    fn enable_local_irq(&self);
}

/// Disables all IRQs on the current CPU (i.e., locally).
///
/// This function returns a guard object, which will automatically enable local IRQs again when
/// it is dropped. This function works correctly even when it is called in a _nested_ way.
/// The local IRQs shall only be re-enabled when the most outer guard is dropped.
pub fn disable_local(cpu: &dyn CpuOps) -> DisabledLocalIrqGuard<'_> {
    DisabledLocalIrqGuard::new(cpu)
}

/// A guard for disabled local IRQs.
#[clippy::has_significant_drop]
#[must_use]
pub struct DisabledLocalIrqGuard<'a> {
    cpu: &'a dyn CpuOps,
    was_enabled: bool,
}

impl<'a> DisabledLocalIrqGuard<'a> {
    fn new(cpu: &'a dyn CpuOps) -> Self {
        let was_enabled = cpu.is_local_irq_enabled();
        if was_enabled {
            cpu.disable_local_irq();
        }
        Self { cpu, was_enabled }
    }
}

impl Drop for DisabledLocalIrqGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.cpu.enable_local_irq();
        }
    }
}

/// Acquires a spin lock with local IRQs disabled.
///
/// The lock is released before local IRQs are restored.
pub(crate) fn lock_irq_disabled<'a, T>(
    lock: &'a spin::Mutex<T>,
    cpu: &'a dyn CpuOps,
) -> SpinIrqGuard<'a, T> {
    let irq_guard = disable_local(cpu);
    SpinIrqGuard {
        guard: lock.lock(),
        _irq_guard: irq_guard,
    }
}

/// The guard returned by [`lock_irq_disabled`].
#[clippy::has_significant_drop]
#[must_use]
pub(crate) struct SpinIrqGuard<'a, T> {
    // Declared first so that it is dropped first.
    guard: spin::MutexGuard<'a, T>,
    _irq_guard: DisabledLocalIrqGuard<'a>,
}

impl<T> Deref for SpinIrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
