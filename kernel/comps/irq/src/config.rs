// SPDX-License-Identifier: MPL-2.0

//! Boot-time configuration of the interrupt core.
//!
//! The format of the command line follows the Linux kernel command line rules:
//!
//! <https://www.kernel.org/doc/html/v6.4/admin-guide/kernel-parameters.html>

use crate::prelude::*;

/// The default number of consecutive unhandled occurrences after which a
/// line is considered to be screaming and gets disabled.
pub const DEFAULT_SPURIOUS_THRESHOLD: u32 = 100_000;

/// The configuration of an [`IrqManager`].
///
/// [`IrqManager`]: crate::IrqManager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrqConfig {
    /// Runs every handler in a worker, even the ones requested for hard context.
    pub force_threads: bool,
    /// Whether the kernel is fully preemptible.
    ///
    /// If not, forced-thread handlers run with local IRQs disabled so that a
    /// chip sees the same behavior as with a genuine hard-context handler.
    pub preempt_rt: bool,
    /// Consecutive unhandled occurrences before a line is disabled.
    pub spurious_threshold: u32,
    /// The process-wide default affinity. `None` means all online CPUs.
    pub default_affinity: Option<CpuSet>,
    /// CPUs that managed lines should stay away from.
    pub managed_isolated: Option<CpuSet>,
    /// Busy-poll iterations before a synchronizing waiter starts yielding.
    pub sync_spin_limit: u32,
    /// Yields after which a synchronizing waiter logs a stall warning once.
    pub sync_stall_warn: Option<u64>,
}

impl Default for IrqConfig {
    fn default() -> Self {
        Self {
            force_threads: false,
            preempt_rt: false,
            spurious_threshold: DEFAULT_SPURIOUS_THRESHOLD,
            default_affinity: None,
            managed_isolated: None,
            sync_spin_limit: 1000,
            sync_stall_warn: Some(1 << 20),
        }
    }
}

impl IrqConfig {
    /// Builds a configuration from a kernel command line.
    ///
    /// Recognized arguments are `threadirqs`, `irqaffinity=<cpu-list>`,
    /// `isolcpus=managed_irq,<cpu-list>`, `irq.spurious_threshold=<n>` and
    /// `irq.preempt_rt`. Everything else is ignored, and a malformed value
    /// leaves the corresponding setting at its default.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        for arg in cmdline.split_whitespace() {
            let (name, value) = match arg.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (arg, None),
            };
            match (name, value) {
                ("threadirqs", None) => config.force_threads = true,
                ("irq.preempt_rt", None) => config.preempt_rt = true,
                ("irqaffinity", Some(list)) => match CpuSet::parse_list(list) {
                    Some(set) if !set.is_empty() => config.default_affinity = Some(set),
                    _ => log::warn!("irq: ignoring malformed irqaffinity={}", list),
                },
                ("isolcpus", Some(value)) => {
                    if let Some(set) = parse_isolcpus(value) {
                        config.managed_isolated = Some(set);
                    }
                }
                ("irq.spurious_threshold", Some(value)) => match value.parse::<u32>() {
                    Ok(threshold) if threshold > 0 => config.spurious_threshold = threshold,
                    _ => log::warn!("irq: ignoring malformed irq.spurious_threshold={}", value),
                },
                _ => {}
            }
        }
        config
    }
}

// Parses `[flag,]...<cpu-list>` and returns the list only if `managed_irq`
// is one of the flags.
fn parse_isolcpus(value: &str) -> Option<CpuSet> {
    let mut managed = false;
    let mut rest = value;
    while let Some((flag, tail)) = rest.split_once(',') {
        if !flag.starts_with(|c: char| c.is_ascii_alphabetic()) {
            break;
        }
        managed |= flag == "managed_irq";
        rest = tail;
    }
    if !managed {
        return None;
    }
    let cpus = CpuSet::parse_list(rest);
    if cpus.is_none() {
        log::warn!("irq: ignoring malformed isolcpus={}", value);
    }
    cpus
}
