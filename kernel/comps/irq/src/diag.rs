// SPDX-License-Identifier: MPL-2.0

//! Read-only views for diagnostics.

use core::sync::atomic::Ordering;

use crate::{
    line::{IrqLine, LineStatus},
    prelude::*,
    registry::IrqManager,
};

/// A point-in-time copy of the state of a line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineSnapshot {
    /// The line.
    pub id: LineId,
    /// Name of the chip serving the line.
    pub chip: String,
    /// Raw status bits.
    pub status: LineStatus,
    /// Nesting depth of disables. Zero means enabled.
    pub depth: u32,
    /// Whether the line is enabled.
    pub enabled: bool,
    /// Whether the chip has the line masked.
    pub masked: bool,
    /// Whether an occurrence is waiting to be replayed.
    pub pending: bool,
    /// Whether the line was disabled for firing with nobody handling it.
    pub spurious_disabled: bool,
    /// Occurrences since the last handler was installed.
    pub irq_count: u64,
    /// Consecutive unhandled occurrences.
    pub unhandled: u32,
    /// Unhandled occurrences over the lifetime of the line.
    pub unhandled_total: u64,
    /// Handler names in chain order.
    pub handlers: Vec<String>,
    /// CPUs the line was asked to be routed to.
    pub affinity: CpuSet,
    /// CPUs the chip actually routes the line to.
    pub effective_affinity: CpuSet,
    /// Placement suggested by the driver, if any.
    pub affinity_hint: Option<CpuSet>,
    /// Bitset of workers a oneshot line still waits for.
    pub outstanding_oneshot: usize,
    /// Deferred handler runs that reported [`IrqReturn::Handled`].
    pub threads_handled: u64,
}

/// Counters across all lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IrqStats {
    /// Occurrences no handler claimed, on any line.
    pub unhandled_total: u64,
    /// Lines disabled because nobody handled their occurrences.
    pub spurious_disabled: u64,
}

impl IrqManager {
    /// Takes a snapshot of a line.
    pub fn snapshot(&self, id: LineId) -> Result<LineSnapshot> {
        Ok(snapshot_line(self.lookup(id)?))
    }

    /// Takes a snapshot of every line that has handlers installed.
    pub fn snapshots(&self) -> Vec<LineSnapshot> {
        self.lines()
            .filter(|line| line.lock().has_action())
            .map(|line| snapshot_line(line))
            .collect()
    }

    /// Returns the process-wide counters.
    pub fn stats(&self) -> IrqStats {
        let global = self.global();
        IrqStats {
            unhandled_total: global.unhandled_total,
            spurious_disabled: global.spurious_disabled,
        }
    }
}

fn snapshot_line(line: &IrqLine) -> LineSnapshot {
    let state = line.lock();
    LineSnapshot {
        id: line.id(),
        chip: line.chip_name().to_string(),
        status: state.status,
        depth: state.depth,
        enabled: state.depth == 0,
        masked: state.status.contains(LineStatus::MASKED),
        pending: state.status.contains(LineStatus::PENDING),
        spurious_disabled: state.status.contains(LineStatus::SPURIOUS_DISABLED),
        irq_count: state.irq_count,
        unhandled: state.unhandled,
        unhandled_total: state.unhandled_total,
        handlers: state.chain.iter().map(|action| action.name.clone()).collect(),
        affinity: state.affinity.clone(),
        effective_affinity: state.effective.clone(),
        affinity_hint: state.affinity_hint.clone(),
        outstanding_oneshot: line.threads_oneshot.load(Ordering::Acquire),
        threads_handled: line.threads_handled.load(Ordering::Relaxed),
    }
}
