// SPDX-License-Identifier: MPL-2.0

//! The interrupt request core.
//!
//! This crate sits between the low-level trap entry and device drivers. It
//! keeps one [`IrqLine`] per hardware interrupt line, lets drivers install
//! handlers on them, runs those handlers when a line fires, and quiesces the
//! lines around system suspend.
//!
//! # Overview
//!
//! A driver installs a handler with [`IrqManager::register`]. A handler has
//! up to two halves: a hard handler that runs in hard-interrupt context, and
//! a deferred handler that runs in a dedicated worker thread. The hard
//! handler returns [`IrqReturn::WakeThread`] to hand the bulk of the work
//! over to the worker. Lines flagged [`IrqFlags::ONESHOT`] stay masked until
//! every woken worker is done.
//!
//! Several handlers can share a line if all of them ask for
//! [`IrqFlags::SHARED`] and agree on the trigger type, oneshot-ness and
//! per-CPU-ness.
//!
//! The trap entry calls [`IrqManager::handle_irq`] for each occurrence. A
//! line that keeps firing while no handler claims it is disabled after
//! [`IrqConfig::spurious_threshold`] occurrences in a row.
//!
//! # Example
//!
//! ```ignore
//! let manager = IrqManagerBuilder::new(64, scheduler, cpu)
//!     .controller(0, 64, pic, LineSettings::empty())
//!     .build()?;
//!
//! let handle = manager.register(
//!     LineId::new(5),
//!     IrqRequest::new("eth0", DevCookie(0x1000))
//!         .flags(IrqFlags::SHARED | IrqFlags::ONESHOT)
//!         .hard_handler(|_| IrqReturn::WakeThread)
//!         .thread_handler(|_| IrqReturn::Handled),
//! )?;
//! // ...
//! manager.unregister(handle)?;
//! ```
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod action;
mod affinity;
mod chain;
mod chip;
mod config;
mod cpu;
mod diag;
mod dispatch;
mod error;
mod line;
mod pm;
mod prelude;
mod registry;
mod task;
mod thread;

#[cfg(test)]
mod test_util;

pub use self::{
    action::{DevCookie, HandlerFn, IrqFlags, IrqHandle, IrqRequest, IrqReturn},
    affinity::AffinityNotifier,
    chain::RequestContext,
    chip::{ChipFlags, ChipState, IrqChip, TriggerType},
    config::{DEFAULT_SPURIOUS_THRESHOLD, IrqConfig},
    cpu::{CpuId, CpuOps, CpuSet, DisabledLocalIrqGuard, disable_local},
    diag::{IrqStats, LineSnapshot},
    error::Error,
    line::{IrqLine, LineId, LineSettings, LineStatus},
    prelude::Result,
    registry::{IrqManager, IrqManagerBuilder},
    task::{IRQ_THREAD_PRIORITY, SchedPolicy, Scheduler, ThreadEntry, ThreadHandle},
};
