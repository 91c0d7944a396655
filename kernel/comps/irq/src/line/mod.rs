// SPDX-License-Identifier: MPL-2.0

//! Interrupt lines.
//!
//! An [`IrqLine`] is created once when its controller is registered and is
//! never destroyed. Handlers come and go, the line itself is only quiesced.
//!
//! # Locking
//!
//! The mutable state of a line lives behind one spin lock that is always
//! acquired with local IRQs disabled. Chips behind a slow bus additionally
//! bracket their changes with the bus lock, which is taken before the line
//! lock and released after it. Register and unregister are serialized by a
//! per-line request lock taken before both.

mod status;

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub use status::{LineSettings, LineStatus};

use crate::{
    action::{ActionId, IrqAction},
    affinity::AffinityNotifier,
    chip::{ChipFlags, IrqChip, TriggerType},
    cpu::{SpinIrqGuard, lock_irq_disabled},
    prelude::*,
    registry::Platform,
};

/// The number of an interrupt line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineId(u32);

impl LineId {
    /// Creates a line ID from its raw number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw number.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for LineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An interrupt line.
pub struct IrqLine {
    id: LineId,
    chip: Arc<dyn IrqChip>,
    settings: LineSettings,
    pub(crate) platform: Arc<Platform>,
    state: spin::Mutex<LineState>,
    pub(crate) request_lock: spin::Mutex<()>,
    // Set while hard-context handlers run. Only written with the line lock held.
    pub(crate) in_progress: AtomicBool,
    // One bit per oneshot handler whose worker has been woken but not finished.
    pub(crate) threads_oneshot: AtomicUsize,
    pub(crate) threads_active: AtomicUsize,
    pub(crate) threads_handled: AtomicU64,
    // Mirrors `LineStatus::NMI` for the entry path, which must not spin on the lock.
    pub(crate) nmi_delivery: AtomicBool,
    next_action_id: AtomicU64,
}

/// The lock-protected part of an interrupt line.
pub(crate) struct LineState {
    pub(crate) status: LineStatus,
    pub(crate) depth: u32,
    pub(crate) wake_depth: u32,
    pub(crate) trigger: TriggerType,
    pub(crate) chain: Arc<[Arc<IrqAction>]>,

    pub(crate) nr_actions: u32,
    pub(crate) no_suspend_depth: u32,
    pub(crate) cond_suspend_depth: u32,
    pub(crate) force_resume_depth: u32,

    pub(crate) affinity: CpuSet,
    pub(crate) effective: CpuSet,
    pub(crate) pending_mask: CpuSet,
    pub(crate) affinity_hint: Option<CpuSet>,
    pub(crate) notifier: Option<Arc<AffinityNotifier>>,
    pub(crate) percpu_enabled: CpuSet,

    pub(crate) irq_count: u64,
    pub(crate) unhandled: u32,
    pub(crate) unhandled_total: u64,
}

pub(crate) type LineGuard<'a> = SpinIrqGuard<'a, LineState>;

impl LineState {
    fn new(affinity: CpuSet) -> Self {
        Self {
            status: LineStatus::DISABLED | LineStatus::MASKED,
            depth: 1,
            wake_depth: 0,
            trigger: TriggerType::None,
            chain: Vec::new().into(),
            nr_actions: 0,
            no_suspend_depth: 0,
            cond_suspend_depth: 0,
            force_resume_depth: 0,
            affinity,
            effective: CpuSet::new_empty(),
            pending_mask: CpuSet::new_empty(),
            affinity_hint: None,
            notifier: None,
            percpu_enabled: CpuSet::new_empty(),
            irq_count: 0,
            unhandled: 0,
            unhandled_total: 0,
        }
    }

    pub(crate) fn is_level(&self) -> bool {
        self.status.contains(LineStatus::LEVEL)
    }

    pub(crate) fn has_action(&self) -> bool {
        !self.chain.is_empty()
    }
}

/// Brackets a batch of chip changes for chips behind a slow bus.
#[clippy::has_significant_drop]
#[must_use]
pub(crate) struct BusGuard<'a> {
    line: &'a IrqLine,
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        if self.line.chip.has_bus_lock() {
            self.line.chip.bus_sync_unlock(self.line.id);
        }
    }
}

impl IrqLine {
    pub(crate) fn new(
        id: LineId,
        chip: Arc<dyn IrqChip>,
        settings: LineSettings,
        platform: Arc<Platform>,
    ) -> Self {
        let affinity = platform.cpu.online_cpus();
        Self {
            id,
            chip,
            settings,
            platform,
            state: spin::Mutex::new(LineState::new(affinity)),
            request_lock: spin::Mutex::new(()),
            in_progress: AtomicBool::new(false),
            threads_oneshot: AtomicUsize::new(0),
            threads_active: AtomicUsize::new(0),
            threads_handled: AtomicU64::new(0),
            nmi_delivery: AtomicBool::new(false),
            next_action_id: AtomicU64::new(0),
        }
    }

    /// Returns the line number.
    pub fn id(&self) -> LineId {
        self.id
    }

    /// Returns the name of the chip that owns the line.
    pub fn chip_name(&self) -> &str {
        self.chip.name()
    }

    /// Returns the static settings of the line.
    pub fn settings(&self) -> LineSettings {
        self.settings
    }

    /// Returns the current status flags.
    pub fn status(&self) -> LineStatus {
        self.lock().status
    }

    /// Returns the nested disable depth.
    pub fn depth(&self) -> u32 {
        self.lock().depth
    }

    /// Returns the bits of oneshot handlers that have not finished yet.
    pub fn outstanding_oneshot(&self) -> usize {
        self.threads_oneshot.load(Ordering::Acquire)
    }

    pub(crate) fn alloc_action_id(&self) -> ActionId {
        ActionId(self.next_action_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn chip(&self) -> &dyn IrqChip {
        &*self.chip
    }

    pub(crate) fn lock(&self) -> LineGuard<'_> {
        lock_irq_disabled(&self.state, &*self.platform.cpu)
    }

    /// Returns the handler chain without spinning, or `None` if the lock is taken.
    pub(crate) fn try_chain(&self) -> Option<Arc<[Arc<IrqAction>]>> {
        self.state.try_lock().map(|state| state.chain.clone())
    }

    pub(crate) fn bus_lock(&self) -> BusGuard<'_> {
        if self.chip.has_bus_lock() {
            self.chip.bus_lock(self.id);
        }
        BusGuard { line: self }
    }

    // Returns whether the chip carried out the operation. A missing
    // capability is not an error, a failing one is logged.
    pub(crate) fn chip_done(&self, op: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(Error::Unsupported) => false,
            Err(err) => {
                log::error!(
                    "irq {}: {} failed on chip {}: {}",
                    self.id,
                    op,
                    self.chip.name(),
                    err
                );
                false
            }
        }
    }

    // Returns whether the line is no longer masked after the chip call.
    fn chip_unmasked(&self, op: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) | Err(Error::Unsupported) => true,
            Err(_) => self.chip_done(op, result),
        }
    }

    pub(crate) fn mask(&self, state: &mut LineState) {
        if state.status.contains(LineStatus::MASKED) {
            return;
        }
        if self.chip_done("mask", self.chip.mask(self.id)) {
            state.status.insert(LineStatus::MASKED);
        }
    }

    pub(crate) fn unmask(&self, state: &mut LineState) {
        if !state.status.contains(LineStatus::MASKED) {
            return;
        }
        if self.chip_unmasked("unmask", self.chip.unmask(self.id)) {
            state.status.remove(LineStatus::MASKED);
        }
    }

    pub(crate) fn ack(&self) {
        self.chip_done("ack", self.chip.ack(self.id));
    }

    pub(crate) fn eoi(&self) {
        self.chip_done("eoi", self.chip.eoi(self.id));
    }

    /// Unmasks the line at the end of a flow if nothing keeps it masked.
    pub(crate) fn cond_unmask(&self, state: &mut LineState) {
        if !state.status.contains(LineStatus::DISABLED)
            && state.status.contains(LineStatus::MASKED)
            && self.threads_oneshot.load(Ordering::Acquire) == 0
        {
            self.unmask(state);
        }
    }

    pub(crate) fn activate(&self, state: &mut LineState) -> Result<()> {
        if state.status.contains(LineStatus::ACTIVATED) {
            return Ok(());
        }
        self.chip.activate(self.id)?;
        state.status.insert(LineStatus::ACTIVATED);
        Ok(())
    }

    pub(crate) fn deactivate(&self, state: &mut LineState) {
        if state.status.contains(LineStatus::ACTIVATED) {
            self.chip.deactivate(self.id);
            state.status.remove(LineStatus::ACTIVATED);
        }
    }

    /// Starts the line up, or merely enables it if it was started before.
    pub(crate) fn startup(&self, state: &mut LineState, resend: bool, default_affinity: &CpuSet) {
        state.depth = 0;
        if state.status.contains(LineStatus::STARTED) {
            self.irq_enable(state);
        } else {
            if let Err(err) = self.activate(state) {
                log::error!("irq {}: activation failed: {}", self.id, err);
            }
            let result = self.chip.startup(self.id);
            if self.chip_unmasked("startup", result) {
                state.status.remove(LineStatus::MASKED);
            }
            state.status.remove(LineStatus::DISABLED);
            state.status.insert(LineStatus::STARTED);
            self.setup_affinity(state, default_affinity);
        }
        if resend {
            self.check_and_resend(state);
        }
    }

    /// Shuts the line down. The line is left disabled with a depth of one.
    pub(crate) fn shutdown(&self, state: &mut LineState) {
        state.depth = 1;
        state.status.insert(LineStatus::DISABLED);
        if state.status.contains(LineStatus::STARTED) {
            if self.chip_done("shutdown", self.chip.shutdown(self.id)) {
                state.status.insert(LineStatus::MASKED);
            }
            state.status.remove(LineStatus::STARTED);
        }
    }

    pub(crate) fn irq_enable(&self, state: &mut LineState) {
        state.status.remove(LineStatus::DISABLED);
        if state.status.contains(LineStatus::MOVE_PENDING) {
            self.move_masked(state);
        }
        if self.chip_unmasked("enable", self.chip.enable(self.id)) {
            state.status.remove(LineStatus::MASKED);
        }
    }

    pub(crate) fn irq_disable(&self, state: &mut LineState) {
        state.status.insert(LineStatus::DISABLED);
        if self.chip_done("disable", self.chip.disable(self.id)) {
            state.status.insert(LineStatus::MASKED);
        }
    }

    /// Increments the disable depth, disabling the line on the first call.
    pub(crate) fn disable_nested(&self, state: &mut LineState) {
        if state.depth == 0 {
            self.irq_disable(state);
        }
        state.depth += 1;
    }

    /// Undoes one [`Self::disable_nested`].
    pub(crate) fn enable_nested(&self, state: &mut LineState, default_affinity: &CpuSet) {
        match state.depth {
            0 => misuse!("unbalanced enable for irq {}", self.id),
            1 if state.status.contains(LineStatus::SUSPENDED) => {
                misuse!("unbalanced enable for suspended irq {}", self.id)
            }
            1 => self.startup(state, true, default_affinity),
            _ => state.depth -= 1,
        }
    }

    /// Replays an edge that arrived while the line could not handle it.
    fn check_and_resend(&self, state: &mut LineState) {
        if !state.status.contains(LineStatus::PENDING) {
            return;
        }
        state.status.remove(LineStatus::PENDING);
        if state.is_level() {
            // A level line is still asserted and fires again once unmasked.
            return;
        }
        match self.chip.retrigger(self.id) {
            Ok(()) => log::trace!("irq {}: pending edge retriggered", self.id),
            Err(Error::Unsupported) => {
                log::debug!("irq {}: chip cannot retrigger, pending edge dropped", self.id)
            }
            Err(err) => log::error!("irq {}: retrigger failed: {}", self.id, err),
        }
    }

    /// Programs the trigger type.
    pub(crate) fn set_trigger(&self, state: &mut LineState, trigger: TriggerType) -> Result<()> {
        let flags = self.chip.flags();
        let mut unmask = false;
        if flags.contains(ChipFlags::SET_TYPE_MASKED) {
            self.mask(state);
            unmask = !state.status.contains(LineStatus::DISABLED);
        }

        let result = match self.chip.set_type(self.id, trigger) {
            Ok(()) => {
                state.trigger = trigger;
                state.status.insert(LineStatus::TRIGGER_SET);
                state.status.set(LineStatus::LEVEL, trigger.is_level());
                Ok(())
            }
            Err(Error::Unsupported) => {
                log::debug!(
                    "irq {}: chip {} has no set_type, keeping the current trigger",
                    self.id,
                    self.chip.name()
                );
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "irq {}: setting trigger {:?} failed: {}",
                    self.id,
                    trigger,
                    err
                );
                Err(err)
            }
        };

        if unmask {
            self.unmask(state);
        }
        result
    }
}
