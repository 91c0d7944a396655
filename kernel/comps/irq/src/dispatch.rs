// SPDX-License-Identifier: MPL-2.0

//! The hard-interrupt entry point.
//!
//! One flow serves every ordinary line. Level-triggered and oneshot lines are
//! masked for the duration of an occurrence and unmasked at the end only if
//! no oneshot worker is still outstanding. Edge-triggered lines stay unmasked
//! and loop while new edges arrive on another CPU.

use core::sync::atomic::Ordering;

use crate::{
    action::{IrqAction, thread_flags},
    cpu::disable_local,
    line::{IrqLine, LineState, LineStatus},
    prelude::*,
    registry::IrqManager,
};

// What a flow leaves for the process-wide accounting. It is applied after the
// line lock is released.
#[derive(Default)]
struct FlowOutcome {
    unhandled: u64,
    spurious_disabled: bool,
    wakeup: bool,
}

impl IrqManager {
    /// Handles an occurrence of `id` on the current CPU.
    ///
    /// The platform's trap entry calls this once per occurrence, in
    /// hard-interrupt context. The returned value is the merged outcome of
    /// the handlers that ran; [`IrqReturn::None`] also covers occurrences
    /// that were only recorded as pending.
    pub fn handle_irq(&self, id: LineId) -> Result<IrqReturn> {
        let line = self.lookup(id)?;
        if line.nmi_delivery.load(Ordering::Acquire) {
            return Ok(handle_nmi(line));
        }

        let _irq_guard = disable_local(&*self.platform.cpu);
        let mut outcome = FlowOutcome::default();
        let ret = handle_flow(line, self.platform.config.spurious_threshold, &mut outcome);
        self.account(id, outcome);
        Ok(ret)
    }

    /// Runs the handlers of a line that is demultiplexed by the worker of
    /// its parent line.
    ///
    /// Must be called from the parent's deferred handler, never from hard
    /// context.
    pub fn handle_nested_irq(&self, id: LineId) -> Result<IrqReturn> {
        let line = self.lookup(id)?;
        let mut outcome = FlowOutcome::default();

        let mut state = line.lock();
        if !state.has_action() || state.status.contains(LineStatus::DISABLED) {
            state.status.insert(LineStatus::PENDING);
            return Ok(IrqReturn::None);
        }
        line.in_progress.store(true, Ordering::Release);
        let chain = state.chain.clone();
        drop(state);

        let ret = chain
            .iter()
            .fold(IrqReturn::None, |ret, action| ret.merge(action.call_thread(id)));

        let mut state = line.lock();
        note_interrupt(
            line,
            &mut state,
            ret,
            self.platform.config.spurious_threshold,
            &mut outcome,
        );
        line.in_progress.store(false, Ordering::Release);
        drop(state);

        self.account(id, outcome);
        Ok(ret)
    }

    /// Wakes the worker of the handler identified by `cookie` as if its hard
    /// handler had returned [`IrqReturn::WakeThread`].
    pub fn wake_thread(&self, id: LineId, cookie: DevCookie) -> Result<()> {
        let line = self.lookup(id)?;
        let state = line.lock();
        if state.status.intersects(LineStatus::PER_CPU | LineStatus::NMI) {
            return Err(Error::InvalidArgs);
        }
        let action = state
            .chain
            .iter()
            .find(|action| action.cookie == cookie)
            .ok_or(Error::NotFound)?;
        if !action.has_thread() {
            return Err(Error::InvalidArgs);
        }
        wake_thread(line, action);
        Ok(())
    }

    fn account(&self, id: LineId, outcome: FlowOutcome) {
        if outcome.unhandled == 0 && !outcome.spurious_disabled && !outcome.wakeup {
            return;
        }
        let mut global = self.global();
        global.unhandled_total += outcome.unhandled;
        if outcome.spurious_disabled {
            global.spurious_disabled += 1;
        }
        if outcome.wakeup && global.wakeup_event.is_none() {
            log::info!("irq {}: wake-up event while suspended", id);
            global.wakeup_event = Some(id);
        }
    }
}

fn handle_flow(line: &IrqLine, threshold: u32, outcome: &mut FlowOutcome) -> IrqReturn {
    let mut state = line.lock();
    if state.status.contains(LineStatus::PER_CPU) {
        let chain = state.chain.clone();
        drop(state);
        return handle_percpu(line, &chain);
    }

    let masking = state.is_level() || state.status.contains(LineStatus::ONESHOT);
    if masking {
        line.mask(&mut state);
    }
    line.ack();

    if state.status.contains(LineStatus::MOVE_PENDING) && !line.chip().has_bus_lock() {
        line.move_pending(&mut state);
    }

    if !may_run(line, &mut state, outcome) {
        if !masking {
            state.status.insert(LineStatus::PENDING);
            line.mask(&mut state);
        }
        line.eoi();
        return IrqReturn::None;
    }

    if !state.has_action() || state.status.contains(LineStatus::DISABLED) {
        state.status.insert(LineStatus::PENDING);
        line.mask(&mut state);
        line.eoi();
        return IrqReturn::None;
    }

    let mut ret = IrqReturn::None;
    loop {
        // An edge recorded by another CPU masked the line; let the next one in.
        if !masking
            && state.status.contains(LineStatus::PENDING | LineStatus::MASKED)
            && !state.status.contains(LineStatus::DISABLED)
        {
            line.unmask(&mut state);
        }
        state.status.remove(LineStatus::PENDING);
        line.in_progress.store(true, Ordering::Release);
        let chain = state.chain.clone();
        drop(state);

        let res = handle_event(line, &chain);
        ret = ret.merge(res);

        state = line.lock();
        note_interrupt(line, &mut state, res, threshold, outcome);
        let replay = !masking
            && state.status.contains(LineStatus::PENDING)
            && !state.status.contains(LineStatus::DISABLED)
            && state.has_action();
        if !replay {
            break;
        }
    }
    line.in_progress.store(false, Ordering::Release);

    if masking {
        line.cond_unmask(&mut state);
    }
    line.eoi();
    ret
}

// Returns whether the handlers may run now. An occurrence on a line armed
// for wake-up during suspend is a wake event and suspends the line instead.
fn may_run(line: &IrqLine, state: &mut LineState, outcome: &mut FlowOutcome) -> bool {
    let armed = state.status.contains(LineStatus::WAKEUP_ARMED);
    if !armed && !line.in_progress.load(Ordering::Acquire) {
        return true;
    }
    if armed {
        state.status.remove(LineStatus::WAKEUP_ARMED);
        state
            .status
            .insert(LineStatus::SUSPENDED | LineStatus::PENDING);
        line.disable_nested(state);
        outcome.wakeup = true;
    }
    false
}

fn handle_event(line: &IrqLine, chain: &[Arc<IrqAction>]) -> IrqReturn {
    let mut ret = IrqReturn::None;
    for action in chain {
        let res = action.call_hard(line.id());
        if res == IrqReturn::WakeThread {
            if action.has_thread() {
                wake_thread(line, action);
            } else {
                action.warn_once(line.id(), "asked for a deferred handler it does not have");
            }
        }
        ret = ret.merge(res);
    }
    ret
}

fn handle_percpu(line: &IrqLine, chain: &[Arc<IrqAction>]) -> IrqReturn {
    line.ack();
    let ret = if chain.is_empty() {
        let cpu = line.platform.cpu.current_cpu();
        log::warn!(
            "irq {}: unexpected per-CPU occurrence on CPU {}, disabling it there",
            line.id(),
            cpu.as_u32()
        );
        line.chip_done("disable", line.chip().disable(line.id()));
        IrqReturn::None
    } else {
        chain.iter().fold(IrqReturn::None, |ret, action| {
            ret.merge(action.call_hard(line.id()))
        })
    };
    line.eoi();
    ret
}

fn handle_nmi(line: &IrqLine) -> IrqReturn {
    // NMIs may arrive while this CPU holds the line lock.
    let Some(chain) = line.try_chain() else {
        line.eoi();
        return IrqReturn::None;
    };
    let ret = chain.iter().fold(IrqReturn::None, |ret, action| {
        ret.merge(action.call_hard(line.id()))
    });
    line.eoi();
    ret
}

/// Schedules the worker of `action`.
///
/// A wake-up that arrives before the worker picked up the previous one is
/// folded into it.
pub(crate) fn wake_thread(line: &IrqLine, action: &IrqAction) {
    let Some(worker) = action.worker.get() else {
        return;
    };
    if action.should_stop.load(Ordering::Acquire) {
        return;
    }

    line.threads_active.fetch_add(1, Ordering::AcqRel);
    if action.test_and_set_thread_flag(thread_flags::RUNTHREAD) {
        line.threads_active.fetch_sub(1, Ordering::AcqRel);
        return;
    }
    line.threads_oneshot
        .fetch_or(action.thread_mask(), Ordering::AcqRel);
    worker.unpark();
}

// Tracks consecutive unhandled occurrences and disables a screaming line.
fn note_interrupt(
    line: &IrqLine,
    state: &mut LineState,
    ret: IrqReturn,
    threshold: u32,
    outcome: &mut FlowOutcome,
) {
    state.irq_count += 1;
    if ret != IrqReturn::None {
        state.unhandled = 0;
        return;
    }

    state.unhandled += 1;
    state.unhandled_total += 1;
    outcome.unhandled += 1;
    if state.unhandled < threshold || state.status.contains(LineStatus::SPURIOUS_DISABLED) {
        return;
    }

    log::error!(
        "irq {}: nobody cared for {} occurrences in a row, disabling the line",
        line.id(),
        state.unhandled
    );
    for action in state.chain.iter() {
        log::error!("irq {}: handler {}", line.id(), action.name);
    }
    state.status.insert(LineStatus::SPURIOUS_DISABLED);
    line.disable_nested(state);
    state.unhandled = 0;
    outcome.spurious_disabled = true;
}
