// SPDX-License-Identifier: MPL-2.0

//! Suspend and resume of interrupt lines, and wake sources.
//!
//! On suspend every line with handlers is disabled, except lines whose
//! handlers asked to stay enabled and lines configured as wake sources. The
//! latter are armed instead: an occurrence on an armed line is recorded as a
//! wake event and the line is suspended on the spot.

use crate::{
    chip::{ChipFlags, IrqChip},
    line::{LineSettings, LineState, LineStatus},
    prelude::*,
    registry::IrqManager,
};

/// Updates the suspend bookkeeping of a line for a new handler.
pub(crate) fn install_action(id: LineId, state: &mut LineState, flags: IrqFlags) {
    state.nr_actions += 1;

    if flags.contains(IrqFlags::FORCE_RESUME) {
        state.force_resume_depth += 1;
    }
    if state.force_resume_depth != 0 && state.force_resume_depth != state.nr_actions {
        log::warn!("irq {}: mixed FORCE_RESUME handlers on a shared line", id);
    }

    if flags.contains(IrqFlags::NO_SUSPEND) {
        state.no_suspend_depth += 1;
    } else if flags.contains(IrqFlags::COND_SUSPEND) {
        state.cond_suspend_depth += 1;
    }
    if state.no_suspend_depth != 0
        && state.no_suspend_depth + state.cond_suspend_depth != state.nr_actions
    {
        log::warn!("irq {}: mixed NO_SUSPEND handlers on a shared line", id);
    }
}

/// Undoes [`install_action`].
pub(crate) fn remove_action(state: &mut LineState, flags: IrqFlags) {
    state.nr_actions -= 1;
    if flags.contains(IrqFlags::FORCE_RESUME) {
        state.force_resume_depth -= 1;
    }
    if flags.contains(IrqFlags::NO_SUSPEND) {
        state.no_suspend_depth -= 1;
    } else if flags.contains(IrqFlags::COND_SUSPEND) {
        state.cond_suspend_depth -= 1;
    }
}

impl IrqManager {
    /// Enables or disables a line as a wake source.
    ///
    /// Calls are counted; the chip is only told about the first enable and
    /// the last disable.
    ///
    /// # Panics
    ///
    /// Panics on a disable that has no matching enable.
    pub fn set_wake_source(&self, id: LineId, on: bool) -> Result<()> {
        let line = self.lookup(id)?;
        let _bus = line.bus_lock();
        let mut state = line.lock();
        if state.status.contains(LineStatus::NMI) {
            return Err(Error::InvalidArgs);
        }

        let skip_chip = line.chip().flags().contains(ChipFlags::SKIP_SET_WAKE);
        if on {
            state.wake_depth += 1;
            if state.wake_depth == 1 {
                if let Err(err) = set_wake_real(line.chip(), id, true, skip_chip) {
                    state.wake_depth = 0;
                    return Err(err);
                }
                state.status.insert(LineStatus::WAKEUP_STATE);
            }
        } else {
            if state.wake_depth == 0 {
                misuse!("unbalanced wake disable for irq {}", id);
            }
            state.wake_depth -= 1;
            if state.wake_depth == 0 {
                if let Err(err) = set_wake_real(line.chip(), id, false, skip_chip) {
                    state.wake_depth = 1;
                    return Err(err);
                }
                state.status.remove(LineStatus::WAKEUP_STATE);
            }
        }
        Ok(())
    }

    /// Quiesces every line for system suspend.
    ///
    /// Returns once no hard-context handler or worker of a quiesced or armed
    /// line is running.
    pub fn suspend_all(&self) {
        self.global().wakeup_event = None;

        for line in self.lines() {
            if line
                .settings()
                .intersects(LineSettings::NESTED_THREAD | LineSettings::CHAINED)
            {
                continue;
            }
            let sync = {
                let _bus = line.bus_lock();
                let mut state = line.lock();
                if !state.has_action() || state.no_suspend_depth != 0 {
                    false
                } else if state.status.contains(LineStatus::WAKEUP_STATE) {
                    state.status.insert(LineStatus::WAKEUP_ARMED);
                    if line
                        .chip()
                        .flags()
                        .contains(ChipFlags::ENABLE_WAKEUP_ON_SUSPEND)
                        && state.status.contains(LineStatus::DISABLED)
                    {
                        // The disable depth stays as the driver left it.
                        line.irq_enable(&mut state);
                        state.status.insert(LineStatus::ENABLED_ON_SUSPEND);
                    }
                    true
                } else {
                    state.status.insert(LineStatus::SUSPENDED);
                    line.disable_nested(&mut state);
                    if line.chip().flags().contains(ChipFlags::MASK_ON_SUSPEND) {
                        line.mask(&mut state);
                    }
                    true
                }
            };
            if sync {
                line.synchronize_hardirq(true);
                line.wait_for_threads();
            }
        }
        log::debug!("irq: lines suspended");
    }

    /// Brings the lines back after resume.
    ///
    /// With `early`, only lines whose first handler asked for
    /// [`IrqFlags::EARLY_RESUME`] are resumed; the later full pass handles
    /// the rest.
    pub fn resume_all(&self, early: bool) {
        let default_affinity = self.default_affinity();
        for line in self.lines() {
            if line.settings().contains(LineSettings::NESTED_THREAD) {
                continue;
            }
            let _bus = line.bus_lock();
            let mut state = line.lock();
            let is_early = state
                .chain
                .first()
                .is_some_and(|action| action.flags.contains(IrqFlags::EARLY_RESUME));
            if early && !is_early {
                continue;
            }

            state.status.remove(LineStatus::WAKEUP_ARMED);
            if state.status.contains(LineStatus::ENABLED_ON_SUSPEND) {
                line.irq_disable(&mut state);
                state.status.remove(LineStatus::ENABLED_ON_SUSPEND);
            }

            if !state.status.contains(LineStatus::SUSPENDED) {
                if state.force_resume_depth == 0 {
                    continue;
                }
                // Restart it as if it had been suspended.
                state.depth += 1;
                state
                    .status
                    .insert(LineStatus::DISABLED | LineStatus::MASKED);
            }
            state.status.remove(LineStatus::SUSPENDED);
            line.enable_nested(&mut state, &default_affinity);
        }
        log::debug!("irq: lines resumed (early: {})", early);
    }

    /// Returns and clears the line whose occurrence woke the system, if any.
    pub fn take_wakeup_event(&self) -> Option<LineId> {
        self.global().wakeup_event.take()
    }
}

fn set_wake_real(chip: &dyn IrqChip, id: LineId, on: bool, skip_chip: bool) -> Result<()> {
    if skip_chip {
        return Ok(());
    }
    chip.set_wake(id, on).inspect_err(|err| {
        log::warn!("irq {}: chip refused wake {}: {}", id, if on { "on" } else { "off" }, err)
    })
}
