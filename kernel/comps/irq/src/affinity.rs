// SPDX-License-Identifier: MPL-2.0

//! CPU affinity of interrupt lines.
//!
//! A line has two masks: the affinity requested by its users and the
//! effective affinity that the chip actually programmed. The dispatch path
//! never migrates a line on its own; it only applies a change that the chip
//! could not take when it was requested, and deferred workers move
//! themselves before their next run.

use crate::{
    action::thread_flags,
    chip::ChipFlags,
    line::{IrqLine, LineState, LineStatus},
    prelude::*,
    registry::IrqManager,
};

/// A callback invoked after the affinity of a line changed.
///
/// It runs in task context with no lock held and receives the new requested
/// affinity.
pub type AffinityNotifier = dyn Fn(LineId, &CpuSet) + Send + Sync;

impl IrqManager {
    /// Returns the process-wide default affinity.
    pub fn default_affinity(&self) -> CpuSet {
        self.global().default_affinity.clone()
    }

    /// Sets the process-wide default affinity used for lines that start up
    /// without an explicit affinity.
    pub fn set_default_affinity(&self, cpus: &CpuSet) -> Result<()> {
        if !cpus.intersects(&self.platform.cpu.online_cpus()) {
            return Err(Error::InvalidArgs);
        }
        self.global().default_affinity = cpus.clone();
        Ok(())
    }

    /// Returns the requested affinity of a line.
    pub fn affinity(&self, id: LineId) -> Result<CpuSet> {
        Ok(self.lookup(id)?.lock().affinity.clone())
    }

    /// Returns the CPUs the chip actually routes the line to.
    pub fn effective_affinity(&self, id: LineId) -> Result<CpuSet> {
        Ok(self.lookup(id)?.lock().effective.clone())
    }

    /// Routes a line to `cpus`.
    ///
    /// An empty mask stands for the default affinity. If the chip is busy
    /// and `force` is not set, the change is kept pending and applied at the
    /// next opportunity; with `force`, the busy error is returned instead.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgs`] if no CPU of the mask is online, or the line
    ///   is per-CPU or excluded from balancing. The affinity is left as is.
    /// - [`Error::Unsupported`] if the chip cannot route lines.
    pub fn set_affinity(&self, id: LineId, cpus: &CpuSet, force: bool) -> Result<()> {
        let line = self.lookup(id)?;
        let mask = if cpus.is_empty() {
            self.default_affinity()
        } else {
            cpus.clone()
        };
        if !mask.intersects(&self.platform.cpu.online_cpus()) {
            return Err(Error::InvalidArgs);
        }

        let notifier = {
            let _bus = line.bus_lock();
            let mut state = line.lock();
            line.set_affinity_locked(&mut state, &mask, force)?;
            state.notifier.clone()
        };
        if let Some(notify) = notifier {
            notify(id, &mask);
        }
        Ok(())
    }

    /// Records an affinity hint for a line and applies it.
    ///
    /// `None` clears the hint and leaves the affinity as is.
    pub fn set_affinity_hint(&self, id: LineId, hint: Option<&CpuSet>) -> Result<()> {
        let line = self.lookup(id)?;
        line.lock().affinity_hint = hint.cloned();
        match hint {
            Some(cpus) => self.set_affinity(id, cpus, false),
            None => Ok(()),
        }
    }

    /// Installs or removes the affinity-change notifier of a line.
    pub fn set_affinity_notifier(
        &self,
        id: LineId,
        notifier: Option<Arc<AffinityNotifier>>,
    ) -> Result<()> {
        let line = self.lookup(id)?;
        let mut state = line.lock();
        if state.status.contains(LineStatus::NMI) {
            return Err(Error::InvalidArgs);
        }
        state.notifier = notifier;
        Ok(())
    }

    /// Turns a line into a managed line spread over `cpus`.
    ///
    /// Managed lines are routed to housekeeping CPUs only, if the
    /// configuration reserves any. The line must be shut down and must not
    /// be managed already.
    pub fn set_managed_affinity(&self, id: LineId, cpus: &CpuSet) -> Result<()> {
        let line = self.lookup(id)?;
        if cpus.is_empty() {
            return Err(Error::InvalidArgs);
        }
        let _bus = line.bus_lock();
        let mut state = line.lock();
        if state
            .status
            .intersects(LineStatus::STARTED | LineStatus::AFFINITY_MANAGED)
        {
            return Err(Error::ResourceBusy);
        }

        let activated = state.status.contains(LineStatus::ACTIVATED);
        if activated {
            line.deactivate(&mut state);
        }
        state.status.insert(LineStatus::AFFINITY_MANAGED);
        state.affinity = cpus.clone();
        if activated {
            line.activate(&mut state)?;
        }
        Ok(())
    }
}

impl IrqLine {
    fn set_affinity_locked(&self, state: &mut LineState, mask: &CpuSet, force: bool) -> Result<()> {
        if state
            .status
            .intersects(LineStatus::PER_CPU | LineStatus::NO_BALANCING)
        {
            return Err(Error::InvalidArgs);
        }

        if self.chip().flags().contains(ChipFlags::AFFINITY_ON_ACTIVATE)
            && !state.status.contains(LineStatus::ACTIVATED)
        {
            // Programmed when the line is activated.
            state.affinity = mask.clone();
            state.effective = mask.intersection(&self.platform.cpu.online_cpus());
        } else if state.status.contains(LineStatus::MOVE_PENDING) {
            state.pending_mask = mask.clone();
        } else {
            match self.do_set_affinity(state, mask, force) {
                Err(Error::ResourceBusy) if !force => {
                    log::debug!("irq {}: chip busy, affinity change kept pending", self.id());
                    state.status.insert(LineStatus::MOVE_PENDING);
                    state.pending_mask = mask.clone();
                }
                result => result?,
            }
        }
        state.status.insert(LineStatus::AFFINITY_SET);
        Ok(())
    }

    // Programs the chip. Managed lines are kept on housekeeping CPUs unless
    // that leaves no online CPU.
    fn do_set_affinity(&self, state: &mut LineState, mask: &CpuSet, force: bool) -> Result<()> {
        let online = self.platform.cpu.online_cpus();
        let mut prog = mask.clone();
        if state.status.contains(LineStatus::AFFINITY_MANAGED) {
            if let Some(housekeeping) = self.platform.housekeeping() {
                let narrowed = mask.intersection(&housekeeping);
                if narrowed.intersects(&online) {
                    prog = narrowed;
                }
            }
        }

        let target = prog.intersection(&online);
        if target.is_empty() {
            return Err(Error::InvalidArgs);
        }
        let effective = self.chip().set_affinity(self.id(), &target, force)?;

        state.affinity = mask.clone();
        state.effective = effective.unwrap_or(target);
        for action in state.chain.iter() {
            action.test_and_set_thread_flag(thread_flags::AFFINITY);
            if let Some(secondary) = action.secondary() {
                secondary.test_and_set_thread_flag(thread_flags::AFFINITY);
            }
        }
        Ok(())
    }

    /// Chooses the affinity of a line that starts up.
    ///
    /// An affinity set explicitly or by management wins over the default
    /// as long as it still has an online CPU.
    pub(crate) fn setup_affinity(&self, state: &mut LineState, default_affinity: &CpuSet) {
        if state
            .status
            .intersects(LineStatus::PER_CPU | LineStatus::NO_BALANCING)
        {
            return;
        }
        let online = self.platform.cpu.online_cpus();

        let mut set = default_affinity.clone();
        if state
            .status
            .intersects(LineStatus::AFFINITY_MANAGED | LineStatus::AFFINITY_SET)
        {
            if state.affinity.intersects(&online) {
                set = state.affinity.clone();
            } else {
                state.status.remove(LineStatus::AFFINITY_SET);
            }
        }

        let mut mask = set.intersection(&online);
        if mask.is_empty() {
            mask = online;
        }
        match self.do_set_affinity(state, &mask, false) {
            Ok(()) | Err(Error::Unsupported) => {}
            Err(err) => log::warn!("irq {}: initial affinity not applied: {}", self.id(), err),
        }
    }

    /// Applies a pending affinity change. The line must be masked.
    pub(crate) fn move_masked(&self, state: &mut LineState) {
        if !state.status.contains(LineStatus::MOVE_PENDING) {
            return;
        }
        state.status.remove(LineStatus::MOVE_PENDING);

        let pending = core::mem::replace(&mut state.pending_mask, CpuSet::new_empty());
        if !pending.intersects(&self.platform.cpu.online_cpus()) {
            return;
        }
        match self.do_set_affinity(state, &pending, false) {
            Ok(()) => log::trace!("irq {}: pending affinity applied", self.id()),
            Err(Error::ResourceBusy) => {
                state.status.insert(LineStatus::MOVE_PENDING);
                state.pending_mask = pending;
            }
            Err(err) => log::warn!("irq {}: pending affinity dropped: {}", self.id(), err),
        }
    }

    /// Applies a pending affinity change from the dispatch path, masking the
    /// line around it if needed.
    pub(crate) fn move_pending(&self, state: &mut LineState) {
        // A disabled line moves when it is enabled again.
        if state.status.contains(LineStatus::DISABLED) {
            return;
        }
        let was_masked = state.status.contains(LineStatus::MASKED);
        if !was_masked {
            self.mask(state);
        }
        self.move_masked(state);
        if !was_masked {
            self.unmask(state);
        }
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        config::IrqConfig,
        test_util::{MockChip, TestEnv},
    };

    fn cpus(list: &[u32]) -> CpuSet {
        list.iter().copied().map(CpuId::new).collect()
    }

    #[test]
    fn effective_affinity_is_online_only() {
        let env = TestEnv::new(8, 4);
        env.cpu.set_online(cpus(&[2]));
        let id = LineId::new(4);
        let _handle = env.register_shared(4, 1, |_| IrqReturn::Handled);

        env.manager.set_affinity(id, &cpus(&[2, 3]), false).unwrap();
        assert_eq!(env.manager.affinity(id), Ok(cpus(&[2, 3])));
        assert_eq!(env.manager.effective_affinity(id), Ok(cpus(&[2])));
        assert_eq!(env.chip.last_affinity(id), Some(cpus(&[2])));
    }

    #[test]
    fn disjoint_mask_is_rejected() {
        let env = TestEnv::new(8, 4);
        env.cpu.set_online(cpus(&[0, 1]));
        let id = LineId::new(1);
        env.manager.set_affinity(id, &cpus(&[1]), false).unwrap();
        assert_eq!(
            env.manager.set_affinity(id, &cpus(&[2, 3]), false),
            Err(Error::InvalidArgs)
        );
        assert_eq!(
            env.manager.set_affinity(id, &cpus(&[2, 3]), true),
            Err(Error::InvalidArgs)
        );
        assert_eq!(env.manager.affinity(id), Ok(cpus(&[1])));
    }

    #[test]
    fn empty_mask_restores_default() {
        let env = TestEnv::new(8, 4);
        let id = LineId::new(0);
        env.manager.set_default_affinity(&cpus(&[0, 1])).unwrap();
        env.manager.set_affinity(id, &cpus(&[3]), false).unwrap();
        env.manager.set_affinity(id, &CpuSet::new_empty(), false).unwrap();
        assert_eq!(env.manager.affinity(id), Ok(cpus(&[0, 1])));
        assert_eq!(
            env.manager.set_default_affinity(&CpuSet::new_empty()),
            Err(Error::InvalidArgs)
        );
    }

    #[test]
    fn busy_chip_defers_the_move() {
        let env = TestEnv::new(8, 4);
        let id = LineId::new(2);
        let _handle = env.register_shared(2, 1, |_| IrqReturn::Handled);
        let before = env.manager.effective_affinity(id).unwrap();

        env.chip.set_affinity_busy(true);
        assert_eq!(
            env.manager.set_affinity(id, &cpus(&[1]), true),
            Err(Error::ResourceBusy)
        );
        env.manager.set_affinity(id, &cpus(&[1]), false).unwrap();
        let line = env.manager.lookup(id).unwrap();
        assert!(line.status().contains(LineStatus::MOVE_PENDING));
        // A second request while pending replaces the pending mask.
        env.manager.set_affinity(id, &cpus(&[3]), false).unwrap();
        assert_eq!(env.manager.effective_affinity(id), Ok(before));

        env.chip.set_affinity_busy(false);
        env.manager.handle_irq(id).unwrap();
        assert!(!line.status().contains(LineStatus::MOVE_PENDING));
        assert_eq!(env.manager.effective_affinity(id), Ok(cpus(&[3])));
        assert!(!line.status().contains(LineStatus::MASKED));
    }

    #[test]
    fn managed_lines_prefer_housekeeping_cpus() {
        let config = IrqConfig {
            managed_isolated: Some(cpus(&[0, 1])),
            ..IrqConfig::default()
        };
        let env = TestEnv::with_config(8, 4, config);

        let spread = LineId::new(1);
        env.manager.set_managed_affinity(spread, &cpus(&[0, 1, 2])).unwrap();
        let _h1 = env.register_shared(1, 1, |_| IrqReturn::Handled);
        assert_eq!(env.manager.affinity(spread), Ok(cpus(&[0, 1, 2])));
        assert_eq!(env.manager.effective_affinity(spread), Ok(cpus(&[2])));
        assert_eq!(
            env.manager.set_managed_affinity(spread, &cpus(&[3])),
            Err(Error::ResourceBusy)
        );

        // Only isolated CPUs requested: fall back to the request.
        let isolated = LineId::new(2);
        env.manager.set_managed_affinity(isolated, &cpus(&[0, 1])).unwrap();
        let _h2 = env.register_shared(2, 1, |_| IrqReturn::Handled);
        assert_eq!(env.manager.effective_affinity(isolated), Ok(cpus(&[0, 1])));
    }

    #[test]
    fn notifier_and_hint() {
        let env = TestEnv::new(8, 4);
        let id = LineId::new(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        env.manager
            .set_affinity_notifier(
                id,
                Some(Arc::new(move |line: LineId, mask: &CpuSet| {
                    assert_eq!(line, LineId::new(5));
                    assert!(mask.contains(CpuId::new(2)));
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        env.manager.set_affinity_hint(id, Some(&cpus(&[2]))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(env.manager.snapshot(id).unwrap().affinity_hint, Some(cpus(&[2])));
        env.manager.set_affinity_hint(id, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_cpu_lines_are_not_routed() {
        let env = TestEnv::new(8, 4);
        let id = LineId::new(6);
        let _handle = env
            .manager
            .register(
                id,
                IrqRequest::new("timer", DevCookie(1))
                    .flags(IrqFlags::PERCPU)
                    .hard_handler(|_| IrqReturn::Handled),
            )
            .unwrap();
        let calls = env.chip.count(MockChip::SET_AFFINITY);
        assert_eq!(
            env.manager.set_affinity(id, &cpus(&[1]), false),
            Err(Error::InvalidArgs)
        );
        assert_eq!(env.chip.count(MockChip::SET_AFFINITY), calls);
    }
}
