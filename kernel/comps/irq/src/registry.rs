// SPDX-License-Identifier: MPL-2.0

//! The interrupt line registry.
//!
//! The registry is built once at boot through an [`IrqManagerBuilder`] that
//! lists the controllers and the line ranges they serve. There is no global
//! instance; the kernel keeps the [`IrqManager`] wherever it sees fit.

use core::sync::atomic::Ordering;

use crate::{
    chip::{ChipState, IrqChip, TriggerType},
    config::IrqConfig,
    cpu::{CpuOps, SpinIrqGuard, lock_irq_disabled},
    line::{IrqLine, LineSettings, LineStatus},
    prelude::*,
    task::Scheduler,
};

/// The collaborators shared by every line.
pub(crate) struct Platform {
    pub(crate) cpu: Arc<dyn CpuOps>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) config: IrqConfig,
}

impl Platform {
    /// Returns the CPUs that managed lines are routed to, if restricted.
    pub(crate) fn housekeeping(&self) -> Option<CpuSet> {
        self.config
            .managed_isolated
            .as_ref()
            .map(|isolated| self.cpu.online_cpus().difference(isolated))
    }

    /// Spins on `busy`, then yields, until it returns false.
    ///
    /// There is no timeout. A stall is only reported.
    pub(crate) fn wait_while(&self, what: &str, line: LineId, mut busy: impl FnMut() -> bool) {
        let mut spins = 0;
        let mut yields: u64 = 0;
        while busy() {
            if spins < self.config.sync_spin_limit {
                spins += 1;
                core::hint::spin_loop();
                continue;
            }
            self.scheduler.yield_now();
            yields += 1;
            if Some(yields) == self.config.sync_stall_warn {
                log::warn!("irq {}: still waiting for {} after {} yields", line, what, yields);
            }
        }
    }
}

/// The process-wide state that is not owned by any single line.
pub(crate) struct GlobalState {
    pub(crate) default_affinity: CpuSet,
    pub(crate) unhandled_total: u64,
    pub(crate) spurious_disabled: u64,
    pub(crate) wakeup_event: Option<LineId>,
}

/// The interrupt core.
///
/// It owns every interrupt line of the system and exposes the operations that
/// drivers, the power-management code and the low-level trap entry use.
pub struct IrqManager {
    lines: Box<[Option<Arc<IrqLine>>]>,
    pub(crate) platform: Arc<Platform>,
    global: spin::Mutex<GlobalState>,
}

struct Controller {
    base: u32,
    count: u32,
    chip: Arc<dyn IrqChip>,
    settings: LineSettings,
}

/// Builds an [`IrqManager`].
///
/// # Example
///
/// ```ignore
/// let manager = IrqManagerBuilder::new(64, scheduler, cpu)
///     .config(IrqConfig::from_cmdline(cmdline))
///     .controller(0, 32, pic, LineSettings::empty())
///     .build()?;
/// ```
pub struct IrqManagerBuilder {
    nr_lines: u32,
    scheduler: Arc<dyn Scheduler>,
    cpu: Arc<dyn CpuOps>,
    config: IrqConfig,
    controllers: Vec<Controller>,
}

impl IrqManagerBuilder {
    /// Starts building a registry with room for `nr_lines` lines.
    pub fn new(nr_lines: u32, scheduler: Arc<dyn Scheduler>, cpu: Arc<dyn CpuOps>) -> Self {
        Self {
            nr_lines,
            scheduler,
            cpu,
            config: IrqConfig::default(),
            controllers: Vec::new(),
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: IrqConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers `chip` as the controller of lines `base..base + count`.
    pub fn controller(
        mut self,
        base: u32,
        count: u32,
        chip: Arc<dyn IrqChip>,
        settings: LineSettings,
    ) -> Self {
        self.controllers.push(Controller {
            base,
            count,
            chip,
            settings,
        });
        self
    }

    /// Creates the lines of all controllers.
    ///
    /// Fails with [`Error::InvalidArgs`] if a controller range exceeds the
    /// registry or overlaps another one.
    pub fn build(self) -> Result<IrqManager> {
        let platform = Arc::new(Platform {
            cpu: self.cpu,
            scheduler: self.scheduler,
            config: self.config,
        });

        let mut lines: Vec<Option<Arc<IrqLine>>> = Vec::new();
        lines.resize_with(self.nr_lines as usize, || None);
        for controller in self.controllers {
            let end = controller
                .base
                .checked_add(controller.count)
                .filter(|end| *end <= self.nr_lines)
                .ok_or(Error::InvalidArgs)?;
            for raw in controller.base..end {
                let slot = &mut lines[raw as usize];
                if slot.is_some() {
                    log::error!(
                        "irq: controller {} overlaps line {}",
                        controller.chip.name(),
                        raw
                    );
                    return Err(Error::InvalidArgs);
                }
                *slot = Some(Arc::new(IrqLine::new(
                    LineId::new(raw),
                    controller.chip.clone(),
                    controller.settings,
                    platform.clone(),
                )));
            }
            log::debug!(
                "irq: lines {}..{} served by {}",
                controller.base,
                end,
                controller.chip.name()
            );
        }

        let default_affinity = match &platform.config.default_affinity {
            Some(set) => set.clone(),
            None => platform.cpu.online_cpus(),
        };

        Ok(IrqManager {
            lines: lines.into_boxed_slice(),
            global: spin::Mutex::new(GlobalState {
                default_affinity,
                unhandled_total: 0,
                spurious_disabled: 0,
                wakeup_event: None,
            }),
            platform,
        })
    }
}

impl IrqManager {
    /// Looks up a line.
    pub fn lookup(&self, id: LineId) -> Result<&Arc<IrqLine>> {
        self.lines
            .get(id.as_usize())
            .and_then(Option::as_ref)
            .ok_or(Error::NotFound)
    }

    /// Iterates over all lines.
    pub fn lines(&self) -> impl Iterator<Item = &Arc<IrqLine>> + '_ {
        self.lines.iter().flatten()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &IrqConfig {
        &self.platform.config
    }

    pub(crate) fn global(&self) -> SpinIrqGuard<'_, GlobalState> {
        lock_irq_disabled(&self.global, &*self.platform.cpu)
    }

    /// Undoes one [`Self::disable`] or [`Self::disable_nosync`].
    ///
    /// The line is started up when the depth drops to zero, and an edge that
    /// arrived while it was disabled is replayed.
    ///
    /// # Panics
    ///
    /// Panics if the line is not disabled, which is a bug in the caller.
    pub fn enable(&self, id: LineId) -> Result<()> {
        let line = self.lookup(id)?;
        let default_affinity = self.default_affinity();
        let _bus = line.bus_lock();
        let mut state = line.lock();
        line.enable_nested(&mut state, &default_affinity);
        Ok(())
    }

    /// Disables a line without waiting for running handlers.
    ///
    /// Disables are nested. This may be called from hard-interrupt context.
    pub fn disable_nosync(&self, id: LineId) -> Result<()> {
        let line = self.lookup(id)?;
        let _bus = line.bus_lock();
        let mut state = line.lock();
        line.disable_nested(&mut state);
        Ok(())
    }

    /// Disables a line and waits for its hard and deferred handlers.
    pub fn disable(&self, id: LineId) -> Result<()> {
        self.disable_nosync(id)?;
        self.synchronize_irq(id)
    }

    /// Disables a line and waits for its hard handlers only.
    ///
    /// Returns `false` if a deferred handler is still active.
    pub fn disable_hardirq(&self, id: LineId) -> Result<bool> {
        self.disable_nosync(id)?;
        self.synchronize_hardirq(id)
    }

    /// Waits until no hard-context handler of the line runs on any CPU.
    ///
    /// Returns `false` if a deferred handler is still active.
    pub fn synchronize_hardirq(&self, id: LineId) -> Result<bool> {
        let line = self.lookup(id)?;
        line.synchronize_hardirq(false);
        Ok(line.threads_active.load(Ordering::Acquire) == 0)
    }

    /// Waits until no handler of the line runs, neither in hard context nor
    /// in a worker.
    pub fn synchronize_irq(&self, id: LineId) -> Result<()> {
        let line = self.lookup(id)?;
        line.synchronize_hardirq(true);
        line.wait_for_threads();
        Ok(())
    }

    /// Programs the trigger type of a line.
    pub fn set_irq_type(&self, id: LineId, trigger: TriggerType) -> Result<()> {
        let line = self.lookup(id)?;
        let _bus = line.bus_lock();
        let mut state = line.lock();
        line.set_trigger(&mut state, trigger)
    }

    /// Reads a hardware state bit of a line.
    pub fn irq_chip_state(&self, id: LineId, which: ChipState) -> Result<bool> {
        let line = self.lookup(id)?;
        let _bus = line.bus_lock();
        let _state = line.lock();
        line.chip().irq_state(id, which)
    }

    /// Forces a hardware state bit of a line.
    pub fn set_irq_chip_state(&self, id: LineId, which: ChipState, value: bool) -> Result<()> {
        let line = self.lookup(id)?;
        let _bus = line.bus_lock();
        let _state = line.lock();
        line.chip().set_irq_state(id, which, value)
    }

    /// Enables a per-CPU line on the current CPU.
    pub fn enable_percpu(&self, id: LineId, trigger: TriggerType) -> Result<()> {
        let line = self.lookup(id)?;
        let cpu = self.platform.cpu.current_cpu();
        let mut state = line.lock();
        if !state.status.contains(LineStatus::PER_CPU) {
            return Err(Error::InvalidArgs);
        }
        if trigger != TriggerType::None {
            line.set_trigger(&mut state, trigger)?;
        }
        line.chip_done("enable", line.chip().enable(id));
        state.percpu_enabled.add(cpu);
        Ok(())
    }

    /// Disables a per-CPU line on the current CPU.
    pub fn disable_percpu(&self, id: LineId) -> Result<()> {
        let line = self.lookup(id)?;
        let cpu = self.platform.cpu.current_cpu();
        let mut state = line.lock();
        if !state.status.contains(LineStatus::PER_CPU) {
            return Err(Error::InvalidArgs);
        }
        line.chip_done("disable", line.chip().disable(id));
        state.percpu_enabled.remove(cpu);
        Ok(())
    }

    /// Returns whether a per-CPU line is enabled on the current CPU.
    pub fn percpu_enabled(&self, id: LineId) -> Result<bool> {
        let line = self.lookup(id)?;
        let cpu = self.platform.cpu.current_cpu();
        Ok(line.lock().percpu_enabled.contains(cpu))
    }

    /// Returns whether any handler is installed on the line.
    pub fn has_action(&self, id: LineId) -> bool {
        self.lookup(id)
            .map(|line| line.lock().has_action())
            .unwrap_or(false)
    }

    /// Returns whether a request with `flags` could be installed right now.
    pub fn can_request(&self, id: LineId, flags: IrqFlags) -> bool {
        let Ok(line) = self.lookup(id) else {
            return false;
        };
        if line.settings().contains(LineSettings::NO_REQUEST) {
            return false;
        }
        let state = line.lock();
        match state.chain.first() {
            None => true,
            Some(first) => {
                flags.contains(IrqFlags::SHARED) && first.flags.contains(IrqFlags::SHARED)
            }
        }
    }
}

impl IrqLine {
    /// Waits for the hard-context handlers of the line to finish.
    ///
    /// With `sync_chip`, also waits for an occurrence that the chip has
    /// delivered but no CPU has picked up yet.
    pub(crate) fn synchronize_hardirq(&self, sync_chip: bool) {
        loop {
            self.platform
                .wait_while("hard irq handlers", self.id(), || {
                    self.in_progress.load(Ordering::Acquire)
                });

            let state = self.lock();
            let mut in_progress = self.in_progress.load(Ordering::Acquire);
            if !in_progress && sync_chip {
                // A chip that cannot tell is treated as idle.
                in_progress = self
                    .chip()
                    .irq_state(self.id(), ChipState::Active)
                    .unwrap_or(false);
            }
            drop(state);
            if !in_progress {
                return;
            }
        }
    }

    /// Waits until no worker of the line is active.
    pub(crate) fn wait_for_threads(&self) {
        self.platform.wait_while("irq threads", self.id(), || {
            self.threads_active.load(Ordering::Acquire) != 0
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{MockChip, StdScheduler, TestCpu, TestEnv};

    fn builder() -> IrqManagerBuilder {
        IrqManagerBuilder::new(8, Arc::new(StdScheduler::new()), Arc::new(TestCpu::new(1)))
    }

    #[test]
    fn lookup_unknown_line() {
        let env = TestEnv::new(8, 1);
        assert_eq!(env.manager.lookup(LineId::new(8)).err(), Some(Error::NotFound));
        assert!(env.manager.lookup(LineId::new(7)).is_ok());
        assert_eq!(env.manager.lines().count(), 8);
    }

    #[test]
    fn overlapping_controllers_are_rejected() {
        let chip = Arc::new(MockChip::new("a"));
        let result = builder()
            .controller(0, 4, chip.clone(), LineSettings::empty())
            .controller(3, 2, chip, LineSettings::empty())
            .build();
        assert_eq!(result.err(), Some(Error::InvalidArgs));
    }

    #[test]
    fn controller_out_of_range_is_rejected() {
        let chip = Arc::new(MockChip::new("a"));
        let result = builder()
            .controller(6, 4, chip, LineSettings::empty())
            .build();
        assert_eq!(result.err(), Some(Error::InvalidArgs));
    }

    #[test]
    #[should_panic(expected = "unbalanced enable")]
    fn unbalanced_enable_panics() {
        let env = TestEnv::new(4, 1);
        let _handle = env.register_shared(1, 1, |_| IrqReturn::Handled);
        assert_eq!(env.manager.lookup(LineId::new(1)).unwrap().depth(), 0);
        let _ = env.manager.enable(LineId::new(1));
    }

    #[test]
    fn disable_is_nested() {
        let env = TestEnv::new(4, 1);
        let _handle = env.register_shared(2, 1, |_| IrqReturn::Handled);
        let id = LineId::new(2);
        env.manager.disable(id).unwrap();
        env.manager.disable_nosync(id).unwrap();
        let line = env.manager.lookup(id).unwrap();
        assert_eq!(line.depth(), 2);
        assert!(line.status().contains(LineStatus::DISABLED | LineStatus::MASKED));
        env.manager.enable(id).unwrap();
        assert!(line.status().contains(LineStatus::DISABLED));
        env.manager.enable(id).unwrap();
        assert_eq!(line.depth(), 0);
        assert!(!line.status().intersects(LineStatus::DISABLED | LineStatus::MASKED));
        assert!(env.manager.disable_hardirq(id).unwrap());
    }

    #[test]
    fn enable_replays_pending_edge() {
        let env = TestEnv::new(4, 1);
        let _handle = env.register_shared(3, 1, |_| IrqReturn::Handled);
        let id = LineId::new(3);
        env.manager.disable_nosync(id).unwrap();
        env.manager.handle_irq(id).unwrap();
        assert!(env.manager.lookup(id).unwrap().status().contains(LineStatus::PENDING));
        env.manager.enable(id).unwrap();
        assert!(!env.manager.lookup(id).unwrap().status().contains(LineStatus::PENDING));
        assert_eq!(env.chip.count(MockChip::RETRIGGER), 1);
    }

    #[test]
    fn can_request_respects_sharing() {
        let env = TestEnv::new(4, 1);
        let id = LineId::new(0);
        assert!(env.manager.can_request(id, IrqFlags::empty()));
        let _handle = env.register_shared(0, 1, |_| IrqReturn::Handled);
        assert!(env.manager.has_action(id));
        assert!(env.manager.can_request(id, IrqFlags::SHARED));
        assert!(!env.manager.can_request(id, IrqFlags::empty()));
        assert!(!env.manager.can_request(LineId::new(9), IrqFlags::SHARED));
    }

    #[test]
    fn percpu_enable_tracks_current_cpu() {
        let env = TestEnv::new(4, 2);
        let id = LineId::new(1);
        let _handle = env
            .manager
            .register(
                id,
                IrqRequest::new("timer", DevCookie(1))
                    .flags(IrqFlags::PERCPU)
                    .hard_handler(|_| IrqReturn::Handled),
            )
            .unwrap();
        assert!(!env.manager.percpu_enabled(id).unwrap());
        env.manager.enable_percpu(id, TriggerType::None).unwrap();
        assert!(env.manager.percpu_enabled(id).unwrap());
        env.manager.disable_percpu(id).unwrap();
        assert!(!env.manager.percpu_enabled(id).unwrap());
        assert_eq!(
            env.manager.enable_percpu(LineId::new(2), TriggerType::None),
            Err(Error::InvalidArgs)
        );
    }

    #[test]
    fn chip_state_access() {
        let env = TestEnv::new(4, 1);
        let id = LineId::new(2);
        env.manager.set_irq_chip_state(id, ChipState::Pending, true).unwrap();
        assert_eq!(env.manager.irq_chip_state(id, ChipState::Pending), Ok(true));
        assert_eq!(env.manager.irq_chip_state(id, ChipState::LineLevel), Ok(false));
    }
}
