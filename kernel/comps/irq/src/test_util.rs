// SPDX-License-Identifier: MPL-2.0

//! Host-side stand-ins for the chip, the CPU and the scheduler.

use std::{
    cell::Cell,
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, Thread},
    time::{Duration, Instant},
};

use crate::{
    IrqManager, IrqManagerBuilder,
    action::IrqHandle,
    chip::{ChipFlags, ChipState, IrqChip, TriggerType},
    config::IrqConfig,
    cpu::CpuOps,
    line::LineSettings,
    prelude::*,
    task::{SchedPolicy, Scheduler, ThreadEntry, ThreadHandle},
};

/// A chip that records every call.
pub(crate) struct MockChip {
    name: &'static str,
    flags: ChipFlags,
    counts: [AtomicUsize; MockChip::NR_OPS],
    triggers: Mutex<BTreeMap<u32, TriggerType>>,
    affinities: Mutex<BTreeMap<u32, CpuSet>>,
    chip_states: Mutex<BTreeMap<(u32, u8), bool>>,
    affinity_busy: AtomicBool,
    resources_busy: AtomicBool,
}

impl MockChip {
    pub(crate) const MASK: usize = 0;
    pub(crate) const UNMASK: usize = 1;
    pub(crate) const ACK: usize = 2;
    pub(crate) const EOI: usize = 3;
    pub(crate) const STARTUP: usize = 4;
    pub(crate) const SHUTDOWN: usize = 5;
    pub(crate) const SET_TYPE: usize = 6;
    pub(crate) const SET_AFFINITY: usize = 7;
    pub(crate) const SET_WAKE: usize = 8;
    pub(crate) const REQUEST_RES: usize = 9;
    pub(crate) const RELEASE_RES: usize = 10;
    pub(crate) const ACTIVATE: usize = 11;
    pub(crate) const DEACTIVATE: usize = 12;
    pub(crate) const RETRIGGER: usize = 13;
    pub(crate) const NMI_SETUP: usize = 14;
    pub(crate) const NMI_TEARDOWN: usize = 15;
    const NR_OPS: usize = 16;

    pub(crate) fn new(name: &'static str) -> Self {
        Self::with_flags(name, ChipFlags::empty())
    }

    pub(crate) fn with_flags(name: &'static str, flags: ChipFlags) -> Self {
        Self {
            name,
            flags,
            counts: core::array::from_fn(|_| AtomicUsize::new(0)),
            triggers: Mutex::new(BTreeMap::new()),
            affinities: Mutex::new(BTreeMap::new()),
            chip_states: Mutex::new(BTreeMap::new()),
            affinity_busy: AtomicBool::new(false),
            resources_busy: AtomicBool::new(false),
        }
    }

    pub(crate) fn count(&self, op: usize) -> usize {
        self.counts[op].load(Ordering::SeqCst)
    }

    pub(crate) fn trigger_of(&self, line: LineId) -> Option<TriggerType> {
        self.triggers.lock().unwrap().get(&line.as_u32()).copied()
    }

    pub(crate) fn last_affinity(&self, line: LineId) -> Option<CpuSet> {
        self.affinities.lock().unwrap().get(&line.as_u32()).cloned()
    }

    pub(crate) fn set_affinity_busy(&self, busy: bool) {
        self.affinity_busy.store(busy, Ordering::SeqCst);
    }

    pub(crate) fn set_resources_busy(&self, busy: bool) {
        self.resources_busy.store(busy, Ordering::SeqCst);
    }

    fn record(&self, op: usize) {
        self.counts[op].fetch_add(1, Ordering::SeqCst);
    }
}

impl IrqChip for MockChip {
    fn name(&self) -> &str {
        self.name
    }

    fn flags(&self) -> ChipFlags {
        self.flags
    }

    fn startup(&self, line: LineId) -> Result<()> {
        self.record(Self::STARTUP);
        self.unmask(line)
    }

    fn shutdown(&self, line: LineId) -> Result<()> {
        self.record(Self::SHUTDOWN);
        self.mask(line)
    }

    fn mask(&self, _line: LineId) -> Result<()> {
        self.record(Self::MASK);
        Ok(())
    }

    fn unmask(&self, _line: LineId) -> Result<()> {
        self.record(Self::UNMASK);
        Ok(())
    }

    fn ack(&self, _line: LineId) -> Result<()> {
        self.record(Self::ACK);
        Ok(())
    }

    fn eoi(&self, _line: LineId) -> Result<()> {
        self.record(Self::EOI);
        Ok(())
    }

    fn retrigger(&self, _line: LineId) -> Result<()> {
        self.record(Self::RETRIGGER);
        Ok(())
    }

    fn set_type(&self, line: LineId, trigger: TriggerType) -> Result<()> {
        self.record(Self::SET_TYPE);
        self.triggers.lock().unwrap().insert(line.as_u32(), trigger);
        Ok(())
    }

    fn set_affinity(&self, line: LineId, cpus: &CpuSet, _force: bool) -> Result<Option<CpuSet>> {
        if self.affinity_busy.load(Ordering::SeqCst) {
            return Err(Error::ResourceBusy);
        }
        self.record(Self::SET_AFFINITY);
        self.affinities
            .lock()
            .unwrap()
            .insert(line.as_u32(), cpus.clone());
        Ok(None)
    }

    fn set_wake(&self, _line: LineId, _on: bool) -> Result<()> {
        self.record(Self::SET_WAKE);
        Ok(())
    }

    fn irq_state(&self, line: LineId, which: ChipState) -> Result<bool> {
        let states = self.chip_states.lock().unwrap();
        Ok(states
            .get(&(line.as_u32(), which as u8))
            .copied()
            .unwrap_or(false))
    }

    fn set_irq_state(&self, line: LineId, which: ChipState, value: bool) -> Result<()> {
        self.chip_states
            .lock()
            .unwrap()
            .insert((line.as_u32(), which as u8), value);
        Ok(())
    }

    fn request_resources(&self, _line: LineId) -> Result<()> {
        if self.resources_busy.load(Ordering::SeqCst) {
            return Err(Error::ChipFailure);
        }
        self.record(Self::REQUEST_RES);
        Ok(())
    }

    fn release_resources(&self, _line: LineId) {
        self.record(Self::RELEASE_RES);
    }

    fn activate(&self, _line: LineId) -> Result<()> {
        self.record(Self::ACTIVATE);
        Ok(())
    }

    fn deactivate(&self, _line: LineId) {
        self.record(Self::DEACTIVATE);
    }

    fn nmi_setup(&self, _line: LineId) -> Result<()> {
        if !self.flags.contains(ChipFlags::SUPPORTS_NMI) {
            return Err(Error::Unsupported);
        }
        self.record(Self::NMI_SETUP);
        Ok(())
    }

    fn nmi_teardown(&self, _line: LineId) {
        self.record(Self::NMI_TEARDOWN);
    }
}

thread_local! {
    static LOCAL_IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// A CPU whose local IRQ flag is per host thread.
pub(crate) struct TestCpu {
    online: Mutex<CpuSet>,
}

impl TestCpu {
    pub(crate) fn new(nr_online: usize) -> Self {
        Self {
            online: Mutex::new(CpuSet::new_full(nr_online)),
        }
    }

    pub(crate) fn set_online(&self, cpus: CpuSet) {
        *self.online.lock().unwrap() = cpus;
    }
}

impl CpuOps for TestCpu {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(0)
    }

    fn online_cpus(&self) -> CpuSet {
        self.online.lock().unwrap().clone()
    }

    fn is_local_irq_enabled(&self) -> bool {
        LOCAL_IRQ_ENABLED.with(Cell::get)
    }

    fn disable_local_irq(&self) {
        LOCAL_IRQ_ENABLED.with(|enabled| enabled.set(false));
    }

    fn enable_local_irq(&self) {
        LOCAL_IRQ_ENABLED.with(|enabled| enabled.set(true));
    }
}

/// A scheduler backed by host threads.
pub(crate) struct StdScheduler {
    spawned: Mutex<Vec<(String, SchedPolicy)>>,
    affinities: Mutex<Vec<CpuSet>>,
    joined: Arc<AtomicUsize>,
}

struct StdThreadHandle {
    thread: Thread,
    join: Mutex<Option<JoinHandle<()>>>,
    joined: Arc<AtomicUsize>,
}

impl StdScheduler {
    pub(crate) fn new() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            affinities: Mutex::new(Vec::new()),
            joined: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn spawned(&self) -> Vec<(String, SchedPolicy)> {
        self.spawned.lock().unwrap().clone()
    }

    pub(crate) fn affinities(&self) -> Vec<CpuSet> {
        self.affinities.lock().unwrap().clone()
    }

    pub(crate) fn joined(&self) -> usize {
        self.joined.load(Ordering::SeqCst)
    }
}

impl Scheduler for StdScheduler {
    fn spawn(
        &self,
        name: String,
        policy: SchedPolicy,
        entry: ThreadEntry,
    ) -> Result<Box<dyn ThreadHandle>> {
        self.spawned.lock().unwrap().push((name.clone(), policy));
        let join = thread::Builder::new()
            .name(name)
            .spawn(entry)
            .map_err(|_| Error::ResourceBusy)?;
        Ok(Box::new(StdThreadHandle {
            thread: join.thread().clone(),
            join: Mutex::new(Some(join)),
            joined: self.joined.clone(),
        }))
    }

    fn park_current(&self, has_woken: &dyn Fn() -> bool) {
        if !has_woken() {
            thread::park_timeout(Duration::from_millis(50));
        }
    }

    fn yield_now(&self) {
        thread::yield_now();
    }

    fn set_current_affinity(&self, cpus: &CpuSet) {
        self.affinities.lock().unwrap().push(cpus.clone());
    }
}

impl ThreadHandle for StdThreadHandle {
    fn unpark(&self) {
        self.thread.unpark();
    }

    fn join(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().unwrap();
            self.joined.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A registry with one mock controller serving every line.
pub(crate) struct TestEnv {
    pub(crate) manager: IrqManager,
    pub(crate) chip: Arc<MockChip>,
    pub(crate) cpu: Arc<TestCpu>,
    pub(crate) scheduler: Arc<StdScheduler>,
}

impl TestEnv {
    pub(crate) fn new(nr_lines: u32, nr_cpus: usize) -> Self {
        Self::build(
            nr_lines,
            nr_cpus,
            ChipFlags::empty(),
            LineSettings::empty(),
            IrqConfig::default(),
        )
    }

    pub(crate) fn with_chip_flags(nr_lines: u32, nr_cpus: usize, flags: ChipFlags) -> Self {
        Self::build(
            nr_lines,
            nr_cpus,
            flags,
            LineSettings::empty(),
            IrqConfig::default(),
        )
    }

    pub(crate) fn with_settings(nr_lines: u32, nr_cpus: usize, settings: LineSettings) -> Self {
        Self::build(
            nr_lines,
            nr_cpus,
            ChipFlags::empty(),
            settings,
            IrqConfig::default(),
        )
    }

    pub(crate) fn with_config(nr_lines: u32, nr_cpus: usize, config: IrqConfig) -> Self {
        Self::build(
            nr_lines,
            nr_cpus,
            ChipFlags::empty(),
            LineSettings::empty(),
            config,
        )
    }

    fn build(
        nr_lines: u32,
        nr_cpus: usize,
        flags: ChipFlags,
        settings: LineSettings,
        config: IrqConfig,
    ) -> Self {
        let chip = Arc::new(MockChip::with_flags("mock", flags));
        let cpu = Arc::new(TestCpu::new(nr_cpus));
        let scheduler = Arc::new(StdScheduler::new());
        let manager = IrqManagerBuilder::new(nr_lines, scheduler.clone(), cpu.clone())
            .config(config)
            .controller(0, nr_lines, chip.clone(), settings)
            .build()
            .unwrap();
        Self {
            manager,
            chip,
            cpu,
            scheduler,
        }
    }

    /// Installs a shared hard handler named `dev<cookie>`.
    pub(crate) fn register_shared<F>(&self, line: u32, cookie: usize, handler: F) -> IrqHandle
    where
        F: Fn(LineId) -> IrqReturn + Send + Sync + 'static,
    {
        self.manager
            .register(
                LineId::new(line),
                IrqRequest::new(&format!("dev{}", cookie), DevCookie(cookie))
                    .flags(IrqFlags::SHARED)
                    .hard_handler(handler),
            )
            .unwrap()
    }
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub(crate) fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}
