// SPDX-License-Identifier: MPL-2.0

//! The handler chain of a line and the negotiation of shared lines.
//!
//! The chain is a copy-on-write snapshot: installing or removing a handler
//! publishes a new slice under the line lock, while the dispatch path clones
//! the current slice and runs it without holding the lock.

use core::sync::atomic::Ordering;

use crate::{
    action::{HandlerKind, IrqAction, IrqHandle},
    chip::{ChipFlags, TriggerType},
    line::{IrqLine, LineSettings, LineState, LineStatus},
    pm,
    prelude::*,
    registry::IrqManager,
};

/// The context a handler ended up in, see [`IrqManager::request_any_context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestContext {
    /// The handler runs in hard-interrupt context.
    HardIrq,
    /// The handler runs in the worker of the parent line.
    Nested,
}

impl IrqManager {
    /// Installs a handler on a line.
    ///
    /// The first handler of a line reserves the chip resources, programs the
    /// trigger type and starts the line up unless [`IrqFlags::NO_AUTOEN`] is
    /// given. Later handlers must agree with the installed ones on sharing,
    /// trigger type, oneshot-ness and per-CPU-ness.
    ///
    /// # Errors
    ///
    /// - [`Error::SharingConflict`] if the request does not fit the handlers
    ///   already installed, or asks for `SHARED` together with `NO_AUTOEN`.
    /// - [`Error::ResourceBusy`] if all oneshot bits of the line are taken
    ///   or the chip cannot reserve its resources.
    /// - [`Error::InvalidArgs`] for malformed requests.
    pub fn register(&self, id: LineId, request: IrqRequest) -> Result<IrqHandle> {
        let line = self.lookup(id)?.clone();
        validate_request(&line, &request)?;
        self.setup_irq(&line, request)
    }

    /// Installs a handler in hard-interrupt context, or as a deferred handler
    /// if the line is demultiplexed from the worker of a parent line.
    pub fn request_any_context(
        &self,
        id: LineId,
        mut request: IrqRequest,
    ) -> Result<(IrqHandle, RequestContext)> {
        let line = self.lookup(id)?;
        if line.settings().contains(LineSettings::NESTED_THREAD) {
            if let Some(hard) = request.hard.take() {
                request.thread = Some(hard);
            }
            let handle = self.register(id, request)?;
            return Ok((handle, RequestContext::Nested));
        }
        let handle = self.register(id, request)?;
        Ok((handle, RequestContext::HardIrq))
    }

    /// Removes the handler named by `handle`.
    ///
    /// Returns only once no hard-context handler of the line is running and
    /// the worker of the handler has exited. The wait has no timeout.
    pub fn unregister(&self, handle: IrqHandle) -> Result<()> {
        let line = self.lookup(handle.line)?.clone();
        self.free_action(&line, |action| action.id == handle.action)
    }

    /// Removes the handler of the device identified by `cookie`.
    pub fn free_irq(&self, id: LineId, cookie: DevCookie) -> Result<()> {
        let line = self.lookup(id)?.clone();
        self.free_action(&line, |action| action.cookie == cookie)
    }

    /// Installs a handler that is delivered as an NMI.
    ///
    /// NMI requests must be per-CPU and must not auto-enable. They can not be
    /// shared or threaded. A chip that cannot deliver NMIs, or sits behind a
    /// bus lock, fails the request with [`Error::ConfigError`].
    pub fn request_nmi(&self, id: LineId, request: IrqRequest) -> Result<IrqHandle> {
        let line = self.lookup(id)?.clone();
        validate_request(&line, &request)?;
        let flags = request.flags;
        if flags.intersects(IrqFlags::SHARED | IrqFlags::COND_SUSPEND)
            || !flags.contains(IrqFlags::PERCPU)
            || request.hard.is_none()
        {
            return Err(Error::InvalidArgs);
        }
        let autoenable = !line.settings().contains(LineSettings::NO_AUTOEN)
            && !flags.contains(IrqFlags::NO_AUTOEN);
        if autoenable || line.settings().contains(LineSettings::NO_REQUEST) {
            return Err(Error::InvalidArgs);
        }
        if !line.chip().flags().contains(ChipFlags::SUPPORTS_NMI) || line.chip().has_bus_lock() {
            log::error!("irq {}: chip {} cannot deliver NMIs", id, line.chip_name());
            return Err(Error::ConfigError);
        }

        let request = request.flags(flags | IrqFlags::NO_THREAD | IrqFlags::NO_BALANCING);
        let handle = self.setup_irq(&line, request)?;

        let setup = {
            let mut state = line.lock();
            state.status.insert(LineStatus::NMI);
            line.nmi_delivery.store(true, Ordering::Release);
            line.chip().nmi_setup(id)
        };
        if let Err(err) = setup {
            log::error!("irq {}: NMI setup failed: {}", id, err);
            self.cleanup_nmi(&line, handle)?;
            return Err(Error::InvalidArgs);
        }
        Ok(handle)
    }

    /// Removes an NMI handler.
    ///
    /// The line should have been disabled before. If it was not, it is
    /// disabled here with a warning.
    pub fn free_nmi(&self, handle: IrqHandle) -> Result<()> {
        let line = self.lookup(handle.line)?.clone();
        {
            let mut state = line.lock();
            if !state.status.contains(LineStatus::NMI) {
                return Err(Error::InvalidArgs);
            }
            if state.depth == 0 {
                log::warn!("irq {}: freeing an NMI that is still enabled", line.id());
                line.disable_nested(&mut state);
            }
        }
        self.cleanup_nmi(&line, handle)
    }

    fn cleanup_nmi(&self, line: &Arc<IrqLine>, handle: IrqHandle) -> Result<()> {
        line.chip().nmi_teardown(line.id());
        let result = self.free_action(line, |action| action.id == handle.action);
        line.lock().status.remove(LineStatus::NMI);
        line.nmi_delivery.store(false, Ordering::Release);
        result
    }

    fn setup_irq(&self, line: &Arc<IrqLine>, request: IrqRequest) -> Result<IrqHandle> {
        let action = self.build_action(line, request)?;

        if action.has_thread() {
            self.spawn_worker(line, &action)?;
            if let Some(secondary) = action.secondary() {
                if let Err(err) = self.spawn_worker(line, secondary) {
                    stop_worker(&action);
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.install(line, &action) {
            stop_worker(&action);
            if let Some(secondary) = action.secondary() {
                stop_worker(secondary);
            }
            return Err(err);
        }

        log::debug!(
            "irq {}: installed handler {} ({:?})",
            line.id(),
            action.name,
            action.flags
        );
        Ok(IrqHandle {
            line: line.id(),
            action: action.id,
            cookie: action.cookie,
        })
    }

    // Chooses the wiring of the callbacks.
    fn build_action(&self, line: &IrqLine, request: IrqRequest) -> Result<Arc<IrqAction>> {
        let IrqRequest {
            name,
            cookie,
            mut flags,
            hard,
            thread,
        } = request;

        let kind = if line.settings().contains(LineSettings::NESTED_THREAD) {
            let Some(thread) = thread else {
                log::error!("irq {}: nested line needs a deferred handler ({})", line.id(), name);
                return Err(Error::InvalidArgs);
            };
            HandlerKind::Nested { thread }
        } else {
            match hard {
                Some(primary) if self.should_force_thread(line, flags) => {
                    flags |= IrqFlags::ONESHOT;
                    let secondary = thread.map(|thread| {
                        Arc::new(IrqAction::new(
                            line.alloc_action_id(),
                            name.clone(),
                            cookie,
                            flags,
                            HandlerKind::ForcedSecondary { thread },
                        ))
                    });
                    HandlerKind::ForcedThread { primary, secondary }
                }
                hard => HandlerKind::Direct { hard, thread },
            }
        };

        // A chip that masks by itself needs no oneshot protocol.
        if line.chip().flags().contains(ChipFlags::ONESHOT_SAFE) {
            flags.remove(IrqFlags::ONESHOT);
        }

        Ok(Arc::new(IrqAction::new(
            line.alloc_action_id(),
            name,
            cookie,
            flags,
            kind,
        )))
    }

    fn should_force_thread(&self, line: &IrqLine, flags: IrqFlags) -> bool {
        self.platform.config.force_threads
            && !line.settings().contains(LineSettings::NO_THREAD)
            && !flags.intersects(IrqFlags::NO_THREAD | IrqFlags::PERCPU | IrqFlags::ONESHOT)
    }

    fn install(&self, line: &IrqLine, action: &Arc<IrqAction>) -> Result<()> {
        let _request = line.request_lock.lock();
        let default_affinity = self.default_affinity();
        let _bus = line.bus_lock();

        let first = !line.lock().has_action();
        if first {
            if let Err(err) = line.chip().request_resources(line.id()) {
                log::error!(
                    "irq {}: {} failed to request resources on chip {}: {}",
                    line.id(),
                    action.name,
                    line.chip_name(),
                    err
                );
                return Err(Error::ResourceBusy);
            }
        }

        let result = {
            let mut state = line.lock();
            install_locked(line, &mut state, action, &default_affinity)
        };
        if result.is_err() && first {
            line.chip().release_resources(line.id());
        }
        result
    }

    fn free_action(
        &self,
        line: &Arc<IrqLine>,
        is_target: impl Fn(&IrqAction) -> bool,
    ) -> Result<()> {
        let _request = line.request_lock.lock();

        let (action, now_empty) = {
            let _bus = line.bus_lock();
            let mut state = line.lock();
            let Some(pos) = state.chain.iter().position(|action| is_target(action)) else {
                log::warn!("irq {}: trying to free a handler that is not installed", line.id());
                return Err(Error::NotFound);
            };
            let action = state.chain[pos].clone();
            state.chain = state
                .chain
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != pos)
                .map(|(_, action)| action.clone())
                .collect::<Vec<_>>()
                .into();
            pm::remove_action(&mut state, action.flags);

            let now_empty = !state.has_action();
            if now_empty {
                line.shutdown(&mut state);
                state.affinity_hint = None;
            }
            (action, now_empty)
        };

        // Bus changes are flushed before waiting, and the chip is asked
        // whether an occurrence is still in flight.
        line.synchronize_hardirq(true);

        stop_worker(&action);
        if let Some(secondary) = action.secondary() {
            stop_worker(secondary);
        }

        if now_empty {
            let _bus = line.bus_lock();
            line.deactivate(&mut line.lock());
            line.chip().release_resources(line.id());
        }

        log::debug!("irq {}: removed handler {}", line.id(), action.name);
        Ok(())
    }
}

fn validate_request(line: &IrqLine, request: &IrqRequest) -> Result<()> {
    let flags = request.flags;
    if flags.contains(IrqFlags::SHARED | IrqFlags::NO_AUTOEN) {
        log::warn!(
            "irq {}: {} asks for a shared line without auto-enable",
            line.id(),
            request.name
        );
        return Err(Error::SharingConflict);
    }
    if flags.contains(IrqFlags::COND_SUSPEND)
        && (!flags.contains(IrqFlags::SHARED) || flags.contains(IrqFlags::NO_SUSPEND))
    {
        return Err(Error::InvalidArgs);
    }
    if line.settings().contains(LineSettings::NO_REQUEST) {
        return Err(Error::InvalidArgs);
    }
    if request.hard.is_none() && request.thread.is_none() {
        return Err(Error::InvalidArgs);
    }
    if TriggerType::from_bits((flags & IrqFlags::TRIGGER_MASK).bits()).is_none() {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

fn install_locked(
    line: &IrqLine,
    state: &mut LineState,
    action: &Arc<IrqAction>,
    default_affinity: &CpuSet,
) -> Result<()> {
    let flags = action.flags;
    let requested = TriggerType::from_bits((flags & IrqFlags::TRIGGER_MASK).bits())
        .ok_or(Error::InvalidArgs)?;
    // A request without trigger bits takes whatever the line uses.
    let new_trigger = match requested {
        TriggerType::None => state.trigger,
        trigger => trigger,
    };

    let shared = state.has_action();
    let mut thread_mask = 0usize;
    if shared {
        if state.status.contains(LineStatus::NMI) {
            log::error!("irq {}: NMI lines can not be shared ({})", line.id(), action.name);
            return Err(Error::SharingConflict);
        }

        let old_trigger = if state.status.contains(LineStatus::TRIGGER_SET) {
            state.trigger
        } else {
            state.trigger = new_trigger;
            state.status.insert(LineStatus::TRIGGER_SET);
            new_trigger
        };

        let old = &state.chain[0];
        let mismatch = !(old.flags & flags).contains(IrqFlags::SHARED)
            || old_trigger != new_trigger
            || (old.flags ^ flags).intersects(IrqFlags::ONESHOT | IrqFlags::PERCPU);
        if mismatch {
            if !flags.contains(IrqFlags::PROBE_SHARED) {
                log::error!(
                    "irq {}: flags mismatch, {:?} ({}) vs. {:?} ({})",
                    line.id(),
                    flags,
                    action.name,
                    old.flags,
                    old.name
                );
            }
            return Err(Error::SharingConflict);
        }
        if state.chain.iter().any(|old| old.cookie == action.cookie) {
            log::error!("irq {}: cookie {:?} is already installed", line.id(), action.cookie);
            return Err(Error::InvalidArgs);
        }

        thread_mask = state
            .chain
            .iter()
            .fold(0, |mask, old| mask | old.thread_mask());
    }

    if flags.contains(IrqFlags::ONESHOT) {
        if thread_mask == !0 {
            return Err(Error::ResourceBusy);
        }
        action
            .thread_mask
            .store(1 << (!thread_mask).trailing_zeros(), Ordering::Relaxed);
    } else if matches!(action.kind, HandlerKind::Direct { hard: None, .. })
        && !line.chip().flags().contains(ChipFlags::ONESHOT_SAFE)
    {
        // The default primary handler would unmask a level line that the
        // device still asserts.
        log::error!(
            "irq {}: threaded handler {} without a hard handler needs ONESHOT",
            line.id(),
            action.name
        );
        return Err(Error::InvalidArgs);
    }

    if !shared {
        if requested != TriggerType::None {
            line.set_trigger(state, requested)?;
        }
        line.activate(state)?;

        state
            .status
            .remove(LineStatus::SPURIOUS_DISABLED | LineStatus::ONESHOT | LineStatus::PER_CPU);
        if flags.contains(IrqFlags::PERCPU) {
            state.status.insert(LineStatus::PER_CPU);
        }
        if flags.contains(IrqFlags::ONESHOT) {
            state.status.insert(LineStatus::ONESHOT);
        }
        if flags.contains(IrqFlags::NO_BALANCING) {
            state.status.insert(LineStatus::NO_BALANCING);
        }

        if !flags.contains(IrqFlags::NO_AUTOEN)
            && !line.settings().contains(LineSettings::NO_AUTOEN)
        {
            line.startup(state, true, default_affinity);
        } else {
            state.depth = 1;
        }
    }

    let mut chain: Vec<Arc<IrqAction>> = state.chain.iter().cloned().collect();
    chain.push(action.clone());
    state.chain = chain.into();

    pm::install_action(line.id(), state, flags);

    state.irq_count = 0;
    state.unhandled = 0;

    if shared && state.status.contains(LineStatus::SPURIOUS_DISABLED) {
        state.status.remove(LineStatus::SPURIOUS_DISABLED);
        line.enable_nested(state, default_affinity);
    }
    Ok(())
}

// Stops the worker of an action, letting it run once more if it was woken.
pub(crate) fn stop_worker(action: &IrqAction) {
    if let Some(worker) = action.worker.get() {
        action.should_stop.store(true, Ordering::Release);
        worker.unpark();
        worker.join();
    }
}
