// SPDX-License-Identifier: MPL-2.0

//! Deferred workers.
//!
//! Every action with a deferred handler owns one worker thread. The worker
//! parks until the dispatch path sets its `RUNTHREAD` flag, runs the deferred
//! handler, and then releases the oneshot bit of its action so that the line
//! can be unmasked once every woken worker is done.

use alloc::format;
use core::sync::atomic::Ordering;

use crate::{
    action::{HandlerKind, IrqAction, thread_flags},
    cpu::disable_local,
    dispatch::wake_thread,
    line::{IrqLine, LineStatus},
    prelude::*,
    registry::IrqManager,
    task::{IRQ_THREAD_PRIORITY, SchedPolicy},
};

impl IrqManager {
    pub(crate) fn spawn_worker(&self, line: &Arc<IrqLine>, action: &Arc<IrqAction>) -> Result<()> {
        let name = match action.kind {
            HandlerKind::ForcedSecondary { .. } => format!("irq/{}-s-{}", line.id(), action.name),
            _ => format!("irq/{}-{}", line.id(), action.name),
        };
        // The worker moves itself to the line's affinity before its first run.
        action.test_and_set_thread_flag(thread_flags::AFFINITY);

        let worker_line = line.clone();
        let worker_action = action.clone();
        let handle = self
            .platform
            .scheduler
            .spawn(
                name,
                SchedPolicy::Fifo {
                    priority: IRQ_THREAD_PRIORITY,
                },
                Box::new(move || worker_main(&worker_line, &worker_action)),
            )
            .inspect_err(|err| {
                log::error!(
                    "irq {}: failed to create the worker of {}: {}",
                    line.id(),
                    action.name,
                    err
                )
            })?;
        action.worker.call_once(|| handle);
        Ok(())
    }
}

fn worker_main(line: &IrqLine, action: &IrqAction) {
    log::trace!("irq {}: worker of {} started", line.id(), action.name);
    while wait_for_interrupt(line, action) {
        check_affinity(line, action);

        let ret = if action.is_forced() {
            forced_thread_fn(line, action)
        } else {
            thread_fn(line, action)
        };
        if ret == IrqReturn::WakeThread {
            wake_secondary(line, action);
        }

        line.threads_active.fetch_sub(1, Ordering::AcqRel);
    }
    log::trace!("irq {}: worker of {} exits", line.id(), action.name);
}

// Returns `false` once the worker should exit. A wake-up that raced with the
// stop request is still served.
fn wait_for_interrupt(line: &IrqLine, action: &IrqAction) -> bool {
    let scheduler = &line.platform.scheduler;
    loop {
        if action.should_stop.load(Ordering::Acquire) {
            return action.test_and_clear_thread_flag(thread_flags::RUNTHREAD);
        }
        if action.test_and_clear_thread_flag(thread_flags::RUNTHREAD) {
            return true;
        }
        scheduler.park_current(&|| {
            action.test_thread_flag(thread_flags::RUNTHREAD)
                || action.should_stop.load(Ordering::Acquire)
        });
    }
}

fn check_affinity(line: &IrqLine, action: &IrqAction) {
    if !action.test_and_clear_thread_flag(thread_flags::AFFINITY) {
        return;
    }
    let cpus = {
        let state = line.lock();
        if state.effective.is_empty() {
            state.affinity.clone()
        } else {
            state.effective.clone()
        }
    };
    line.platform.scheduler.set_current_affinity(&cpus);
}

fn thread_fn(line: &IrqLine, action: &IrqAction) -> IrqReturn {
    let ret = action.call_thread(line.id());
    if ret == IrqReturn::Handled {
        line.threads_handled.fetch_add(1, Ordering::Relaxed);
    }
    finalize_oneshot(line, action);
    ret
}

// A force-threaded hard handler sees the same environment as in hard context
// unless the kernel is fully preemptible.
fn forced_thread_fn(line: &IrqLine, action: &IrqAction) -> IrqReturn {
    let _irq_guard = (!line.platform.config.preempt_rt).then(|| disable_local(&*line.platform.cpu));
    thread_fn(line, action)
}

fn wake_secondary(line: &IrqLine, action: &IrqAction) {
    let Some(secondary) = action.secondary() else {
        action.warn_once(line.id(), "asked for a deferred handler it does not have");
        return;
    };
    let _state = line.lock();
    wake_thread(line, secondary);
}

/// Releases the oneshot bit of `action` and unmasks the line if it was the
/// last one outstanding.
fn finalize_oneshot(line: &IrqLine, action: &IrqAction) {
    if matches!(action.kind, HandlerKind::ForcedSecondary { .. }) {
        return;
    }
    loop {
        let bus = line.bus_lock();
        let mut state = line.lock();
        if !state.status.contains(LineStatus::ONESHOT) {
            return;
        }
        // The hard handlers of another occurrence may be about to set our bit
        // again. Wait for them.
        if line.in_progress.load(Ordering::Acquire) {
            drop(state);
            drop(bus);
            core::hint::spin_loop();
            continue;
        }
        // Woken again already; the next run finalizes.
        if action.test_thread_flag(thread_flags::RUNTHREAD) {
            return;
        }

        let mask = action.thread_mask();
        let remaining = line.threads_oneshot.fetch_and(!mask, Ordering::AcqRel) & !mask;
        if remaining == 0
            && !state.status.contains(LineStatus::DISABLED)
            && state.status.contains(LineStatus::MASKED)
        {
            line.unmask(&mut state);
        }
        return;
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        config::IrqConfig,
        test_util::{MockChip, TestEnv, wait_for},
    };

    #[test]
    fn worker_is_named_and_prioritized() {
        let env = TestEnv::new(4, 2);
        let handle = env
            .manager
            .register(
                LineId::new(1),
                IrqRequest::new("eth0", DevCookie(1))
                    .flags(IrqFlags::ONESHOT)
                    .thread_handler(|_| IrqReturn::Handled),
            )
            .unwrap();
        let spawned = env.scheduler.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].0, "irq/1-eth0");
        assert_eq!(spawned[0].1, SchedPolicy::Fifo { priority: IRQ_THREAD_PRIORITY });
        env.manager.unregister(handle).unwrap();
    }

    #[test]
    fn rewoken_worker_keeps_line_masked() {
        let env = TestEnv::new(4, 1);
        let id = LineId::new(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let rx = std::sync::Mutex::new(rx);
        let entered_tx = std::sync::Mutex::new(entered_tx);
        let handle = env
            .manager
            .register(
                id,
                IrqRequest::new("disk", DevCookie(1))
                    .flags(IrqFlags::ONESHOT)
                    .thread_handler(move |_| {
                        entered_tx.lock().unwrap().send(()).unwrap();
                        rx.lock().unwrap().recv().unwrap();
                        counter.fetch_add(1, Ordering::SeqCst);
                        IrqReturn::Handled
                    }),
            )
            .unwrap();
        let line = env.manager.lookup(id).unwrap();
        let unmasks = env.chip.count(MockChip::UNMASK);

        env.manager.handle_irq(id).unwrap();
        entered_rx.recv().unwrap();
        // The line is masked, so a second occurrence can only come from a
        // software wake-up.
        env.manager.wake_thread(id, DevCookie(1)).unwrap();
        tx.send(()).unwrap();
        entered_rx.recv().unwrap();
        assert!(line.status().contains(LineStatus::MASKED));
        tx.send(()).unwrap();
        wait_for(|| runs.load(Ordering::SeqCst) == 2);
        env.manager.synchronize_irq(id).unwrap();

        assert_eq!(line.outstanding_oneshot(), 0);
        assert!(!line.status().contains(LineStatus::MASKED));
        assert_eq!(env.chip.count(MockChip::UNMASK), unmasks + 1);
        assert_eq!(line.threads_handled.load(Ordering::Relaxed), 2);
        env.manager.unregister(handle).unwrap();
    }

    #[test]
    fn forced_secondary_runs_after_primary() {
        let config = IrqConfig {
            force_threads: true,
            ..IrqConfig::default()
        };
        let env = TestEnv::with_config(4, 1, config);
        let id = LineId::new(0);
        let log = Arc::new(spin::Mutex::new(Vec::new()));
        let primary_log = log.clone();
        let secondary_log = log.clone();
        let handle = env
            .manager
            .register(
                id,
                IrqRequest::new("i2c", DevCookie(1))
                    .hard_handler(move |_| {
                        primary_log.lock().push("primary");
                        IrqReturn::WakeThread
                    })
                    .thread_handler(move |_| {
                        secondary_log.lock().push("secondary");
                        IrqReturn::Handled
                    }),
            )
            .unwrap();
        assert_eq!(env.scheduler.spawned().len(), 2);

        env.manager.handle_irq(id).unwrap();
        wait_for(|| log.lock().len() == 2);
        env.manager.synchronize_irq(id).unwrap();
        assert_eq!(*log.lock(), ["primary", "secondary"]);

        env.manager.unregister(handle).unwrap();
        assert_eq!(env.scheduler.joined(), 2);
    }

    #[test]
    fn worker_follows_line_affinity() {
        let env = TestEnv::new(4, 4);
        let id = LineId::new(3);
        let handle = env
            .manager
            .register(
                id,
                IrqRequest::new("nvme", DevCookie(1))
                    .hard_handler(|_| IrqReturn::WakeThread)
                    .thread_handler(|_| IrqReturn::Handled),
            )
            .unwrap();
        let target: CpuSet = [CpuId::new(2)].into_iter().collect();
        env.manager.set_affinity(id, &target, false).unwrap();
        env.manager.handle_irq(id).unwrap();
        env.manager.synchronize_irq(id).unwrap();
        wait_for(|| env.scheduler.affinities().last() == Some(&target));
        env.manager.unregister(handle).unwrap();
    }
}
