// SPDX-License-Identifier: MPL-2.0

//! Handler records.
//!
//! A driver describes what it wants with an [`IrqRequest`]. Once installed,
//! the request becomes an [`IrqAction`] owned by the handler chain of the
//! line, and the driver gets back an [`IrqHandle`] that names the action by
//! index rather than by reference.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use spin::Once;

use crate::{prelude::*, task::ThreadHandle};

bitflags! {
    /// Flags of an interrupt request.
    pub struct IrqFlags: u32 {
        /// Trigger on the rising edge.
        const TRIGGER_RISING  = 0x0000_0001;
        /// Trigger on the falling edge.
        const TRIGGER_FALLING = 0x0000_0002;
        /// Trigger on the high level.
        const TRIGGER_HIGH    = 0x0000_0004;
        /// Trigger on the low level.
        const TRIGGER_LOW     = 0x0000_0008;
        /// All the trigger bits.
        const TRIGGER_MASK    = Self::TRIGGER_RISING.bits
            | Self::TRIGGER_FALLING.bits
            | Self::TRIGGER_HIGH.bits
            | Self::TRIGGER_LOW.bits;
        /// The line may be shared with other handlers.
        const SHARED          = 0x0000_0080;
        /// A sharing mismatch is expected, do not complain about it.
        const PROBE_SHARED    = 0x0000_0100;
        /// The line is a per-CPU line.
        const PERCPU          = 0x0000_0400;
        /// Exclude the line from affinity balancing.
        const NO_BALANCING    = 0x0000_0800;
        /// Keep the line masked until the deferred handlers are done.
        const ONESHOT         = 0x0000_2000;
        /// Do not disable the line on suspend.
        const NO_SUSPEND      = 0x0000_4000;
        /// Restart the line on resume even if it was not suspended.
        const FORCE_RESUME    = 0x0000_8000;
        /// Never force-thread the handler.
        const NO_THREAD       = 0x0001_0000;
        /// Resume the line in the early resume pass.
        const EARLY_RESUME    = 0x0002_0000;
        /// The handler copes with the line staying enabled on suspend when
        /// it shares the line with a `NO_SUSPEND` handler.
        const COND_SUSPEND    = 0x0004_0000;
        /// Do not start the line when the handler is installed.
        const NO_AUTOEN       = 0x0008_0000;
    }
}

/// The outcome of a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// The occurrence was not from this device.
    None,
    /// The occurrence was handled.
    Handled,
    /// The occurrence needs the deferred handler to run.
    WakeThread,
}

impl IrqReturn {
    /// Combines the outcomes of two handlers on the same line.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::WakeThread, _) | (_, Self::WakeThread) => Self::WakeThread,
            (Self::Handled, _) | (_, Self::Handled) => Self::Handled,
            _ => Self::None,
        }
    }
}

/// The device identity of a handler.
///
/// A cookie must be unique among the handlers sharing a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevCookie(pub usize);

/// Type alias for the handler functions.
pub type HandlerFn = dyn Fn(LineId) -> IrqReturn + Send + Sync + 'static;

/// A request to install a handler.
pub struct IrqRequest {
    pub(crate) name: String,
    pub(crate) cookie: DevCookie,
    pub(crate) flags: IrqFlags,
    pub(crate) hard: Option<Box<HandlerFn>>,
    pub(crate) thread: Option<Box<HandlerFn>>,
}

impl IrqRequest {
    /// Creates a request without handlers or flags.
    pub fn new(name: &str, cookie: DevCookie) -> Self {
        Self {
            name: name.to_string(),
            cookie,
            flags: IrqFlags::empty(),
            hard: None,
            thread: None,
        }
    }

    /// Sets the request flags.
    pub fn flags(mut self, flags: IrqFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the handler that runs in hard-interrupt context.
    pub fn hard_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(LineId) -> IrqReturn + Send + Sync + 'static,
    {
        self.hard = Some(Box::new(handler));
        self
    }

    /// Sets the handler that runs in the deferred worker.
    pub fn thread_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(LineId) -> IrqReturn + Send + Sync + 'static,
    {
        self.thread = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for IrqRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqRequest")
            .field("name", &self.name)
            .field("cookie", &self.cookie)
            .field("flags", &self.flags)
            .field("hard", &self.hard.is_some())
            .field("thread", &self.thread.is_some())
            .finish()
    }
}

/// The index of an action on its line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ActionId(pub(crate) u64);

/// How the callbacks of an action are wired.
///
/// The variant is chosen once at registration.
pub(crate) enum HandlerKind {
    /// The callbacks run where the driver asked for. A missing hard handler
    /// stands for one that always wakes the worker.
    Direct {
        hard: Option<Box<HandlerFn>>,
        thread: Option<Box<HandlerFn>>,
    },
    /// A hard handler moved into the worker. Its deferred handler, if any,
    /// moved into `secondary`.
    ForcedThread {
        primary: Box<HandlerFn>,
        secondary: Option<Arc<IrqAction>>,
    },
    /// The deferred half of a force-threaded action. Never on the chain.
    ForcedSecondary { thread: Box<HandlerFn> },
    /// A handler that runs in the worker of the parent line.
    Nested { thread: Box<HandlerFn> },
}

/// Thread flags of an action.
pub(crate) mod thread_flags {
    /// The worker has been woken and has not picked the wake-up yet.
    pub const RUNTHREAD: u32 = 1 << 0;
    /// The worker must move itself to the affinity of the line.
    pub const AFFINITY: u32 = 1 << 1;
}

/// An installed handler record.
pub(crate) struct IrqAction {
    pub(crate) id: ActionId,
    pub(crate) name: String,
    pub(crate) cookie: DevCookie,
    pub(crate) flags: IrqFlags,
    pub(crate) kind: HandlerKind,
    pub(crate) thread_mask: AtomicUsize,
    pub(crate) worker: Once<Box<dyn ThreadHandle>>,
    pub(crate) thread_flags: AtomicU32,
    pub(crate) should_stop: AtomicBool,
    warned: AtomicBool,
}

impl IrqAction {
    pub(crate) fn new(
        id: ActionId,
        name: String,
        cookie: DevCookie,
        flags: IrqFlags,
        kind: HandlerKind,
    ) -> Self {
        Self {
            id,
            name,
            cookie,
            flags,
            kind,
            thread_mask: AtomicUsize::new(0),
            worker: Once::new(),
            thread_flags: AtomicU32::new(0),
            should_stop: AtomicBool::new(false),
            warned: AtomicBool::new(false),
        }
    }

    pub(crate) fn thread_mask(&self) -> usize {
        self.thread_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn secondary(&self) -> Option<&Arc<IrqAction>> {
        match &self.kind {
            HandlerKind::ForcedThread { secondary, .. } => secondary.as_ref(),
            _ => None,
        }
    }

    /// Returns whether the action has a deferred callback run by its own worker.
    pub(crate) fn has_thread(&self) -> bool {
        match &self.kind {
            HandlerKind::Direct { thread, .. } => thread.is_some(),
            HandlerKind::ForcedThread { .. } | HandlerKind::ForcedSecondary { .. } => true,
            HandlerKind::Nested { .. } => false,
        }
    }

    pub(crate) fn is_forced(&self) -> bool {
        matches!(self.kind, HandlerKind::ForcedThread { .. })
    }

    /// Runs the hard-context half.
    pub(crate) fn call_hard(&self, line: LineId) -> IrqReturn {
        match &self.kind {
            HandlerKind::Direct { hard: Some(hard), .. } => hard(line),
            HandlerKind::Direct { hard: None, .. } | HandlerKind::ForcedThread { .. } => {
                IrqReturn::WakeThread
            }
            HandlerKind::Nested { .. } => {
                self.warn_once(line, "primary handler called for a nested line");
                IrqReturn::None
            }
            HandlerKind::ForcedSecondary { .. } => {
                self.warn_once(line, "secondary handler called in hard context");
                IrqReturn::None
            }
        }
    }

    /// Runs the deferred half.
    pub(crate) fn call_thread(&self, line: LineId) -> IrqReturn {
        match &self.kind {
            HandlerKind::Direct {
                thread: Some(thread),
                ..
            } => thread(line),
            HandlerKind::Direct { thread: None, .. } => IrqReturn::None,
            HandlerKind::ForcedThread { primary, .. } => primary(line),
            HandlerKind::ForcedSecondary { thread } | HandlerKind::Nested { thread } => {
                thread(line)
            }
        }
    }

    /// Logs a warning once per action.
    pub(crate) fn warn_once(&self, line: LineId, what: &str) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            log::warn!("irq {}: handler {}: {}", line, self.name, what);
        }
    }

    pub(crate) fn test_and_set_thread_flag(&self, flag: u32) -> bool {
        self.thread_flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    pub(crate) fn test_and_clear_thread_flag(&self, flag: u32) -> bool {
        self.thread_flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }

    pub(crate) fn test_thread_flag(&self, flag: u32) -> bool {
        self.thread_flags.load(Ordering::Acquire) & flag != 0
    }
}

/// The handle of an installed handler.
///
/// Pass it to [`IrqManager::unregister`] to remove the handler. Dropping the
/// handle leaves the handler installed; it can still be removed with
/// [`IrqManager::free_irq`].
///
/// [`IrqManager::unregister`]: crate::IrqManager::unregister
/// [`IrqManager::free_irq`]: crate::IrqManager::free_irq
#[derive(Debug)]
#[must_use]
pub struct IrqHandle {
    pub(crate) line: LineId,
    pub(crate) action: ActionId,
    pub(crate) cookie: DevCookie,
}

impl IrqHandle {
    /// Returns the line the handler is installed on.
    pub fn line(&self) -> LineId {
        self.line
    }

    /// Returns the device cookie of the handler.
    pub fn cookie(&self) -> DevCookie {
        self.cookie
    }
}
