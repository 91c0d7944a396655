// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// The run-time status of an interrupt line.
    pub struct LineStatus: u32 {
        /// The line is disabled (depth > 0).
        const DISABLED           = 1 << 0;
        /// The line is masked at the chip.
        const MASKED             = 1 << 1;
        /// An occurrence arrived that could not be handled yet.
        const PENDING            = 1 << 2;
        /// An affinity change waits for the line to be masked.
        const MOVE_PENDING       = 1 << 3;
        /// The line was disabled by a suspend pass.
        const SUSPENDED          = 1 << 4;
        /// The line is configured as a wake source.
        const WAKEUP_STATE       = 1 << 5;
        /// The line is armed to wake the system while suspended.
        const WAKEUP_ARMED       = 1 << 6;
        /// The line was enabled only to be able to wake the system.
        const ENABLED_ON_SUSPEND = 1 << 7;
        /// The line is a per-CPU line.
        const PER_CPU            = 1 << 8;
        /// The line is delivered as an NMI.
        const NMI                = 1 << 9;
        /// The line was disabled because nobody handled it.
        const SPURIOUS_DISABLED  = 1 << 10;
        /// The line follows the oneshot protocol.
        const ONESHOT            = 1 << 11;
        /// The line has been started up.
        const STARTED            = 1 << 12;
        /// The line is activated in the domain hierarchy.
        const ACTIVATED          = 1 << 13;
        /// The line is level triggered.
        const LEVEL              = 1 << 14;
        /// The line is excluded from affinity balancing.
        const NO_BALANCING       = 1 << 15;
        /// The affinity was set explicitly.
        const AFFINITY_SET       = 1 << 16;
        /// The affinity is managed by the kernel.
        const AFFINITY_MANAGED   = 1 << 17;
        /// The trigger type has been pinned.
        const TRIGGER_SET        = 1 << 18;
    }
}

bitflags! {
    /// Static settings of an interrupt line, fixed at controller registration.
    pub struct LineSettings: u32 {
        /// The line is demultiplexed from the worker of a parent line.
        const NESTED_THREAD = 1 << 0;
        /// Handlers on this line are never force-threaded.
        const NO_THREAD     = 1 << 1;
        /// Drivers may not request this line.
        const NO_REQUEST    = 1 << 2;
        /// The line is not started when its first handler is installed.
        const NO_AUTOEN     = 1 << 3;
        /// The line is chained to a parent line and is skipped by suspend.
        const CHAINED       = 1 << 4;
    }
}
