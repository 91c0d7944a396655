// SPDX-License-Identifier: MPL-2.0

//! The interrupt controller chip abstraction.
//!
//! The core never touches controller registers. Every hardware interaction
//! goes through [`IrqChip`], whose optional capabilities report
//! [`Error::Unsupported`] by default so that a controller only implements
//! what it actually has.

use bitflags::bitflags;

use crate::prelude::*;

bitflags! {
    /// Static properties of an interrupt chip.
    pub struct ChipFlags: u32 {
        /// The line must be masked while its trigger type is changed.
        const SET_TYPE_MASKED          = 1 << 0;
        /// The chip masks lines by itself until the deferred handler is
        /// done, so threaded handlers need no oneshot protocol.
        const ONESHOT_SAFE             = 1 << 1;
        /// Non-wake lines must be masked on suspend.
        const MASK_ON_SUSPEND          = 1 << 2;
        /// Wake lines must be enabled on suspend even if they are disabled.
        const ENABLE_WAKEUP_ON_SUSPEND = 1 << 3;
        /// The chip has no wake configuration to program.
        const SKIP_SET_WAKE            = 1 << 4;
        /// The chip can deliver lines as NMIs.
        const SUPPORTS_NMI             = 1 << 5;
        /// The affinity can only be programmed once the line is activated.
        const AFFINITY_ON_ACTIVATE     = 1 << 6;
    }
}

/// The per-line hardware state bits that can be read or forced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipState {
    /// The line is asserted but not yet delivered.
    Pending,
    /// The line is being serviced on some CPU.
    Active,
    /// The line is masked at the chip.
    Masked,
    /// The current level of the input.
    LineLevel,
}

/// The trigger type of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TriggerType {
    /// Leave the current configuration alone.
    None = 0,
    /// Rising edge.
    EdgeRising = 1,
    /// Falling edge.
    EdgeFalling = 2,
    /// Both edges.
    EdgeBoth = 3,
    /// High level.
    LevelHigh = 4,
    /// Low level.
    LevelLow = 8,
}

impl TriggerType {
    /// Decodes the trigger bits of a request.
    ///
    /// Returns `None` if the bits name more than one trigger type.
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => Self::None,
            1 => Self::EdgeRising,
            2 => Self::EdgeFalling,
            3 => Self::EdgeBoth,
            4 => Self::LevelHigh,
            8 => Self::LevelLow,
            _ => return None,
        })
    }

    /// Returns whether the line is level triggered.
    pub fn is_level(self) -> bool {
        matches!(self, Self::LevelHigh | Self::LevelLow)
    }
}

/// An interrupt controller.
///
/// All methods may be called with the line's spin lock held and local IRQs
/// disabled, so they must not block. The exception is the bus lock pair:
/// chips behind a slow bus queue their changes while the line lock is held
/// and flush them in [`IrqChip::bus_sync_unlock`], which is called without
/// the line lock.
pub trait IrqChip: Send + Sync {
    /// Returns the name of the chip.
    fn name(&self) -> &str;

    /// Returns the static properties of the chip.
    fn flags(&self) -> ChipFlags {
        ChipFlags::empty()
    }

    /// Starts up a line when its first handler is installed.
    fn startup(&self, line: LineId) -> Result<()> {
        self.enable(line)
    }

    /// Shuts down a line when its last handler is removed.
    fn shutdown(&self, line: LineId) -> Result<()> {
        self.disable(line)
    }

    /// Enables a line.
    fn enable(&self, line: LineId) -> Result<()> {
        self.unmask(line)
    }

    /// Disables a line.
    fn disable(&self, line: LineId) -> Result<()> {
        self.mask(line)
    }

    /// Masks a line.
    fn mask(&self, _line: LineId) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Unmasks a line.
    fn unmask(&self, _line: LineId) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Acknowledges the start of an occurrence.
    fn ack(&self, _line: LineId) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Signals the end of an occurrence.
    fn eoi(&self, _line: LineId) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Raises a line again in hardware to replay a lost edge.
    fn retrigger(&self, _line: LineId) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Programs the trigger type.
    fn set_type(&self, _line: LineId, _trigger: TriggerType) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Programs the CPU affinity.
    ///
    /// Returns the effective affinity if the chip narrows the request, or
    /// `None` to use the online part of `cpus`. A chip that cannot apply the
    /// change right now returns [`Error::ResourceBusy`].
    fn set_affinity(&self, _line: LineId, _cpus: &CpuSet, _force: bool) -> Result<Option<CpuSet>> {
        Err(Error::Unsupported)
    }

    /// Configures the line as a wake source or not.
    fn set_wake(&self, _line: LineId, _on: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Reads a hardware state bit.
    fn irq_state(&self, _line: LineId, _which: ChipState) -> Result<bool> {
        Err(Error::Unsupported)
    }

    /// Forces a hardware state bit.
    fn set_irq_state(&self, _line: LineId, _which: ChipState, _value: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Reserves whatever the chip needs before the first handler is installed.
    fn request_resources(&self, _line: LineId) -> Result<()> {
        Ok(())
    }

    /// Releases what [`IrqChip::request_resources`] reserved.
    fn release_resources(&self, _line: LineId) {}

    /// Activates the line in the interrupt domain hierarchy.
    fn activate(&self, _line: LineId) -> Result<()> {
        Ok(())
    }

    /// Deactivates the line in the interrupt domain hierarchy.
    fn deactivate(&self, _line: LineId) {}

    /// Prepares the line for NMI delivery.
    fn nmi_setup(&self, _line: LineId) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Undoes [`IrqChip::nmi_setup`].
    fn nmi_teardown(&self, _line: LineId) {}

    /// Returns whether the chip sits behind a slow bus.
    fn has_bus_lock(&self) -> bool {
        false
    }

    /// Starts a batch of chip changes. May sleep.
    fn bus_lock(&self, _line: LineId) {}

    /// Flushes the batch started by [`IrqChip::bus_lock`]. May sleep.
    fn bus_sync_unlock(&self, _line: LineId) {}
}
