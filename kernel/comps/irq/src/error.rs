// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The chip lacks a capability that the request needs.
    ConfigError,
    /// The request disagrees with the handlers already sharing the line.
    SharingConflict,
    /// A bounded resource is exhausted or temporarily unavailable.
    ResourceBusy,
    /// No line or handler matches the request.
    NotFound,
    /// The operation is not implemented by the chip.
    Unsupported,
    /// The request itself is malformed.
    InvalidArgs,
    /// The chip reported a failure of its own.
    ChipFailure,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::ConfigError => "the interrupt chip lacks a required capability",
            Error::SharingConflict => "the request conflicts with the handlers sharing the line",
            Error::ResourceBusy => "the resource is busy or exhausted",
            Error::NotFound => "no such interrupt line or handler",
            Error::Unsupported => "the operation is not supported by the interrupt chip",
            Error::InvalidArgs => "invalid arguments",
            Error::ChipFailure => "the interrupt chip reported a failure",
        };
        f.write_str(msg)
    }
}

/// Reports a bug in the calling driver and stops.
///
/// Unbalanced enables, unbalanced wake disables and similar misuse leave the
/// line state in a shape that cannot be trusted any more, so they are never
/// surfaced as a recoverable [`Error`].
#[track_caller]
#[cold]
pub(crate) fn programming_error(args: core::fmt::Arguments<'_>) -> ! {
    log::error!("irq: programming error: {}", args);
    panic!("irq: programming error: {}", args);
}

macro_rules! misuse {
    ($($arg:tt)*) => {
        $crate::error::programming_error(format_args!($($arg)*))
    };
}

pub(crate) use misuse;
