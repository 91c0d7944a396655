// SPDX-License-Identifier: MPL-2.0

//! The prelude.

/// A specialized [`Result`] type for this crate.
///
/// [`Result`]: core::result::Result
pub type Result<T> = core::result::Result<T, crate::error::Error>;

pub(crate) use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

pub(crate) use crate::{
    action::{DevCookie, IrqFlags, IrqRequest, IrqReturn},
    cpu::{CpuId, CpuSet},
    error::{Error, misuse},
    line::LineId,
};
