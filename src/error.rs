// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Errors that can happen while pumping frames and packets through a device
//! session.

use remain::sorted;
use thiserror::Error as ThisError;

/// An error raised by the pump or one of its components.
///
/// Back-pressure ("try again") and end-of-stream are not errors; they are
/// expressed through the outcome enums of the operations that can produce
/// them.
#[sorted]
#[derive(Debug, ThisError)]
pub enum VideoError {
    /// The device or one of its collaborators failed in a way we cannot
    /// recover from.
    #[error("backend failure: {0:#}")]
    BackendFailure(anyhow::Error),
    /// The operation is not valid in the current session state, e.g. sending
    /// a new frame after the stream was flushed to completion.
    #[error("invalid operation for the current session state")]
    InvalidOperation,
    /// An argument was rejected before reaching the device.
    #[error("invalid parameter")]
    InvalidParameter,
    /// An allocation failed. The operation did not consume its input.
    #[error("out of memory")]
    OutOfMemory,
    /// No free hardware frame slot was available. The device's admission
    /// control should make this impossible; hitting it is an internal
    /// invariant violation, not a condition to retry.
    #[error("hardware frame pool exhausted")]
    PoolExhausted,
    /// The device reported a fault that a session close/reopen cycle can
    /// clear. The in-flight frame must be retried after the reset.
    #[error("recoverable device fault")]
    RecoverableFault,
}

pub type VideoResult<T> = Result<T, VideoError>;

impl From<anyhow::Error> for VideoError {
    fn from(e: anyhow::Error) -> Self {
        VideoError::BackendFailure(e)
    }
}
