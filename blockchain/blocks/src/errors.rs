// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Block stream vocabulary error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The opaque cursor string could not be decoded.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    /// The byte does not name exactly one step.
    #[error("invalid step bits: {0}")]
    InvalidStep(u8),
}
