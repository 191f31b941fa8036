// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod errors;
mod forkable;
mod forkdb;
mod metrics;
mod resume;
mod snapshot;

pub use self::errors::Error;
pub use self::forkable::{Forkable, ForkableObject};
pub use self::forkdb::{ForkDb, ForkableBlock};
pub use self::snapshot::{read_snapshot, write_snapshot, ForkDbSnapshot};
