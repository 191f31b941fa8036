// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod block;
mod cursor;
mod errors;
mod handler;
mod step;

pub use self::block::{Block, BlockRef, ObjectWithCursor, Payload, PreprocessedBlock};
pub use self::cursor::Cursor;
pub use self::errors::Error;
pub use self::handler::{Handler, HandlerFunc};
pub use self::step::{steps_all, Step, Steps};
