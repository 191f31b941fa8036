// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Error;
use parking_lot::Mutex;

/// Single-shot shutdown latch: the first error wins, and every task
/// observing the watch channel wakes up once the trigger drops.
pub(crate) struct Shutter {
    trigger: Mutex<Option<flume::Sender<()>>>,
    watch: flume::Receiver<()>,
    err: Mutex<Option<Error>>,
}

impl Shutter {
    pub(crate) fn new() -> Self {
        let (trigger, watch) = flume::bounded(1);
        Self {
            trigger: Mutex::new(Some(trigger)),
            watch,
            err: Mutex::new(None),
        }
    }

    /// Records the first error and releases every waiter. Later calls are
    /// no-ops.
    pub(crate) fn shutdown(&self, result: Result<(), Error>) {
        let mut trigger = self.trigger.lock();
        if trigger.is_none() {
            return;
        }
        if let Err(e) = result {
            *self.err.lock() = Some(e);
        }
        *trigger = None;
    }

    pub(crate) fn is_down(&self) -> bool {
        self.watch.is_disconnected()
    }

    /// Resolves once the shutter has been triggered. Nothing is ever sent
    /// on the watch channel; only its disconnection carries the signal.
    pub(crate) async fn wait(&self) {
        let _ = self.watch.recv_async().await;
    }

    pub(crate) fn take_err(&self) -> Option<Error> {
        self.err.lock().take()
    }
}
