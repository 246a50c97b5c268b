use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use mio::{Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::error;

/// A callback handed to the event loop by another thread. Runs on the loop
/// thread at the next wake-up, so loop-owned state needs no extra locking.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Cross-thread wake-up for the event loop.
///
/// Worker threads call [`pull`](Trigger::pull) after mutating a channel's
/// output buffer or flipping a channel back to async mode; the loop, which
/// may be blocked in `poll`, wakes up on the trigger token and runs any
/// queued thunks via [`drain`](Trigger::drain).
pub struct Trigger {
    waker: Waker,
    thunks: Mutex<Vec<Thunk>>,
}

impl Trigger {
    pub fn new(registry: &Registry, token: Token) -> std::io::Result<Arc<Self>> {
        Ok(Arc::new(Trigger {
            waker: Waker::new(registry, token)?,
            thunks: Mutex::new(Vec::new()),
        }))
    }

    /// Queue an optional thunk and wake the loop. Pulling is idempotent
    /// with respect to the wake itself.
    pub fn pull(&self, thunk: Option<Thunk>) {
        if let Some(thunk) = thunk {
            self.thunks.lock().push(thunk);
        }
        if let Err(err) = self.waker.wake() {
            error!("trigger wake failed: {}", err);
        }
    }

    /// Run and clear all pending thunks. Called by the loop thread when the
    /// trigger token fires. A panicking thunk is logged; the rest still run.
    pub fn drain(&self) {
        let pending = std::mem::take(&mut *self.thunks.lock());
        for thunk in pending {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(thunk)) {
                error!("exception in trigger thunk: {:?}", panic_message(&panic));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("pending", &self.thunks.lock().len())
            .finish()
    }
}
