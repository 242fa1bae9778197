// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Delivery of asynchronous interrupts to a blocked controller.

use std::sync::Arc;

/// Something that can be told to stop blocking.
pub trait Receiver: Send + Sync {
    /// Make the current or next blocking operation return early. Must not block.
    fn notify_interrupt(&self);
}

/// Forwards interrupts to whichever [`Receiver`] is currently blocked.
///
/// An interrupt that arrives while nothing is enabled is latched and makes the next
/// [`enable`](Self::enable) fail, so it is observed by the next wait instead of being dropped.
#[derive(Default)]
pub struct Forwarder {
    state: spin::Mutex<ForwarderState>,
}

#[derive(Default)]
struct ForwarderState {
    dest: Option<Arc<dyn Receiver>>,
    pending: bool,
}

impl Forwarder {
    pub const fn new() -> Self {
        Self {
            state: spin::Mutex::new(ForwarderState {
                dest: None,
                pending: false,
            }),
        }
    }

    /// Route interrupts to `dest`.
    ///
    /// Returns `false` (and consumes the latch) if an interrupt is already pending; `dest` is not
    /// installed in that case.
    ///
    /// # Panics
    ///
    /// Panics if another receiver is already enabled.
    #[must_use]
    pub fn enable(&self, dest: Arc<dyn Receiver>) -> bool {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            return false;
        }
        assert!(state.dest.is_none(), "interrupt receiver already enabled");
        state.dest = Some(dest);
        true
    }

    /// Stop routing interrupts. After this returns, the previous receiver is never notified again.
    pub fn disable(&self) {
        self.state.lock().dest = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().dest.is_some()
    }

    /// Whether an interrupt is latched.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Drop a latched interrupt, returning whether there was one.
    pub fn clear_pending(&self) -> bool {
        core::mem::take(&mut self.state.lock().pending)
    }
}

impl Receiver for Forwarder {
    fn notify_interrupt(&self) {
        let mut state = self.state.lock();
        // Notified under the lock so that `disable` fences out late notifications.
        match state.dest.clone() {
            Some(dest) => dest.notify_interrupt(),
            None => state.pending = true,
        }
    }
}
