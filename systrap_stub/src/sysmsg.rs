// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The per-thread message shared between the controller and a stub thread.
//!
//! A [`Msg`] lives at a fixed offset in the stub thread's shared stack (see
//! [`SysmsgLayout::msg_offset`](crate::layout::SysmsgLayout::msg_offset)) and is mapped by both
//! processes. Ownership of the words is split:
//!
//! - `state` is written only by the controller and waited on by the stub.
//! - `acked_events` is only ever incremented, and only by the stub; the controller waits on it.
//! - `stub_fast_path` is written by the stub to say it is polling `state` instead of sleeping, in
//!   which case the controller skips the wake-up syscall.

use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering::SeqCst};

use syscalls::Errno;
use thiserror::Error;

use crate::futex::{futex_wait, futex_wake};

/// What the controller asks the stub thread to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ThreadState {
    /// No request; used with `wait_event` to only wait for the next acknowledgement.
    None = 0,
    /// The stub finished handling the previous request.
    Done = 1,
    /// Prepare to run application code.
    Prep = 2,
    /// The stub is parked on its futex.
    Asleep = 3,
    /// An event for the controller is pending.
    Event = 4,
    /// The stub thread is still being set up.
    Initializing = 5,
}

impl ThreadState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ThreadState::None => "none",
            ThreadState::Done => "done",
            ThreadState::Prep => "prep",
            ThreadState::Asleep => "asleep",
            ThreadState::Event => "event",
            ThreadState::Initializing => "initializing",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state word that does not name any [`ThreadState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown thread state {0}")]
pub struct UnknownThreadState(pub u32);

impl TryFrom<u32> for ThreadState {
    type Error = UnknownThreadState;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => ThreadState::None,
            1 => ThreadState::Done,
            2 => ThreadState::Prep,
            3 => ThreadState::Asleep,
            4 => ThreadState::Event,
            5 => ThreadState::Initializing,
            _ => return Err(UnknownThreadState(v)),
        })
    }
}

/// The shared message. All fields are atomics; the other side may write them at any time.
#[repr(C)]
pub struct Msg {
    state: AtomicU32,
    acked_events: AtomicU32,
    stub_fast_path: AtomicU32,
    interrupt: AtomicU32,
    err: AtomicI32,
    signo: AtomicI32,
    fault_addr: AtomicU64,
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

impl Msg {
    /// A message in its initial state: no request, nothing acknowledged.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(ThreadState::None as u32),
            acked_events: AtomicU32::new(0),
            stub_fast_path: AtomicU32::new(0),
            interrupt: AtomicU32::new(0),
            err: AtomicI32::new(0),
            signo: AtomicI32::new(0),
            fault_addr: AtomicU64::new(0),
        }
    }

    /// The requested state, or the raw word if the other side wrote garbage.
    pub fn state(&self) -> Result<ThreadState, UnknownThreadState> {
        ThreadState::try_from(self.state.load(SeqCst))
    }

    /// Publish a new request. Controller side only.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, SeqCst);
    }

    pub fn acked_events(&self) -> u32 {
        self.acked_events.load(SeqCst)
    }

    pub(crate) fn acked_events_word(&self) -> &AtomicU32 {
        &self.acked_events
    }

    /// Whether the stub is polling `state` and does not need a futex wake-up.
    pub fn stub_fast_path(&self) -> bool {
        self.stub_fast_path.load(SeqCst) != 0
    }

    /// Stub side: announce whether `state` is being polled.
    pub fn set_stub_fast_path(&self, enabled: bool) {
        self.stub_fast_path.store(u32::from(enabled), SeqCst);
    }

    pub fn interrupt(&self) -> u32 {
        self.interrupt.load(SeqCst)
    }

    pub fn set_interrupt(&self, v: u32) {
        self.interrupt.store(v, SeqCst);
    }

    /// Errno reported by the stub for its last request.
    pub fn err(&self) -> i32 {
        self.err.load(SeqCst)
    }

    pub fn set_err(&self, err: i32) {
        self.err.store(err, SeqCst);
    }

    /// Signal and faulting address reported by the stub.
    pub fn fault(&self) -> (i32, u64) {
        (self.signo.load(SeqCst), self.fault_addr.load(SeqCst))
    }

    pub fn set_fault(&self, signo: i32, fault_addr: u64) {
        self.fault_addr.store(fault_addr, SeqCst);
        self.signo.store(signo, SeqCst);
    }

    /// Controller side: wake a stub sleeping on `state`.
    pub fn wake_stub(&self) -> Result<usize, Errno> {
        futex_wake(&self.state, 1)
    }

    /// Stub side: acknowledge the current request and wake the controller.
    ///
    /// Returns the new value of `acked_events`.
    pub fn ack_event(&self) -> Result<u32, Errno> {
        let acked = self.acked_events.fetch_add(1, SeqCst).wrapping_add(1);
        futex_wake(&self.acked_events, 1)?;
        Ok(acked)
    }

    /// Stub side: sleep until the raw `state` word differs from `seen`, and return the new
    /// state.
    pub fn wait_for_state_change(
        &self,
        seen: u32,
    ) -> Result<Result<ThreadState, UnknownThreadState>, Errno> {
        loop {
            let current = self.state.load(SeqCst);
            if current != seen {
                return Ok(ThreadState::try_from(current));
            }
            match futex_wait(&self.state, seen, None) {
                Ok(()) | Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(errno) => return Err(errno),
            }
        }
    }

    /// The raw `state` word, for [`wait_for_state_change`](Self::wait_for_state_change).
    pub fn raw_state(&self) -> u32 {
        self.state.load(SeqCst)
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.raw_state();
        let (signo, fault_addr) = self.fault();
        write!(f, "sysmsg{{state: ")?;
        match ThreadState::try_from(state) {
            Ok(s) => write!(f, "{s}")?,
            Err(UnknownThreadState(raw)) => write!(f, "?{raw}")?,
        }
        write!(
            f,
            ", acked: {}, fast_path: {}, interrupt: {}, err: {}, signo: {signo}, fault_addr: {fault_addr:#x}}}",
            self.acked_events(),
            self.stub_fast_path(),
            self.interrupt(),
            self.err(),
        )
    }
}
