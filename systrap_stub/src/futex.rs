// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Futex primitives shared between the controller and its stub threads.
//!
//! The sysmsg words live in memory mapped by both processes, so these use the shared (non-private)
//! futex operations. The stub's seccomp policy only lets `FUTEX_WAIT`/`FUTEX_WAKE` through when
//! the trailing three arguments are zero; the wrappers here always pass zeros there.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};
use core::time::Duration;
use std::sync::Arc;

use syscalls::{Errno, Sysno};

use crate::interrupt;
use crate::sysmsg::Msg;

/// Operations supported by [`futex_wait`] and [`futex_wake`].
#[repr(i32)]
enum FutexOperation {
    Wait = libc::FUTEX_WAIT,
    Wake = libc::FUTEX_WAKE,
}

/// How long a controller waiting in [`futex_wait_for_state`] sleeps before re-checking for an
/// interrupt.
pub const INTERRUPT_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Invoke `FUTEX_WAIT` on `uaddr` while it holds `val`.
///
/// Returns `Err(EAGAIN)` if the word did not hold `val`, and `Err(ETIMEDOUT)` if `timeout`
/// elapsed.
pub fn futex_wait(uaddr: &AtomicU32, val: u32, timeout: Option<Duration>) -> Result<(), Errno> {
    let timeout = timeout.map(|t| libc::timespec {
        tv_sec: libc::time_t::try_from(t.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::from(t.subsec_nanos()),
    });
    let timeout_ptr = timeout
        .as_ref()
        .map_or(0, |t| core::ptr::from_ref(t) as usize);
    // SAFETY: `uaddr` is a valid, aligned futex word for the duration of the call, and the
    // timeout (if any) outlives it.
    unsafe {
        syscalls::syscall6(
            Sysno::futex,
            uaddr.as_ptr() as usize,
            FutexOperation::Wait as usize,
            val as usize,
            timeout_ptr,
            0,
            0,
        )
    }
    .map(|_| ())
}

/// Invoke `FUTEX_WAKE` on `uaddr`, waking at most `count` waiters. Returns the number woken.
pub fn futex_wake(uaddr: &AtomicU32, count: u32) -> Result<usize, Errno> {
    futex_wake_raw(uaddr.as_ptr() as usize, count)
}

/// [`futex_wake`] on a bare address.
///
/// Waking an address that is no longer mapped fails with `EFAULT` and has no other effect.
fn futex_wake_raw(uaddr: usize, count: u32) -> Result<usize, Errno> {
    // SAFETY: FUTEX_WAKE only uses the address as a key; it never dereferences user memory.
    unsafe {
        syscalls::syscall6(
            Sysno::futex,
            uaddr,
            FutexOperation::Wake as usize,
            count as usize,
            0,
            0,
            0,
        )
    }
}

/// How [`futex_wait_for_state`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The stub thread acknowledged: `acked_events` moved past the value being waited on.
    Acknowledged,
    /// The interruptor fired before any acknowledgement arrived.
    Interrupted,
}

/// Interrupt receiver that kicks a controller sleeping on a futex word.
struct FutexInterrupt {
    interrupted: AtomicBool,
    uaddr: usize,
}

impl interrupt::Receiver for FutexInterrupt {
    fn notify_interrupt(&self) {
        self.interrupted.store(true, SeqCst);
        if let Err(errno) = futex_wake_raw(self.uaddr, u32::MAX) {
            systrap_util_log::warn!("failed to kick interrupted waiter: {errno}");
        }
    }
}

/// Optionally wake the stub thread, then block until `msg.acked_events` differs from `acked` or
/// `interruptor` fires.
///
/// The acknowledgement counter is always re-checked before `Interrupted` is reported, so an
/// acknowledgement racing with an interrupt is never lost. Errors are unexpected kernel failures.
pub fn futex_wait_for_state(
    msg: &Msg,
    wakeup: bool,
    acked: u32,
    interruptor: &interrupt::Forwarder,
) -> Result<WaitOutcome, Errno> {
    if wakeup {
        msg.wake_stub()?;
    }

    let acked_word = msg.acked_events_word();
    let receiver = Arc::new(FutexInterrupt {
        interrupted: AtomicBool::new(false),
        uaddr: acked_word.as_ptr() as usize,
    });
    if !interruptor.enable(receiver.clone()) {
        // An interrupt was already pending.
        return Ok(if acked_word.load(SeqCst) == acked {
            WaitOutcome::Interrupted
        } else {
            WaitOutcome::Acknowledged
        });
    }

    let outcome = loop {
        if acked_word.load(SeqCst) != acked {
            break Ok(WaitOutcome::Acknowledged);
        }
        if receiver.interrupted.load(SeqCst) {
            break Ok(WaitOutcome::Interrupted);
        }
        match futex_wait(acked_word, acked, Some(INTERRUPT_RECHECK_INTERVAL)) {
            Ok(()) | Err(Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT) => {}
            Err(errno) => break Err(errno),
        }
    };
    interruptor.disable();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_on_mismatched_value_returns_immediately() {
        let word = AtomicU32::new(1);
        assert_eq!(futex_wait(&word, 0, None), Err(Errno::EAGAIN));
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        assert_eq!(
            futex_wait(&word, 0, Some(Duration::from_millis(20))),
            Err(Errno::ETIMEDOUT)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wake_without_waiters() {
        let word = AtomicU32::new(0);
        assert_eq!(futex_wake(&word, 1), Ok(0));
    }

    #[test]
    fn already_acknowledged_returns_without_blocking() {
        let msg = Msg::new();
        msg.ack_event().unwrap();
        let forwarder = interrupt::Forwarder::new();
        assert_eq!(
            futex_wait_for_state(&msg, false, 0, &forwarder),
            Ok(WaitOutcome::Acknowledged)
        );
    }

    #[test]
    fn pending_interrupt_is_reported() {
        let msg = Msg::new();
        let forwarder = interrupt::Forwarder::new();
        interrupt::Receiver::notify_interrupt(&forwarder);
        assert_eq!(
            futex_wait_for_state(&msg, false, 0, &forwarder),
            Ok(WaitOutcome::Interrupted)
        );
        // The latch is consumed; the forwarder has no destination left behind.
        assert!(!forwarder.is_enabled());
    }
}
