// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-local test-only mock subprocess for exercising stub threads without a real stub process.

use core::fmt;
use std::sync::Arc;

use syscalls::{Errno, Sysno};

use crate::layout::SysmsgLayout;
use crate::memory_file::MemoryFile;
use crate::subprocess::{OsThread, Subprocess};

/// Something the code under test asked the subprocess or one of its threads to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    /// [`Subprocess::syscall`].
    Syscall(Sysno, Vec<usize>),
    /// [`OsThread::syscall_ignore_interrupt`].
    ThreadSyscall(Sysno, Vec<usize>),
    Kill { tid: i32 },
    ReleaseStackId(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Syscall(Sysno),
    Kill,
}

#[derive(Default)]
struct Recorder {
    calls: Vec<Call>,
    /// One-shot failures, consumed by the first matching operation.
    failures: Vec<(Op, Errno)>,
}

impl Recorder {
    fn record(&mut self, call: Call, op: Op) -> Result<(), Errno> {
        self.calls.push(call);
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(i) => Err(self.failures.remove(i).1),
            None => Ok(()),
        }
    }
}

/// A mock subprocess that records every operation and never touches another process.
///
/// The memory file is real, so controller-side mappings behave as usual.
pub(crate) struct MockSubprocess {
    layout: SysmsgLayout,
    memory_file: MemoryFile,
    recorder: Arc<spin::Mutex<Recorder>>,
}

impl MockSubprocess {
    pub(crate) fn new(layout: SysmsgLayout) -> Self {
        Self {
            layout,
            memory_file: MemoryFile::new(c"systrap-mock").unwrap(),
            recorder: Arc::default(),
        }
    }

    /// A thread of this subprocess occupying `stack_id`, sharing its call log.
    pub(crate) fn new_thread(&self, stack_id: u32) -> MockThread {
        MockThread {
            tid: 1000 + i32::try_from(stack_id).unwrap(),
            stack_id,
            regs: MockRegs,
            recorder: self.recorder.clone(),
        }
    }

    /// Everything recorded so far, in order.
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.recorder.lock().calls.clone()
    }

    /// Make the next `sysno` (from the subprocess or any of its threads) fail with `errno`.
    pub(crate) fn fail_syscall(&self, sysno: Sysno, errno: Errno) {
        self.recorder
            .lock()
            .failures
            .push((Op::Syscall(sysno), errno));
    }

    /// Make the next thread kill fail with `errno`.
    pub(crate) fn fail_kill(&self, errno: Errno) {
        self.recorder.lock().failures.push((Op::Kill, errno));
    }
}

impl Subprocess for MockSubprocess {
    type Thread = MockThread;
    type Context = u32;

    fn syscall(&self, sysno: Sysno, args: &[usize]) -> Result<usize, Errno> {
        self.recorder
            .lock()
            .record(Call::Syscall(sysno, args.to_vec()), Op::Syscall(sysno))
            .map(|()| 0)
    }

    fn release_stack_id(&self, stack_id: u32) {
        self.recorder
            .lock()
            .calls
            .push(Call::ReleaseStackId(stack_id));
    }

    fn memory_file(&self) -> &MemoryFile {
        &self.memory_file
    }

    fn layout(&self) -> &SysmsgLayout {
        &self.layout
    }
}

#[derive(Debug)]
pub(crate) struct MockRegs;

pub(crate) struct MockThread {
    tid: i32,
    stack_id: u32,
    regs: MockRegs,
    recorder: Arc<spin::Mutex<Recorder>>,
}

impl fmt::Display for MockThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock thread {} (tid {})", self.stack_id, self.tid)
    }
}

impl OsThread for MockThread {
    type Regs = MockRegs;

    fn tgid(&self) -> i32 {
        1000
    }

    fn tid(&self) -> i32 {
        self.tid
    }

    fn stack_id(&self) -> u32 {
        self.stack_id
    }

    fn init_regs(&self) -> &MockRegs {
        &self.regs
    }

    fn syscall_ignore_interrupt(
        &self,
        _regs: &MockRegs,
        sysno: Sysno,
        args: &[usize],
    ) -> Result<usize, Errno> {
        self.recorder
            .lock()
            .record(Call::ThreadSyscall(sysno, args.to_vec()), Op::Syscall(sysno))
            .map(|()| args.first().copied().unwrap_or(0))
    }

    fn kill(&self) -> Result<(), Errno> {
        self.recorder
            .lock()
            .record(Call::Kill { tid: self.tid }, Op::Kill)
    }
}
