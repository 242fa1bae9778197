// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A stub "process" that is really the test process itself.
//!
//! Stub memory lives in an address reservation of the test process, and each stub thread is a
//! forked child that does nothing but wait to be killed. This exercises the real syscalls
//! (`mmap`, `munmap`, `tgkill`, `wait4`) without a ptrace-based controller.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use core::fmt;
use std::sync::Arc;

use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::{ForkResult, Pid};
use syscalls::{Errno, Sysno};
use systrap_stub::id_pool::IdPool;
use systrap_stub::layout::PAGE_SIZE;
use systrap_stub::{MemoryFile, OsThread, StubThread, Subprocess, SysmsgLayout};

/// Per-thread memory of the test layouts.
pub const PER_THREAD_MEM_SIZE: usize = 4 * PAGE_SIZE;
/// Shared stack of the test layouts.
pub const SHARED_STACK_SIZE: usize = 2 * PAGE_SIZE;

/// Raw `syscall6` with missing trailing arguments zeroed.
pub fn raw_syscall(sysno: Sysno, args: &[usize]) -> Result<usize, Errno> {
    let mut a = [0usize; 6];
    a[..args.len()].copy_from_slice(args);
    // SAFETY: callers only pass addresses inside the test's own reservation or its memory file.
    unsafe { syscalls::syscall6(sysno, a[0], a[1], a[2], a[3], a[4], a[5]) }
}

/// `PROT_NONE` address space that stub mappings are placed into. Unmapped on drop.
pub struct Reservation {
    addr: usize,
    len: usize,
}

impl Reservation {
    pub fn new(len: usize) -> Self {
        let prot = ProtFlags::PROT_NONE;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE;
        let addr = raw_syscall(
            Sysno::mmap,
            &[
                0,
                len,
                prot.bits().cast_unsigned() as usize,
                flags.bits().cast_unsigned() as usize,
                usize::MAX,
                0,
            ],
        )
        .expect("reserve address space");
        Self { addr, len }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let _ = raw_syscall(Sysno::munmap, &[self.addr, self.len]);
    }
}

/// Whether `[addr, addr + len)` has nothing mapped in it.
pub fn is_unmapped(addr: usize, len: usize) -> bool {
    let prot = ProtFlags::PROT_NONE;
    let flags = MapFlags::MAP_PRIVATE.bits()
        | MapFlags::MAP_ANONYMOUS.bits()
        | libc::MAP_FIXED_NOREPLACE;
    let probe = raw_syscall(
        Sysno::mmap,
        &[
            addr,
            len,
            prot.bits().cast_unsigned() as usize,
            flags.cast_unsigned() as usize,
            usize::MAX,
            0,
        ],
    );
    match probe {
        Ok(got) => {
            raw_syscall(Sysno::munmap, &[got, len]).expect("undo probe mapping");
            got == addr
        }
        Err(Errno::EEXIST) => false,
        Err(errno) => panic!("unexpected probe failure: {errno}"),
    }
}

/// Fork a child that waits to be killed. It also dies with the forking thread.
pub fn spawn_idle_child() -> Pid {
    // SAFETY: the child only makes async-signal-safe calls before it blocks forever.
    match unsafe { nix::unistd::fork() }.expect("fork") {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            // SAFETY: plain libc calls with no pointers.
            unsafe {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                loop {
                    libc::pause();
                }
            }
        }
    }
}

pub struct LocalRegs;

/// A forked child standing in for a stub thread. Its syscalls run in the test process, where the
/// stub's memory lives.
pub struct LocalThread {
    pid: Pid,
    stack_id: u32,
    regs: LocalRegs,
}

impl LocalThread {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl fmt::Display for LocalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local thread {} (pid {})", self.stack_id, self.pid)
    }
}

impl OsThread for LocalThread {
    type Regs = LocalRegs;

    fn tgid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn tid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn stack_id(&self) -> u32 {
        self.stack_id
    }

    fn init_regs(&self) -> &LocalRegs {
        &self.regs
    }

    fn syscall_ignore_interrupt(
        &self,
        _regs: &LocalRegs,
        sysno: Sysno,
        args: &[usize],
    ) -> Result<usize, Errno> {
        raw_syscall(sysno, args)
    }
}

pub struct LocalSubprocess {
    layout: SysmsgLayout,
    memory_file: MemoryFile,
    stack_ids: spin::Mutex<IdPool>,
    reservation: Reservation,
}

impl LocalSubprocess {
    /// A subprocess with room for `max_threads` stub threads.
    pub fn new(max_threads: u32) -> Arc<Self> {
        let reservation = Reservation::new(PER_THREAD_MEM_SIZE * max_threads as usize);
        let layout = SysmsgLayout::new(
            reservation.addr() - PAGE_SIZE,
            reservation.addr(),
            PER_THREAD_MEM_SIZE,
            SHARED_STACK_SIZE,
            max_threads,
        )
        .expect("valid test layout");
        Arc::new(Self {
            stack_ids: spin::Mutex::new(layout.stack_id_pool()),
            layout,
            memory_file: MemoryFile::new(c"systrap-test").expect("memfd"),
            reservation,
        })
    }

    /// Create a stub thread backed by a new idle child and a fresh shared stack.
    pub fn new_stub(self: &Arc<Self>) -> StubThread<Self> {
        let stack_id = self.stack_ids.lock().allocate().expect("free stack id");
        let thread = LocalThread {
            pid: spawn_idle_child(),
            stack_id,
            regs: LocalRegs,
        };
        let range = self
            .memory_file
            .allocate(self.layout.shared_stack_size())
            .expect("allocate shared stack");
        StubThread::new(self.clone(), thread, range).expect("create stub thread")
    }

    /// Create a stub thread with both of its stacks mapped, the way a stub process sets them up.
    pub fn new_mapped_stub(self: &Arc<Self>) -> StubThread<Self> {
        let stub = self.new_stub();
        let addr = stub.sysmsg_per_thread_mem_addr();
        stub.map_stack(addr, false).expect("map shared stack");
        stub.map_private_stack(
            addr + SHARED_STACK_SIZE,
            PER_THREAD_MEM_SIZE - SHARED_STACK_SIZE,
        )
        .expect("map private stack");
        stub
    }

    pub fn is_stack_id_allocated(&self, stack_id: u32) -> bool {
        self.stack_ids.lock().is_allocated(stack_id)
    }
}

impl Subprocess for LocalSubprocess {
    type Thread = LocalThread;
    type Context = ();

    fn syscall(&self, sysno: Sysno, args: &[usize]) -> Result<usize, Errno> {
        raw_syscall(sysno, args)
    }

    fn release_stack_id(&self, stack_id: u32) {
        assert!(
            self.stack_ids.lock().recycle(stack_id),
            "stack id {stack_id} released twice"
        );
    }

    fn memory_file(&self) -> &MemoryFile {
        &self.memory_file
    }

    fn layout(&self) -> &SysmsgLayout {
        &self.layout
    }
}
