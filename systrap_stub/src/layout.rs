// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fixed address-space layout of the stub process.
//!
//! Every stub thread owns a fixed-size slot of per-thread memory at
//! `stack_base + per_thread_mem_size * stack_id`. The first `shared_stack_size` bytes of the slot
//! hold the sysmsg stack, which is backed by the memory file and also mapped into the controller;
//! the last page of the shared stack holds the [`Msg`](crate::sysmsg::Msg) followed by the
//! thread's FPU state. The stub code page sits strictly below all slots.

use thiserror::Error;

use crate::id_pool::IdPool;
use crate::sysmsg::Msg;

pub const PAGE_SIZE: usize = 4096;

/// Upper bound (exclusive) of user addresses on a 4-level page table.
pub const TASK_ADDR_MAX: usize = 0x7FFF_FFFF_F000; // (1 << 47) - PAGE_SIZE

/// Offset of the FPU state from the message, inside the message page.
pub const FPU_STATE_OFFSET_FROM_MSG: usize = 64;

/// Errors from [`SysmsgLayout::new`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{what} ({value:#x}) is not page-aligned")]
    Misaligned { what: &'static str, value: usize },
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("shared stack ({shared:#x}) does not fit in the per-thread memory ({per_thread:#x})")]
    SharedStackTooLarge { shared: usize, per_thread: usize },
    #[error("stacks at {stack_base:#x} must lie above the stub code page at {stub_code_addr:#x}")]
    StacksBelowStubCode {
        stack_base: usize,
        stub_code_addr: usize,
    },
    #[error("per-thread memory for {threads} threads overflows the address space")]
    Overflow { threads: u32 },
}

/// Validated address-space layout shared by a controller and all of its stub threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysmsgLayout {
    stub_code_addr: usize,
    stack_base: usize,
    per_thread_mem_size: usize,
    shared_stack_size: usize,
    max_stub_threads: u32,
}

impl Default for SysmsgLayout {
    fn default() -> Self {
        Self {
            stub_code_addr: 0x7ff0_0000_0000,
            stack_base: 0x7ff0_0100_0000,
            per_thread_mem_size: 16 * PAGE_SIZE,
            shared_stack_size: 8 * PAGE_SIZE,
            max_stub_threads: 4096,
        }
    }
}

impl SysmsgLayout {
    /// Create a layout, checking that every per-thread slot fits below [`TASK_ADDR_MAX`].
    pub fn new(
        stub_code_addr: usize,
        stack_base: usize,
        per_thread_mem_size: usize,
        shared_stack_size: usize,
        max_stub_threads: u32,
    ) -> Result<Self, ConfigError> {
        for (what, value) in [
            ("stub code address", stub_code_addr),
            ("stack base", stack_base),
            ("per-thread memory size", per_thread_mem_size),
            ("shared stack size", shared_stack_size),
        ] {
            if !value.is_multiple_of(PAGE_SIZE) {
                return Err(ConfigError::Misaligned { what, value });
            }
        }
        if per_thread_mem_size == 0 {
            return Err(ConfigError::Zero("per-thread memory size"));
        }
        if shared_stack_size == 0 {
            return Err(ConfigError::Zero("shared stack size"));
        }
        if max_stub_threads == 0 {
            return Err(ConfigError::Zero("maximum number of stub threads"));
        }
        if shared_stack_size > per_thread_mem_size {
            return Err(ConfigError::SharedStackTooLarge {
                shared: shared_stack_size,
                per_thread: per_thread_mem_size,
            });
        }
        if stack_base < stub_code_addr.saturating_add(PAGE_SIZE) {
            return Err(ConfigError::StacksBelowStubCode {
                stack_base,
                stub_code_addr,
            });
        }
        let end = per_thread_mem_size
            .checked_mul(max_stub_threads as usize)
            .and_then(|total| total.checked_add(stack_base))
            .filter(|&end| end <= TASK_ADDR_MAX);
        if end.is_none() {
            return Err(ConfigError::Overflow {
                threads: max_stub_threads,
            });
        }
        Ok(Self {
            stub_code_addr,
            stack_base,
            per_thread_mem_size,
            shared_stack_size,
            max_stub_threads,
        })
    }

    /// Address of the stub code page. Only syscalls issued above it pass the seccomp policy.
    pub fn stub_code_addr(&self) -> usize {
        self.stub_code_addr
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub fn per_thread_mem_size(&self) -> usize {
        self.per_thread_mem_size
    }

    pub fn shared_stack_size(&self) -> usize {
        self.shared_stack_size
    }

    pub fn max_stub_threads(&self) -> u32 {
        self.max_stub_threads
    }

    /// Start of the per-thread memory of `stack_id` in the stub's address space.
    ///
    /// Distinct ids below [`max_stub_threads`](Self::max_stub_threads) give disjoint slots; the
    /// constructor guarantees the multiplication does not overflow for those ids.
    pub fn per_thread_mem_addr(&self, stack_id: u32) -> usize {
        debug_assert!(
            stack_id < self.max_stub_threads,
            "stack id {stack_id} outside of the layout ({} slots)",
            self.max_stub_threads
        );
        self.stack_base + self.per_thread_mem_size * stack_id as usize
    }

    /// Offset of the [`Msg`] from the start of the shared stack.
    pub fn msg_offset(&self) -> usize {
        self.shared_stack_size - PAGE_SIZE
    }

    /// Offset of the FPU state from the start of the shared stack.
    pub fn fpu_state_offset(&self) -> usize {
        self.msg_offset() + FPU_STATE_OFFSET_FROM_MSG
    }

    /// Smallest shared stack that can hold the message page.
    pub fn min_shared_stack_len(&self) -> usize {
        self.msg_offset() + core::mem::size_of::<Msg>()
    }

    /// A pool handing out exactly the stack ids this layout has slots for.
    pub fn stack_id_pool(&self) -> IdPool {
        IdPool::with_capacity(self.max_stub_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(stack_base: usize, per_thread: usize) -> SysmsgLayout {
        SysmsgLayout::new(stack_base - PAGE_SIZE, stack_base, per_thread, per_thread, 64).unwrap()
    }

    #[test]
    fn per_thread_address_example() {
        let layout = small(0x7f00_0000_0000, 4096);
        assert_eq!(layout.per_thread_mem_addr(2), 0x7f00_0000_2000);
        assert_eq!(layout.per_thread_mem_addr(0), 0x7f00_0000_0000);
    }

    #[test]
    fn per_thread_addresses_are_disjoint() {
        let layout = small(0x7f00_0000_0000, 3 * PAGE_SIZE);
        let slots: Vec<_> = (0..layout.max_stub_threads())
            .map(|id| layout.per_thread_mem_addr(id))
            .collect();
        for pair in slots.windows(2) {
            assert_eq!(pair[1] - pair[0], layout.per_thread_mem_size());
        }
        let unique: std::collections::BTreeSet<_> = slots.iter().collect();
        assert_eq!(unique.len(), slots.len());
    }

    #[test]
    fn default_layout_is_valid() {
        let d = SysmsgLayout::default();
        let checked = SysmsgLayout::new(
            d.stub_code_addr(),
            d.stack_base(),
            d.per_thread_mem_size(),
            d.shared_stack_size(),
            d.max_stub_threads(),
        );
        assert_eq!(checked, Ok(d));
    }

    #[test]
    fn message_page_is_last_page_of_shared_stack() {
        let d = SysmsgLayout::default();
        assert_eq!(d.msg_offset(), 7 * PAGE_SIZE);
        assert_eq!(d.fpu_state_offset() - d.msg_offset(), FPU_STATE_OFFSET_FROM_MSG);
        assert!(core::mem::size_of::<Msg>() <= FPU_STATE_OFFSET_FROM_MSG);
    }

    #[test]
    fn rejects_bad_layouts() {
        assert_eq!(
            SysmsgLayout::new(0x1000, 0x2001, 0x1000, 0x1000, 1),
            Err(ConfigError::Misaligned {
                what: "stack base",
                value: 0x2001
            })
        );
        assert_eq!(
            SysmsgLayout::new(0x1000, 0x2000, 0x1000, 0x2000, 1),
            Err(ConfigError::SharedStackTooLarge {
                shared: 0x2000,
                per_thread: 0x1000
            })
        );
        assert_eq!(
            SysmsgLayout::new(0x2000, 0x2000, 0x1000, 0x1000, 1),
            Err(ConfigError::StacksBelowStubCode {
                stack_base: 0x2000,
                stub_code_addr: 0x2000
            })
        );
        assert_eq!(
            SysmsgLayout::new(0x1000, 0x2000, 0x1000, 0x1000, 0),
            Err(ConfigError::Zero("maximum number of stub threads"))
        );
        assert_eq!(
            SysmsgLayout::new(0x1000, 0x7FFF_FFFF_E000, 0x1000, 0x1000, 2),
            Err(ConfigError::Overflow { threads: 2 })
        );
    }
}
