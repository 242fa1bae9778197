// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The memfd-backed file that provides memory shared between the controller and stubs.
//!
//! Ranges are handed out in whole pages and reference counted per page. When the last reference
//! to a page is dropped its backing is released with `FALLOC_FL_PUNCH_HOLE`, and the range becomes
//! available for reuse (reading zeros again).

use core::fmt;
use core::ptr::NonNull;
use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use hashbrown::HashMap;
use nix::sys::mman::{MapFlags, ProtFlags};
use syscalls::{Errno, Sysno};
use thiserror::Error;

use crate::layout::PAGE_SIZE;

/// A half-open byte range `[start, end)` of the memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRange {
    pub start: usize,
    pub end: usize,
}

impl FileRange {
    pub const fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "inverted file range");
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn is_page_aligned(&self) -> bool {
        self.start.is_multiple_of(PAGE_SIZE) && self.end.is_multiple_of(PAGE_SIZE)
    }

    fn pages(&self) -> impl Iterator<Item = usize> {
        (self.start..self.end).step_by(PAGE_SIZE)
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

#[derive(Debug, Error)]
pub enum MemoryFileError {
    #[error("failed to create the memory file: {0}")]
    Create(Errno),
    #[error("failed to grow the memory file to {size:#x} bytes: {errno}")]
    Grow { size: usize, errno: Errno },
    #[error("range {0} is empty or not page-aligned")]
    InvalidRange(FileRange),
    #[error("page at offset {offset:#x} is not allocated")]
    NotAllocated { offset: usize },
    #[error("failed to map {range}: {errno}")]
    Map { range: FileRange, errno: Errno },
}

/// A memfd handing out reference-counted page ranges.
pub struct MemoryFile {
    fd: OwnedFd,
    inner: spin::Mutex<Inner>,
}

struct Inner {
    size: usize,
    /// Reference count of every allocated page, keyed by page offset.
    refs: HashMap<usize, u32>,
    /// Released ranges, sorted by start and coalesced.
    free: Vec<FileRange>,
}

impl MemoryFile {
    /// Create an empty memory file named `name` (visible in `/proc/<pid>/maps`).
    pub fn new(name: &CStr) -> Result<Self, MemoryFileError> {
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let fd = unsafe {
            syscalls::syscall2(
                Sysno::memfd_create,
                name.as_ptr() as usize,
                libc::MFD_CLOEXEC as usize,
            )
        }
        .map_err(MemoryFileError::Create)?;
        // fds fit in a C int.
        #[allow(clippy::cast_possible_truncation)]
        let fd = fd as RawFd;
        Ok(Self {
            // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            inner: spin::Mutex::new(Inner {
                size: 0,
                refs: HashMap::new(),
                free: Vec::new(),
            }),
        })
    }

    /// The file descriptor as a raw syscall argument.
    pub fn fd_arg(&self) -> usize {
        self.fd.as_raw_fd().cast_unsigned() as usize
    }

    /// Current length of the file in bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Allocate `len` bytes (rounded up to whole pages), with a reference count of one.
    pub fn allocate(&self, len: usize) -> Result<FileRange, MemoryFileError> {
        let len = len.next_multiple_of(PAGE_SIZE);
        if len == 0 {
            return Err(MemoryFileError::InvalidRange(FileRange::new(0, 0)));
        }
        let mut inner = self.inner.lock();
        let range = if let Some(i) = inner.free.iter().position(|r| r.len() >= len) {
            let free = &mut inner.free[i];
            let range = FileRange::new(free.start, free.start + len);
            free.start += len;
            if free.is_empty() {
                inner.free.remove(i);
            }
            range
        } else {
            let start = inner.size;
            let end = start + len;
            self.truncate(end)?;
            inner.size = end;
            FileRange::new(start, end)
        };
        for page in range.pages() {
            inner.refs.insert(page, 1);
        }
        Ok(range)
    }

    /// Take an extra reference on every page of `range`.
    pub fn inc_ref(&self, range: FileRange) -> Result<(), MemoryFileError> {
        let mut inner = self.inner.lock();
        inner.check_allocated(range)?;
        for page in range.pages() {
            if let Some(count) = inner.refs.get_mut(&page) {
                *count += 1;
            }
        }
        Ok(())
    }

    /// Drop a reference on every page of `range`, releasing pages whose count reaches zero.
    ///
    /// Fails without changing anything if some page is not allocated, e.g. because the range
    /// was already released.
    pub fn dec_ref(&self, range: FileRange) -> Result<(), MemoryFileError> {
        let mut inner = self.inner.lock();
        inner.check_allocated(range)?;
        let mut released: Vec<FileRange> = Vec::new();
        for page in range.pages() {
            let Some(count) = inner.refs.get_mut(&page) else {
                continue;
            };
            *count -= 1;
            if *count > 0 {
                continue;
            }
            inner.refs.remove(&page);
            match released.last_mut() {
                Some(last) if last.end == page => last.end += PAGE_SIZE,
                _ => released.push(FileRange::new(page, page + PAGE_SIZE)),
            }
        }
        for range in released {
            self.punch_hole(range);
            inner.release(range);
        }
        Ok(())
    }

    /// Reference count of the page containing `offset`; zero if it is not allocated.
    pub fn ref_count(&self, offset: usize) -> u32 {
        let page = offset - offset % PAGE_SIZE;
        self.inner.lock().refs.get(&page).copied().unwrap_or(0)
    }

    /// Map `range` read-write and shared into the calling process.
    ///
    /// The caller owns the returned mapping and unmaps it with `munmap(ptr, range.len())`.
    pub fn map_shared(&self, range: FileRange) -> Result<NonNull<u8>, MemoryFileError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(MemoryFileError::InvalidRange(range));
        }
        // SAFETY: a fresh mapping chosen by the kernel does not alias any existing memory.
        let addr = unsafe {
            syscalls::syscall6(
                Sysno::mmap,
                0,
                range.len(),
                (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
                    .bits()
                    .cast_unsigned() as usize,
                MapFlags::MAP_SHARED.bits().cast_unsigned() as usize,
                self.fd_arg(),
                range.start,
            )
        }
        .map_err(|errno| MemoryFileError::Map { range, errno })?;
        NonNull::new(addr as *mut u8).ok_or(MemoryFileError::Map {
            range,
            errno: Errno::EFAULT,
        })
    }

    fn truncate(&self, size: usize) -> Result<(), MemoryFileError> {
        // SAFETY: ftruncate on an owned fd has no memory-safety preconditions.
        unsafe { syscalls::syscall2(Sysno::ftruncate, self.fd_arg(), size) }
            .map(|_| ())
            .map_err(|errno| MemoryFileError::Grow { size, errno })
    }

    fn punch_hole(&self, range: FileRange) {
        // SAFETY: fallocate on an owned fd has no memory-safety preconditions.
        let res = unsafe {
            syscalls::syscall4(
                Sysno::fallocate,
                self.fd_arg(),
                (libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE).cast_unsigned() as usize,
                range.start,
                range.len(),
            )
        };
        if let Err(errno) = res {
            // The pages are still reusable; only their memory is not returned to the system.
            systrap_util_log::warn!("failed to release memory file range {range}: {errno}");
        }
    }
}

impl Inner {
    fn check_allocated(&self, range: FileRange) -> Result<(), MemoryFileError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(MemoryFileError::InvalidRange(range));
        }
        match range.pages().find(|page| !self.refs.contains_key(page)) {
            Some(offset) => Err(MemoryFileError::NotAllocated { offset }),
            None => Ok(()),
        }
    }

    fn release(&mut self, range: FileRange) {
        let i = self.free.partition_point(|r| r.start < range.start);
        self.free.insert(i, range);
        // Coalesce with the neighbours on either side.
        if i + 1 < self.free.len() && self.free[i].end == self.free[i + 1].start {
            self.free[i].end = self.free.remove(i + 1).end;
        }
        if i > 0 && self.free[i - 1].end == self.free[i].start {
            self.free[i - 1].end = self.free.remove(i).end;
        }
    }
}

impl AsFd for MemoryFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for MemoryFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> MemoryFile {
        MemoryFile::new(c"systrap-test").unwrap()
    }

    #[test]
    fn allocation_rounds_up_to_pages() {
        let mf = file();
        let a = mf.allocate(1).unwrap();
        assert_eq!(a, FileRange::new(0, PAGE_SIZE));
        let b = mf.allocate(PAGE_SIZE + 1).unwrap();
        assert_eq!(b, FileRange::new(PAGE_SIZE, 3 * PAGE_SIZE));
        assert_eq!(mf.size(), 3 * PAGE_SIZE);
        assert!(mf.allocate(0).is_err());
    }

    #[test]
    fn reference_counting() {
        let mf = file();
        let r = mf.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(mf.ref_count(r.start), 1);
        mf.inc_ref(r).unwrap();
        assert_eq!(mf.ref_count(r.start + PAGE_SIZE + 8), 2);
        mf.dec_ref(r).unwrap();
        assert_eq!(mf.ref_count(r.start), 1);
        mf.dec_ref(r).unwrap();
        assert_eq!(mf.ref_count(r.start), 0);
        assert!(matches!(
            mf.dec_ref(r),
            Err(MemoryFileError::NotAllocated { offset }) if offset == r.start
        ));
    }

    #[test]
    fn released_ranges_are_reused_and_coalesced() {
        let mf = file();
        let a = mf.allocate(PAGE_SIZE).unwrap();
        let b = mf.allocate(PAGE_SIZE).unwrap();
        let c = mf.allocate(PAGE_SIZE).unwrap();
        mf.dec_ref(a).unwrap();
        mf.dec_ref(b).unwrap();
        // `a` and `b` merge into one two-page hole at the front of the file.
        let d = mf.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(d, FileRange::new(a.start, b.end));
        assert_eq!(mf.size(), 3 * PAGE_SIZE);
        mf.dec_ref(c).unwrap();
        mf.dec_ref(d).unwrap();
    }

    #[test]
    fn shared_mappings_see_each_other() {
        let mf = file();
        let r = mf.allocate(PAGE_SIZE).unwrap();
        let first = mf.map_shared(r).unwrap();
        let second = mf.map_shared(r).unwrap();
        // SAFETY: both point at one page mapped read-write above.
        unsafe {
            first.as_ptr().write_volatile(0x5a);
            assert_eq!(second.as_ptr().read_volatile(), 0x5a);
            for p in [first, second] {
                syscalls::syscall2(Sysno::munmap, p.as_ptr() as usize, r.len()).unwrap();
            }
        }
        mf.dec_ref(r).unwrap();
    }

    #[test]
    fn reused_pages_read_as_zero() {
        let mf = file();
        let r = mf.allocate(PAGE_SIZE).unwrap();
        let p = mf.map_shared(r).unwrap();
        // SAFETY: `p` maps one read-write page.
        unsafe { p.as_ptr().write_volatile(1) };
        mf.dec_ref(r).unwrap();
        let again = mf.allocate(PAGE_SIZE).unwrap();
        assert_eq!(again, r);
        // SAFETY: the shared mapping is still in place and backed by the file.
        unsafe {
            assert_eq!(p.as_ptr().read_volatile(), 0);
            syscalls::syscall2(Sysno::munmap, p.as_ptr() as usize, r.len()).unwrap();
        }
    }

    #[test]
    fn rejects_unaligned_ranges() {
        let mf = file();
        let r = mf.allocate(PAGE_SIZE).unwrap();
        let bad = FileRange::new(1, PAGE_SIZE);
        assert!(matches!(mf.inc_ref(bad), Err(MemoryFileError::InvalidRange(_))));
        assert!(matches!(mf.map_shared(bad), Err(MemoryFileError::InvalidRange(_))));
        mf.dec_ref(r).unwrap();
    }
}
