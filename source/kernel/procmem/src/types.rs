// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the address-space manager
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Frame, PageIndex, ThreadId, PAGE_SIZE, PAGE_SHIFT, PAGE_MASK
//! INVARIANTS: Frame 0 is never handed out by an allocator; PageIndex = address >> PAGE_SHIFT

use core::fmt;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask of the in-page offset bits of an address.
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Physical frame number.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Frame(u64);

impl Frame {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.0)
    }
}

/// Index of a virtual page (`address >> PAGE_SHIFT`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageIndex(u64);

impl PageIndex {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Page containing `addr`.
    #[inline]
    pub const fn from_addr(addr: u64) -> Self {
        Self(addr >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Base virtual address of the page.
    #[inline]
    pub const fn addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    #[inline]
    pub const fn plus(self, pages: u64) -> Self {
        Self(self.0 + pages)
    }
}

/// Scheduler-assigned thread identifier.
///
/// **Ownership**: only the scheduler creates thread IDs; this crate stores them to tie
/// thread-local mappings to their creator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}
