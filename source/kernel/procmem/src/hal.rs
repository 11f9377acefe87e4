// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Collaborator seams of the address-space manager
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameOwner, PhysMap, Mmu, Scheduler, FileTree
//! DEPENDS_ON: types, error
//! INVARIANTS: Reference counts are only changed through FrameOwner; every frame returned by
//!             FileTree::get_page carries one reference owned by the caller

use core::ptr::NonNull;

use crate::error::{PageInError, SigInfo, VmError};
use crate::types::{Frame, ThreadId};

/// Physical frame allocator plus the per-frame page-info table.
pub trait FrameOwner: Send + Sync {
    /// Allocates a frame with a reference count of zero. Contents are unspecified.
    fn alloc(&self) -> Result<Frame, VmError>;
    /// Returns a frame that holds no references to the allocator.
    fn free(&self, frame: Frame);
    fn incref(&self, frame: Frame);
    /// Drops one reference, freeing the frame when none remain.
    fn decref(&self, frame: Frame);
    fn refcount(&self, frame: Frame) -> usize;
    fn mark_accessed(&self, frame: Frame);
    fn mark_dirty(&self, frame: Frame);

    /// Whether a write must duplicate the frame first.
    fn needs_copy(&self, frame: Frame) -> bool {
        self.refcount(frame) > 1
    }
}

/// Kernel-virtual view of physical memory.
pub trait PhysMap: Send + Sync {
    /// Pointer to the first byte of `frame`, valid for `PAGE_SIZE` bytes.
    fn frame_ptr(&self, frame: Frame) -> NonNull<u8>;
}

/// Translation hardware of the executing processor.
pub trait Mmu: Send + Sync {
    /// Drops the cached translation of one page on the local processor.
    fn invalidate_page(&self, addr: u64);
    /// Drops every cached translation on the local processor.
    fn flush_all(&self);
    /// Makes `root` the active top-level table.
    fn load_root(&self, root: Frame);
    /// Disables interrupts, returning whether they were enabled.
    fn disable_interrupts(&self) -> bool;
    fn restore_interrupts(&self, was_enabled: bool);
}

/// Thread services consumed by fault handling.
pub trait Scheduler: Send + Sync {
    fn current_thread(&self) -> ThreadId;
    fn send_signal(&self, thread: ThreadId, info: SigInfo);
    /// Wakes threads blocked on the physical address of `frame`.
    fn wake_blocked_on(&self, frame: Frame);
}

/// Page cache of a mappable object.
pub trait FileTree: Send + Sync {
    /// Returns the frame caching the page at byte `offset`, which is page aligned.
    ///
    /// The returned frame carries one reference that the caller now owns. May block on I/O;
    /// faults call it with the space lock held.
    fn get_page(&self, offset: u64) -> Result<Frame, PageInError>;
}

/// Restores the interrupt state captured at construction on drop.
pub(crate) struct IrqGuard<'a> {
    mmu: &'a dyn Mmu,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub(crate) fn new(mmu: &'a dyn Mmu) -> Self {
        let was_enabled = mmu.disable_interrupts();
        Self { mmu, was_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.mmu.restore_interrupts(self.was_enabled);
    }
}
