// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address spaces and the context object they share
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: VmContext, ProcMem (create/up/down/destroy/clone_space/activate/dump)
//! DEPENDS_ON: walker::PageTableWalker, segment::SegmentList, hal::*
//! INVARIANTS: One spin lock per space guards its segment list and its table tree;
//!             the root frame is owned exclusively by its space; a space with owners is
//!             never destroyed
//!
//! The space lock is a spin lock and a fault holds it across `FileTree::get_page`, which
//! may block on I/O. Other threads of the same process spin on the lock until the page-in
//! completes; only threads of other processes keep running.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::anon::AnonTree;
use crate::entry::Entry;
use crate::error::VmError;
use crate::fault::FaultStats;
use crate::hal::{FileTree, FrameOwner, IrqGuard, Mmu, PhysMap, Scheduler};
use crate::layout::Layout;
use crate::segment::SegmentList;
use crate::types::{Frame, PageIndex};
use crate::walker::PageTableWalker;
use crate::window::FrameWindow;

/// Collaborators and configuration shared by every address space of one machine.
pub struct VmContext {
    layout: Layout,
    frames: Arc<dyn FrameOwner>,
    window: Arc<FrameWindow>,
    mmu: Arc<dyn Mmu>,
    sched: Arc<dyn Scheduler>,
}

impl VmContext {
    pub fn new(
        layout: Layout,
        frames: Arc<dyn FrameOwner>,
        phys: Arc<dyn PhysMap>,
        mmu: Arc<dyn Mmu>,
        sched: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let window = Arc::new(FrameWindow::new(phys));
        Arc::new(Self { layout, frames, window, mmu, sched })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn frames(&self) -> &dyn FrameOwner {
        &*self.frames
    }

    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    pub fn mmu(&self) -> &dyn Mmu {
        &*self.mmu
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.sched
    }

    pub(crate) fn walker(&self, root: Frame) -> PageTableWalker<'_> {
        PageTableWalker::new(root, self.layout, &*self.frames, &self.window, &*self.mmu)
    }

    /// Fresh backing identity for an anonymous shared mapping.
    pub(crate) fn anon_tree(&self) -> Arc<dyn FileTree> {
        Arc::new(AnonTree::new(self.frames.clone(), self.window.clone()))
    }
}

pub(crate) struct SpaceInner {
    /// `None` once the space has been torn down.
    pub(crate) root: Option<Frame>,
    pub(crate) segments: SegmentList,
}

/// One process address space.
pub struct ProcMem {
    pub(crate) ctx: Arc<VmContext>,
    pub(crate) inner: Mutex<SpaceInner>,
    owners: AtomicUsize,
    pub(crate) stats: FaultStats,
}

impl ProcMem {
    /// Allocates an empty table tree and a single hole over the whole range. One owner.
    pub fn create(ctx: &Arc<VmContext>) -> Result<Self, VmError> {
        let root = ctx.frames().alloc()?;
        ctx.window().zero(root);
        log::debug!(target: "vm", "create: root={:?}", root);
        Ok(Self::with_parts(ctx, root, SegmentList::new(ctx.layout().max_page())))
    }

    fn with_parts(ctx: &Arc<VmContext>, root: Frame, segments: SegmentList) -> Self {
        Self {
            ctx: ctx.clone(),
            inner: Mutex::new(SpaceInner { root: Some(root), segments }),
            owners: AtomicUsize::new(1),
            stats: FaultStats::new(),
        }
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub fn owners(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }

    /// Registers another thread sharing this space.
    pub fn up(&self) {
        self.owners.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one owner; the last one tears the space down. Returns whether it did.
    pub fn down(&self) -> Result<bool, VmError> {
        let prev = self
            .owners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| VmError::Destroyed)?;
        if prev == 1 {
            self.teardown()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Tears down a space whose owners are all gone.
    pub fn destroy(&self) -> Result<(), VmError> {
        if self.owners() != 0 {
            return Err(VmError::InUse);
        }
        self.teardown()
    }

    fn teardown(&self) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let root = inner.root.take().ok_or(VmError::Destroyed)?;
        self.ctx.walker(root).release_tree();
        inner.segments.clear();
        log::debug!(target: "vm", "destroy: root={:?}", root);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().root.is_none()
    }

    pub fn root(&self) -> Option<Frame> {
        self.inner.lock().root
    }

    /// Fork-style copy: private pages become copy-on-write in both spaces.
    pub fn clone_space(&self) -> Result<ProcMem, VmError> {
        let inner = self.inner.lock();
        let root = inner.root.ok_or(VmError::Destroyed)?;
        let child_root = self.ctx.walker(root).clone_tree()?;
        // source entries lost their write bits
        self.ctx.mmu().flush_all();
        let child = Self::with_parts(&self.ctx, child_root, inner.segments.fork());
        log::debug!(target: "vm", "clone: parent={:?} child={:?}", root, child_root);
        Ok(child)
    }

    /// Switches the executing processor to this space.
    pub fn activate(&self) -> Result<(), VmError> {
        let root = self.root().ok_or(VmError::Destroyed)?;
        let mmu = self.ctx.mmu();
        let _irq = IrqGuard::new(mmu);
        mmu.load_root(root);
        mmu.flush_all();
        Ok(())
    }

    /// Leaf entry mapping `addr`, if its table path exists.
    pub fn entry(&self, addr: u64) -> Option<Entry> {
        let inner = self.inner.lock();
        let root = inner.root?;
        self.ctx.walker(root).find(PageIndex::from_addr(addr))
    }

    /// Runs `f` on the segment list under the space lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&SegmentList) -> R) -> R {
        f(&self.inner.lock().segments)
    }

    /// Segment listing with the segment holding `addr` marked.
    pub fn dump(&self, addr: u64) -> String {
        self.inner.lock().segments.dump(addr).to_string()
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Sets the accessed bit, and the dirty bit on writes, as the hardware walker would.
    #[cfg(any(test, feature = "sim"))]
    pub(crate) fn touch(&self, addr: u64, write: bool) {
        let inner = self.inner.lock();
        let Some(root) = inner.root else { return };
        let mut walker = self.ctx.walker(root);
        if let Ok(Some(entry)) = walker.lookup(PageIndex::from_addr(addr), false) {
            entry.set_accessed(true);
            if write {
                entry.set_dirty(true);
            }
        }
    }
}

impl Drop for ProcMem {
    fn drop(&mut self) {
        if self.inner.get_mut().root.is_some() {
            log::warn!(target: "vm", "dropping live address space with {} owners", self.owners());
            let _ = self.teardown();
        }
    }
}
