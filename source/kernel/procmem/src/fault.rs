// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolution (lazy paging, permission policy, copy-on-write)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: ProcMem::fault, ProcMem::pin_frame, VmContext::dispatch_fault, FaultStats
//! DEPENDS_ON: segment::SegmentList, walker::PageTableWalker, hal::{FrameOwner, FileTree, Scheduler}
//! INVARIANTS: The space lock is held for the whole resolution; desired protection is
//!             computed at most once per page; a private page is never written while cow;
//!             dispatch_fault is the only place a FaultError becomes a signal
//!
//! TLB invalidation after a copy-on-write break is local only. Other processors may keep
//! a stale translation of the old frame until their next flush; threads blocked on the old
//! frame's physical address are woken instead of issuing a cross-processor shootdown.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FaultError, SigInfo};
use crate::flags::Prot;
use crate::segment::Backing;
use crate::space::{ProcMem, SpaceInner, VmContext};
use crate::types::{Frame, PageIndex, ThreadId, PAGE_SIZE};

/// Kind of access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// Protection bits the access needs. Every access needs read.
    pub fn required(self) -> Prot {
        match self {
            AccessKind::Read => Prot::READ,
            AccessKind::Write => Prot::READ | Prot::WRITE,
            AccessKind::Execute => Prot::READ | Prot::EXEC,
        }
    }
}

/// Privilege level the faulting instruction ran at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// Hardware fault report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    pub addr: u64,
    pub access: AccessKind,
    pub privilege: Privilege,
    pub thread: ThreadId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Retry the instruction.
    Resolved,
    /// The thread was sent this signal.
    Signalled(SigInfo),
}

/// Per-space fault counters.
#[derive(Debug, Default)]
pub struct FaultStats {
    faults: AtomicU64,
    zero_fills: AtomicU64,
    page_ins: AtomicU64,
    cow_copies: AtomicU64,
    cow_reuses: AtomicU64,
    signals: AtomicU64,
}

/// Point-in-time copy of [`FaultStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultCounts {
    pub faults: u64,
    pub zero_fills: u64,
    pub page_ins: u64,
    pub cow_copies: u64,
    pub cow_reuses: u64,
    pub signals: u64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            page_ins: AtomicU64::new(0),
            cow_copies: AtomicU64::new(0),
            cow_reuses: AtomicU64::new(0),
            signals: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FaultCounts {
        FaultCounts {
            faults: self.faults.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
            page_ins: self.page_ins.load(Ordering::Relaxed),
            cow_copies: self.cow_copies.load(Ordering::Relaxed),
            cow_reuses: self.cow_reuses.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
        }
    }
}

/// Resolves `page` for an access needing `required`, with the space lock held.
///
/// With `break_cow` set a copy-on-write page is made private and writable even when the
/// access itself does not write.
fn resolve(
    ctx: &VmContext,
    inner: &mut SpaceInner,
    stats: &FaultStats,
    page: PageIndex,
    required: Prot,
    break_cow: bool,
) -> Result<Frame, FaultError> {
    let root = inner.root.ok_or(FaultError::MapErr)?;
    let seg = inner.segments.find(page);
    let Some(mapping) = seg.mapping.as_ref() else {
        return Err(FaultError::MapErr);
    };
    let seg_start = seg.start;

    let mut walker = ctx.walker(root);
    let entry = walker.materialize(page)?;
    if !entry.is_overridden() {
        entry.set_desired(mapping.prot);
    }
    if !entry.desired().contains(required) {
        return Err(FaultError::AccErr);
    }

    if !entry.is_loaded() {
        let frame = match &mapping.backing {
            Backing::File(tree) => {
                let offset = mapping.offset + (page.raw() - seg_start.raw()) * PAGE_SIZE as u64;
                let frame = tree.get_page(offset)?;
                FaultStats::bump(&stats.page_ins);
                frame
            }
            Backing::Anonymous => {
                let frame = ctx.frames().alloc()?;
                ctx.window().zero(frame);
                ctx.frames().incref(frame);
                FaultStats::bump(&stats.zero_fills);
                frame
            }
        };
        entry.install(frame, mapping.is_shared());
        ctx.mmu().invalidate_page(page.addr());
        log::trace!(target: "vm::fault", "loaded {:#x} -> {:?}", page.addr(), frame);
    }

    if break_cow && entry.is_cow() {
        let old = entry.frame();
        if ctx.frames().needs_copy(old) {
            let copy = ctx.frames().alloc()?;
            ctx.window().copy(copy, old);
            ctx.frames().incref(copy);
            entry.set_frame(copy);
            ctx.frames().decref(old);
            ctx.scheduler().wake_blocked_on(old);
            FaultStats::bump(&stats.cow_copies);
            log::trace!(target: "vm::fault", "cow copy {:#x}: {:?} -> {:?}", page.addr(), old, copy);
        } else {
            FaultStats::bump(&stats.cow_reuses);
        }
        entry.set_cow(false);
        entry.set_writable(entry.desired().contains(Prot::WRITE));
    }

    let frame = entry.frame();
    walker.invalidate(page);
    Ok(frame)
}

impl ProcMem {
    /// Resolves a fault at `addr` without delivering any signal.
    pub fn fault(&self, addr: u64, access: AccessKind) -> Result<(), FaultError> {
        if !self.ctx.layout().contains(addr) {
            return Err(FaultError::MapErr);
        }
        FaultStats::bump(&self.stats.faults);
        let mut inner = self.inner.lock();
        resolve(
            &self.ctx,
            &mut inner,
            &self.stats,
            PageIndex::from_addr(addr),
            access.required(),
            access == AccessKind::Write,
        )
        .map(|_| ())
    }

    /// Frame currently backing `addr`, loaded and made private as a write fault would.
    ///
    /// The returned frame carries one extra reference for the caller. Pages the owner
    /// cannot read are never pinned.
    pub fn pin_frame(&self, addr: u64, required: Prot) -> Option<Frame> {
        if !self.ctx.layout().contains(addr) {
            return None;
        }
        let mut inner = self.inner.lock();
        let page = PageIndex::from_addr(addr);
        let required = required.normalized() | Prot::READ;
        let frame = resolve(&self.ctx, &mut inner, &self.stats, page, required, true).ok()?;
        self.ctx.frames().incref(frame);
        Some(frame)
    }
}

impl VmContext {
    /// Entry point of the page-fault trap.
    ///
    /// Panics on faults that indicate kernel corruption: a kernel fault with no address
    /// space, or a protection violation at kernel privilege.
    pub fn dispatch_fault(&self, space: Option<&ProcMem>, info: FaultInfo) -> FaultOutcome {
        let Some(space) = space else {
            if info.privilege == Privilege::Kernel {
                panic!("page fault in kernel without address space, address {:#x}", info.addr);
            }
            let sig = FaultError::MapErr.siginfo(info.addr);
            self.scheduler().send_signal(info.thread, sig);
            return FaultOutcome::Signalled(sig);
        };
        match space.fault(info.addr, info.access) {
            Ok(()) => FaultOutcome::Resolved,
            Err(FaultError::AccErr) if info.privilege == Privilege::Kernel => {
                panic!("page fault in kernel, address {:#x}", info.addr);
            }
            Err(err) => {
                let sig = err.siginfo(info.addr);
                FaultStats::bump(&space.stats.signals);
                log::warn!(
                    target: "vm::fault",
                    "thread {} {:?} at {:#x}: {} (signal {})",
                    info.thread.raw(),
                    info.access,
                    info.addr,
                    err,
                    sig.signo.number()
                );
                self.scheduler().send_signal(info.thread, sig);
                FaultOutcome::Signalled(sig)
            }
        }
    }
}
