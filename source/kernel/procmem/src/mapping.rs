// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: mmap/mprotect/munmap semantics on a process address space
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: ProcMem::{map, protect, unmap, unmap_thread}, OpenFile
//! DEPENDS_ON: segment::SegmentList, walker::PageTableWalker
//! INVARIANTS: Argument errors are reported before any state changes; displaced resident
//!             pages are released under the same lock that rewrites the segment list

extern crate alloc;

use alloc::sync::Arc;

use crate::error::Errno;
use crate::flags::{Access, MapFlags, Prot};
use crate::hal::FileTree;
use crate::segment::{Backing, Mapping, Placement, Sharing};
use crate::space::{ProcMem, SpaceInner};
use crate::types::{PageIndex, ThreadId, PAGE_MASK, PAGE_SIZE};

/// An open file as seen by `map`.
#[derive(Clone)]
pub struct OpenFile {
    /// Page tree of the file; `None` for files that cannot be mapped.
    pub tree: Option<Arc<dyn FileTree>>,
    pub access: Access,
}

impl OpenFile {
    pub fn new(tree: Arc<dyn FileTree>, access: Access) -> Self {
        Self { tree: Some(tree), access }
    }

    /// A file whose inode has no page tree (pipes, sockets, devices).
    pub fn unmappable(access: Access) -> Self {
        Self { tree: None, access }
    }
}

impl ProcMem {
    /// Creates, replaces or (with `MapFlags::UNMAP`) removes the mapping of a range.
    ///
    /// Returns the base address of the new segment.
    pub fn map(
        &self,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        file: Option<&OpenFile>,
        offset: u64,
    ) -> Result<u64, Errno> {
        let layout = *self.ctx.layout();
        let prot = prot.normalized();

        if flags.contains(MapFlags::UNMAP) && file.is_some() {
            return Err(Errno::Inval);
        }
        let (tree, access) = match file {
            None if !flags.contains(MapFlags::ANON) => return Err(Errno::BadFd),
            None => (None, Access::READ | Access::WRITE),
            Some(OpenFile { tree: None, .. }) => return Err(Errno::NoDev),
            Some(OpenFile { tree: Some(tree), access }) => (Some(tree.clone()), *access),
        };
        if flags.contains(MapFlags::ANON) && tree.is_some() {
            return Err(Errno::Inval);
        }
        let sharing = match flags & (MapFlags::PRIVATE | MapFlags::SHARED) {
            MapFlags::PRIVATE => Sharing::Private,
            MapFlags::SHARED => Sharing::Shared,
            _ => return Err(Errno::Inval),
        };
        if sharing == Sharing::Shared
            && prot.contains(Prot::WRITE)
            && !access.contains(Access::WRITE)
        {
            return Err(Errno::Access);
        }
        let placed = addr != 0 || flags.contains(MapFlags::FIXED);
        if placed {
            let end = addr.checked_add(len).ok_or(Errno::Inval)?;
            if addr < layout.min_addr() || end > layout.max_addr() {
                return Err(Errno::Inval);
            }
        }
        if offset & PAGE_MASK != 0 {
            return Err(Errno::Inval);
        }
        if len == 0 || len & PAGE_MASK != 0 {
            return Err(Errno::Inval);
        }
        if flags.contains(MapFlags::FIXED) && addr & PAGE_MASK != 0 {
            return Err(Errno::Inval);
        }
        let pages = len / PAGE_SIZE as u64;

        let mapping = if flags.contains(MapFlags::UNMAP) {
            None
        } else {
            let backing = match tree {
                Some(tree) => Backing::File(tree),
                None if sharing == Sharing::Shared => Backing::File(self.ctx.anon_tree()),
                None => Backing::Anonymous,
            };
            let owner = flags
                .contains(MapFlags::THREAD)
                .then(|| self.ctx.scheduler().current_thread());
            Some(Mapping { backing, offset, prot, sharing, access, owner })
        };
        let placement = if placed {
            Placement::Fixed(PageIndex::from_addr(addr))
        } else {
            Placement::Anywhere { floor: layout.min_page() }
        };

        let mut inner = self.inner.lock();
        let root = inner.root.ok_or(Errno::Inval)?;
        let inserted = inner.segments.insert(placement, pages, mapping).ok_or(Errno::NoMem)?;
        let mut walker = self.ctx.walker(root);
        for seg in inserted.displaced_mappings() {
            walker.clear_range(seg.start, seg.end());
        }
        let base = inserted.start.addr();
        // dropping the displaced segments releases their backing references
        drop(inserted);
        verify(&inner, "map");
        log::debug!(
            target: "vm::map",
            "map {:#x}+{:#x} prot={:?} flags={:?}",
            base,
            len,
            prot,
            flags
        );
        Ok(base)
    }

    /// Changes the protection of every page in `[addr, addr + len)`.
    ///
    /// Resident pages see the change immediately; others pick it up on their next fault.
    pub fn protect(&self, addr: u64, len: u64, prot: Prot) -> Result<(), Errno> {
        let layout = *self.ctx.layout();
        if addr & PAGE_MASK != 0 || !layout.contains(addr) {
            return Err(Errno::Inval);
        }
        let prot = prot.normalized();
        let pages = len.div_ceil(PAGE_SIZE as u64);
        if pages == 0 {
            return Ok(());
        }
        let start = PageIndex::from_addr(addr);
        let end = start.plus(pages);
        if end > layout.max_page() {
            return Err(Errno::NoMem);
        }

        let inner = self.inner.lock();
        let root = inner.root.ok_or(Errno::Inval)?;
        for seg in inner.segments.overlapping(start, end) {
            let Some(mapping) = seg.mapping.as_ref() else {
                return Err(Errno::NoMem);
            };
            if prot.contains(Prot::WRITE)
                && mapping.is_shared()
                && !mapping.access.contains(Access::WRITE)
            {
                return Err(Errno::Access);
            }
        }

        let mut walker = self.ctx.walker(root);
        // every table on the range exists before the first entry changes
        for raw in start.raw()..end.raw() {
            walker.materialize(PageIndex::new(raw))?;
        }
        for raw in start.raw()..end.raw() {
            let page = PageIndex::new(raw);
            let entry = walker.materialize(page)?;
            entry.set_desired(prot);
            if entry.is_loaded() {
                entry.enforce(prot);
            }
            walker.invalidate(page);
        }
        verify(&inner, "protect");
        log::debug!(target: "vm::map", "protect {:#x}+{:#x} prot={:?}", addr, len, prot);
        Ok(())
    }

    /// Replaces the range with unmapped space.
    pub fn unmap(&self, addr: u64, len: u64) -> Result<(), Errno> {
        let flags = MapFlags::FIXED | MapFlags::UNMAP | MapFlags::PRIVATE | MapFlags::ANON;
        self.map(addr, len, Prot::empty(), flags, None, 0).map(|_| ())
    }

    /// Unmaps every thread-local segment created by `thread`.
    pub fn unmap_thread(&self, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let Some(root) = inner.root else { return };
        let freed = inner.segments.release_thread(thread);
        let mut walker = self.ctx.walker(root);
        for &(start, end) in &freed {
            walker.clear_range(start, end);
        }
        verify(&inner, "unmap_thread");
        if !freed.is_empty() {
            log::debug!(
                target: "vm::map",
                "thread {}: released {} thread-local segments",
                thread.raw(),
                freed.len()
            );
        }
    }
}

fn verify(inner: &SpaceInner, op: &str) {
    if cfg!(any(debug_assertions, feature = "debug_pt_verify")) {
        if let Err(err) = inner.segments.verify() {
            log::error!(target: "vm::map", "PT-VERIFY: {} left segment list broken: {}", op, err);
            debug_assert!(false, "segment list invariant violated after {op}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::FrameOwner;
    use crate::sim::SimMachine;

    const BASE: u64 = 0x4000_0000;
    const PAGE: u64 = PAGE_SIZE as u64;

    fn rw() -> Prot {
        Prot::READ | Prot::WRITE
    }

    fn anon_private() -> MapFlags {
        MapFlags::ANON | MapFlags::PRIVATE
    }

    #[test]
    fn validation_errors_follow_argument_order() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let file = sim.file(1);
        let ro = sim.open(&file, Access::READ);
        let fixed = anon_private() | MapFlags::FIXED;

        let unmap_file = MapFlags::UNMAP | MapFlags::PRIVATE;
        assert_eq!(space.map(BASE, PAGE, rw(), unmap_file, Some(&ro), 0), Err(Errno::Inval));
        assert_eq!(space.map(BASE, PAGE, rw(), MapFlags::PRIVATE, None, 0), Err(Errno::BadFd));
        let pipe = OpenFile::unmappable(Access::READ);
        assert_eq!(space.map(0, PAGE, rw(), MapFlags::PRIVATE, Some(&pipe), 0), Err(Errno::NoDev));
        assert_eq!(space.map(0, PAGE, rw(), anon_private(), Some(&ro), 0), Err(Errno::Inval));
        assert_eq!(space.map(0, PAGE, rw(), MapFlags::ANON, None, 0), Err(Errno::Inval));
        let both = MapFlags::ANON | MapFlags::PRIVATE | MapFlags::SHARED;
        assert_eq!(space.map(0, PAGE, rw(), both, None, 0), Err(Errno::Inval));
        assert_eq!(
            space.map(0, PAGE, Prot::WRITE, MapFlags::SHARED, Some(&ro), 0),
            Err(Errno::Access)
        );
        assert_eq!(space.map(0x1000, PAGE, rw(), fixed, None, 0), Err(Errno::Inval));
        assert_eq!(space.map(BASE, PAGE, rw(), fixed, None, 0x10), Err(Errno::Inval));
        assert_eq!(space.map(BASE, 0, rw(), fixed, None, 0), Err(Errno::Inval));
        assert_eq!(space.map(BASE, 0x1800, rw(), fixed, None, 0), Err(Errno::Inval));
        assert_eq!(space.map(BASE + 8, PAGE, rw(), fixed, None, 0), Err(Errno::Inval));
        // nothing was mapped by any of the failed calls
        assert_eq!(space.inspect(|segs| segs.len()), 1);
    }

    #[test]
    fn private_write_on_readonly_file_is_allowed() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let file = sim.file(2);
        let ro = sim.open(&file, Access::READ);
        let addr = space.map(0, 2 * PAGE, rw(), MapFlags::PRIVATE, Some(&ro), 0).unwrap();
        sim.store(&space, addr, b"scratch").unwrap();
        // the file page is untouched
        let mut byte = [0u8; 1];
        sim.window_read(file.cached(0).unwrap(), 0, &mut byte);
        assert_eq!(byte[0], file.pattern(0));
    }

    #[test]
    fn anywhere_placement_uses_top_of_address_space() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let max = sim.ctx().layout().max_addr();
        assert_eq!(space.map(0, 3 * PAGE, rw(), anon_private(), None, 0), Ok(max - 3 * PAGE));
        assert_eq!(space.map(0, PAGE, rw(), anon_private(), None, 0), Ok(max - 4 * PAGE));
    }

    #[test]
    fn non_fixed_hint_is_rounded_down_and_honoured() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        assert_eq!(space.map(BASE + 0x123, PAGE, rw(), anon_private(), None, 0), Ok(BASE));
    }

    #[test]
    fn anywhere_placement_fails_when_only_low_space_is_free() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let layout = *sim.ctx().layout();
        let fixed = anon_private() | MapFlags::FIXED;
        let len = layout.max_addr() - 2 * layout.min_addr();
        space.map(2 * layout.min_addr(), len, Prot::READ, fixed, None, 0).unwrap();
        let request = layout.min_addr() + PAGE;
        assert_eq!(space.map(0, request, rw(), anon_private(), None, 0), Err(Errno::NoMem));
    }

    #[test]
    fn fixed_map_over_resident_pages_releases_them() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let fixed = anon_private() | MapFlags::FIXED;
        space.map(BASE, 2 * PAGE, rw(), fixed, None, 0).unwrap();
        sim.store(&space, BASE, b"old").unwrap();
        let frame = space.entry(BASE).unwrap().frame();
        assert_eq!(sim.frames.refcount(frame), 1);

        space.map(BASE, PAGE, rw(), fixed, None, 0).unwrap();
        assert!(space.entry(BASE).unwrap().is_empty());
        assert_eq!(sim.frames.refcount(frame), 0);
        let mut buf = [0xffu8; 3];
        sim.load(&space, BASE, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0]);
    }

    #[test]
    fn narrowing_protect_blocks_the_next_write() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        space.map(BASE, PAGE, rw(), anon_private() | MapFlags::FIXED, None, 0).unwrap();
        sim.store(&space, BASE, b"A").unwrap();

        space.protect(BASE, PAGE, Prot::READ).unwrap();
        let err = sim.store(&space, BASE, b"B").unwrap_err();
        assert_eq!(err.code, crate::error::SigCode::AccErr);
        let mut buf = [0u8; 1];
        sim.load(&space, BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"A");
    }

    #[test]
    fn widening_protect_on_resident_page_is_immediate() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        space
            .map(BASE, PAGE, Prot::READ, MapFlags::ANON | MapFlags::SHARED | MapFlags::FIXED, None, 0)
            .unwrap();
        let mut buf = [0u8; 1];
        sim.load(&space, BASE, &mut buf).unwrap();
        assert!(!space.entry(BASE).unwrap().is_writable());

        space.protect(BASE, PAGE, Prot::WRITE).unwrap();
        let entry = space.entry(BASE).unwrap();
        assert!(entry.is_writable());
        assert_eq!(entry.desired(), rw());
    }

    #[test]
    fn protect_on_unloaded_page_is_deferred() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        space.map(BASE, 2 * PAGE, rw(), anon_private() | MapFlags::FIXED, None, 0).unwrap();
        space.protect(BASE + PAGE, PAGE, Prot::empty()).unwrap();
        let entry = space.entry(BASE + PAGE).unwrap();
        assert!(!entry.is_loaded() && entry.is_overridden());
        let err = sim.load(&space, BASE + PAGE, &mut [0u8; 1]).unwrap_err();
        assert_eq!(err.code, crate::error::SigCode::AccErr);
        // the segment itself keeps its original protection
        assert_eq!(space.inspect(|segs| segs.find(PageIndex::from_addr(BASE)).prot()), rw());
    }

    #[test]
    fn protect_out_of_frames_leaves_earlier_pages_alone() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        // pages 510..514 straddle two leaf tables; only the first one exists after the store
        let base = BASE + 510 * PAGE;
        space.map(base, 4 * PAGE, rw(), anon_private() | MapFlags::FIXED, None, 0).unwrap();
        sim.store(&space, base, b"A").unwrap();
        sim.frames.set_limit(Some(sim.frames.live_frames()));

        assert_eq!(space.protect(base, 4 * PAGE, Prot::READ), Err(Errno::NoMem));
        let entry = space.entry(base).unwrap();
        assert_eq!(entry.desired(), rw());
        assert!(entry.is_writable());
        assert!(!space.entry(base + PAGE).map_or(false, |e| e.is_overridden()));
        sim.store(&space, base, b"B").unwrap();

        sim.frames.set_limit(None);
        space.protect(base, 4 * PAGE, Prot::READ).unwrap();
        assert!(!space.entry(base).unwrap().is_writable());
        assert_eq!(space.entry(base + 3 * PAGE).unwrap().desired(), Prot::READ);
    }

    #[test]
    fn protect_rejects_holes_without_touching_anything() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        space.map(BASE, PAGE, rw(), anon_private() | MapFlags::FIXED, None, 0).unwrap();
        assert_eq!(space.protect(BASE, 2 * PAGE, Prot::READ), Err(Errno::NoMem));
        assert!(!space.entry(BASE).map_or(false, |e| e.is_overridden()));
        assert_eq!(space.protect(BASE + 1, PAGE, Prot::READ), Err(Errno::Inval));
        assert_eq!(space.protect(BASE, 0, Prot::READ), Ok(()));
        // partial pages round up
        assert_eq!(space.protect(BASE, 1, Prot::READ), Ok(()));
        assert_eq!(space.entry(BASE).unwrap().desired(), Prot::READ);
    }

    #[test]
    fn protect_write_on_readonly_shared_file_is_denied() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let file = sim.file(3);
        let ro = sim.open(&file, Access::READ);
        let addr = space.map(0, PAGE, Prot::READ, MapFlags::SHARED, Some(&ro), 0).unwrap();
        assert_eq!(space.protect(addr, PAGE, Prot::WRITE), Err(Errno::Access));
    }

    #[test]
    fn unmap_round_trip_restores_single_hole() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let before = space.dump(0);
        space.map(BASE, 4 * PAGE, rw(), anon_private() | MapFlags::FIXED, None, 0).unwrap();
        for page in 0..4 {
            sim.store(&space, BASE + page * PAGE, &[page as u8]).unwrap();
        }
        let live = sim.frames.live_frames();
        space.unmap(BASE, 4 * PAGE).unwrap();
        assert_eq!(space.dump(0), before);
        assert_eq!(sim.frames.live_frames(), live - 4);
        let err = sim.load(&space, BASE, &mut [0u8; 1]).unwrap_err();
        assert_eq!(err.code, crate::error::SigCode::MapErr);
    }

    #[test]
    fn thread_local_mappings_die_with_their_thread() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let worker = ThreadId::from_raw(42);
        let heap = space.map(0, PAGE, rw(), anon_private(), None, 0).unwrap();
        sim.sched.set_current(worker);
        let tls = space
            .map(0, 2 * PAGE, rw(), anon_private() | MapFlags::THREAD, None, 0)
            .unwrap();
        sim.sched.set_current(ThreadId::from_raw(1));
        sim.store(&space, tls, b"tls").unwrap();
        sim.store(&space, heap, b"heap").unwrap();
        let live = sim.frames.live_frames();

        space.unmap_thread(worker);
        assert_eq!(sim.frames.live_frames(), live - 1);
        assert!(sim.load(&space, tls, &mut [0u8; 1]).is_err());
        sim.load(&space, heap, &mut [0u8; 4]).unwrap();
        space.inspect(|segs| segs.verify()).unwrap();
        // the freed range merged with the hole beside it
        assert_eq!(space.inspect(|segs| segs.len()), 2);
    }

    #[test]
    fn anonymous_shared_mapping_gets_its_own_tree() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let flags = MapFlags::ANON | MapFlags::SHARED;
        let a = space.map(0, PAGE, rw(), flags, None, 0).unwrap();
        let b = space.map(0, PAGE, rw(), flags, None, 0).unwrap();
        sim.store(&space, a, b"a").unwrap();
        let mut buf = [0xffu8; 1];
        sim.load(&space, b, &mut buf).unwrap();
        assert_eq!(buf, [0]);
        assert_ne!(space.entry(a).unwrap().frame(), space.entry(b).unwrap().frame());
    }
}
