// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Multi-level page-table walker with lazy allocation of intermediate levels
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageTableWalker
//! DEPENDS_ON: hal::{FrameOwner, Mmu}, window::FrameWindow, layout::Layout, entry::Entry
//! INVARIANTS: Callers hold the owning space's lock for the walker's lifetime;
//!             intermediate tables are zeroed before they are linked in;
//!             table frames are never shared between trees

extern crate alloc;

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::entry::Entry;
use crate::error::VmError;
use crate::hal::{FrameOwner, Mmu};
use crate::layout::{Layout, ENTRIES_PER_TABLE};
use crate::types::{Frame, PageIndex};
use crate::window::FrameWindow;

enum Probe {
    /// No table at `level` covers the page.
    Missing(u32),
    Leaf(NonNull<Entry>),
}

/// Walks the table tree rooted at one frame.
pub struct PageTableWalker<'a> {
    root: Frame,
    layout: Layout,
    frames: &'a dyn FrameOwner,
    window: &'a FrameWindow,
    mmu: &'a dyn Mmu,
}

impl<'a> PageTableWalker<'a> {
    pub fn new(
        root: Frame,
        layout: Layout,
        frames: &'a dyn FrameOwner,
        window: &'a FrameWindow,
        mmu: &'a dyn Mmu,
    ) -> Self {
        Self { root, layout, frames, window, mmu }
    }

    pub fn root(&self) -> Frame {
        self.root
    }

    fn slot(&self, table: Frame, index: usize) -> NonNull<Entry> {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let base = self.window.phys().frame_ptr(table).cast::<Entry>();
        // SAFETY: a table frame holds ENTRIES_PER_TABLE entries and index is in range.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(index)) }
    }

    fn new_table(&self) -> Result<Frame, VmError> {
        let frame = self.frames.alloc()?;
        self.window.zero(frame);
        Ok(frame)
    }

    fn probe(&self, page: PageIndex) -> Probe {
        let mut table = self.root;
        for level in 0..self.layout.leaf_level() {
            // SAFETY: slot points into a live table of this tree.
            let entry = unsafe { *self.slot(table, self.layout.index(page, level)).as_ptr() };
            if !entry.is_present() {
                return Probe::Missing(level);
            }
            table = entry.frame();
        }
        Probe::Leaf(self.slot(table, self.layout.index(page, self.layout.leaf_level())))
    }

    fn walk(&mut self, page: PageIndex, create: bool) -> Result<Option<NonNull<Entry>>, VmError> {
        let mut table = self.root;
        for level in 0..self.layout.leaf_level() {
            // SAFETY: the space lock serializes every access to this tree.
            let entry = unsafe { &mut *self.slot(table, self.layout.index(page, level)).as_ptr() };
            if !entry.is_present() {
                if !create {
                    return Ok(None);
                }
                let next = self.new_table()?;
                *entry = Entry::table(next);
                self.mmu.flush_all();
            }
            table = entry.frame();
        }
        Ok(Some(self.slot(table, self.layout.index(page, self.layout.leaf_level()))))
    }

    /// Leaf entry for `page`, creating missing intermediate tables when `create` is set.
    ///
    /// Never populates the leaf itself.
    pub fn lookup(&mut self, page: PageIndex, create: bool) -> Result<Option<&mut Entry>, VmError> {
        // SAFETY: the entry lives in a table owned by this tree; the borrow is tied to self.
        Ok(self.walk(page, create)?.map(|slot| unsafe { &mut *slot.as_ptr() }))
    }

    /// Leaf entry for `page`, allocating the path to it.
    pub fn materialize(&mut self, page: PageIndex) -> Result<&mut Entry, VmError> {
        let slot = self.walk(page, true)?.ok_or(VmError::OutOfFrames)?;
        // SAFETY: as in `lookup`.
        Ok(unsafe { &mut *slot.as_ptr() })
    }

    /// Copy of the leaf entry for `page`, if the path to it exists.
    pub fn find(&self, page: PageIndex) -> Option<Entry> {
        match self.probe(page) {
            Probe::Missing(_) => None,
            // SAFETY: slot points into a live leaf table.
            Probe::Leaf(slot) => Some(unsafe { *slot.as_ptr() }),
        }
    }

    /// Drops the local cached translation of `page`.
    pub fn invalidate(&self, page: PageIndex) {
        self.mmu.invalidate_page(page.addr());
    }

    /// Clears every non-empty leaf in `[start, end)` and drops the references of loaded ones.
    ///
    /// Entries are cleared and invalidated before any frame is released.
    pub fn clear_range(&mut self, start: PageIndex, end: PageIndex) -> usize {
        let mut released = Vec::new();
        let mut page = start.raw();
        while page < end.raw() {
            match self.probe(PageIndex::new(page)) {
                Probe::Missing(level) => {
                    let span = self.layout.span(level);
                    page = (page / span + 1) * span;
                }
                Probe::Leaf(slot) => {
                    // SAFETY: slot points into a live leaf table.
                    let entry = unsafe { &mut *slot.as_ptr() };
                    if !entry.is_empty() {
                        let old = *entry;
                        entry.clear();
                        self.invalidate(PageIndex::new(page));
                        if old.is_loaded() {
                            released.push(old);
                        }
                    }
                    page += 1;
                }
            }
        }
        let count = released.len();
        for old in released {
            self.release_leaf(old);
        }
        count
    }

    fn release_leaf(&self, old: Entry) {
        let frame = old.frame();
        if old.is_accessed() {
            self.frames.mark_accessed(frame);
        }
        if old.is_dirty() {
            self.frames.mark_dirty(frame);
        }
        self.frames.decref(frame);
    }

    /// Duplicates the tree for a clone.
    ///
    /// Private loaded leaves become copy-on-write in both trees; every loaded frame gains
    /// one reference. Table frames are copied. On failure the partial copy is released
    /// and the source keeps its (now copy-on-write) entries.
    pub fn clone_tree(&mut self) -> Result<Frame, VmError> {
        self.clone_table(self.root, 0)
    }

    fn clone_table(&mut self, src: Frame, level: u32) -> Result<Frame, VmError> {
        let dst = self.new_table()?;
        let leaf = level == self.layout.leaf_level();
        for index in 0..ENTRIES_PER_TABLE {
            // SAFETY: src is a live table of this tree; dst was just allocated.
            let from = unsafe { &mut *self.slot(src, index).as_ptr() };
            if from.is_empty() {
                continue;
            }
            if leaf {
                if from.is_loaded() {
                    if !from.is_shared() {
                        from.set_cow(true);
                        from.set_writable(false);
                    }
                    self.frames.incref(from.frame());
                }
                let copy = *from;
                // SAFETY: see above.
                unsafe { *self.slot(dst, index).as_ptr() = copy };
            } else if from.is_present() {
                match self.clone_table(from.frame(), level + 1) {
                    // SAFETY: see above.
                    Ok(child) => unsafe { *self.slot(dst, index).as_ptr() = Entry::table(child) },
                    Err(err) => {
                        self.release_table(dst, level);
                        return Err(err);
                    }
                }
            }
        }
        Ok(dst)
    }

    /// Releases every loaded leaf and frees every table frame, root included.
    pub fn release_tree(&mut self) {
        self.release_table(self.root, 0);
    }

    fn release_table(&self, table: Frame, level: u32) {
        let leaf = level == self.layout.leaf_level();
        for index in 0..ENTRIES_PER_TABLE {
            // SAFETY: table is a live frame of the tree being released.
            let entry = unsafe { *self.slot(table, index).as_ptr() };
            if leaf {
                if entry.is_loaded() {
                    self.release_leaf(entry);
                }
            } else if entry.is_present() {
                self.release_table(entry.frame(), level + 1);
            }
        }
        self.frames.free(table);
    }
}
