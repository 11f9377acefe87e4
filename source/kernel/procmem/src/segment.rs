// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Segment list (ordered partition of the address space into mappings and holes)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Segment, Mapping, Backing, Sharing, SegmentList, Placement, Inserted
//! DEPENDS_ON: flags::{Prot, Access}, hal::FileTree
//! INVARIANTS: Segments are sorted, non-empty, contiguous from page 0 to the span;
//!             no two holes are adjacent; callers hold the owning space's lock

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use thiserror::Error;

use crate::flags::{Access, Prot};
use crate::hal::FileTree;
use crate::types::{PageIndex, ThreadId, PAGE_SIZE};

/// Source of the contents of a mapped page.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first touch.
    Anonymous,
    /// Pages come from a page cache.
    File(Arc<dyn FileTree>),
}

impl Backing {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Backing::Anonymous)
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Anonymous => f.write_str("Anonymous"),
            Backing::File(tree) => write!(f, "File({:p})", Arc::as_ptr(tree)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Copy-on-write across clones.
    Private,
    /// Writes reach every mapper of the backing.
    Shared,
}

/// Attributes of a mapped segment.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub backing: Backing,
    /// Byte offset into the backing of the segment's first page.
    pub offset: u64,
    pub prot: Prot,
    pub sharing: Sharing,
    /// Open mode of the backing file.
    pub access: Access,
    /// Thread whose exit unmaps this segment.
    pub owner: Option<ThreadId>,
}

impl Mapping {
    /// Same attributes, starting `pages` pages further into the backing.
    pub fn advanced(&self, pages: u64) -> Self {
        let mut next = self.clone();
        next.offset += pages * PAGE_SIZE as u64;
        next
    }

    pub fn is_shared(&self) -> bool {
        self.sharing == Sharing::Shared
    }
}

/// One contiguous range of pages; `mapping == None` marks a hole.
#[derive(Clone, Debug)]
pub struct Segment {
    pub start: PageIndex,
    pub pages: u64,
    pub mapping: Option<Mapping>,
}

impl Segment {
    pub fn end(&self) -> PageIndex {
        self.start.plus(self.pages)
    }

    pub fn is_hole(&self) -> bool {
        self.mapping.is_none()
    }

    pub fn contains(&self, page: PageIndex) -> bool {
        page >= self.start && page < self.end()
    }

    /// Requested protection; empty for holes.
    pub fn prot(&self) -> Prot {
        self.mapping.as_ref().map_or(Prot::empty(), |m| m.prot)
    }
}

/// Where a new segment goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Highest hole large enough, not below the floor page.
    Anywhere { floor: PageIndex },
    Fixed(PageIndex),
}

/// Result of [`SegmentList::insert`].
#[derive(Debug)]
pub struct Inserted {
    pub start: PageIndex,
    /// Pieces of the list that the new segment replaced.
    pub displaced: Vec<Segment>,
}

impl Inserted {
    /// Displaced pieces that were mapped and may have resident pages.
    pub fn displaced_mappings(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.displaced.iter().filter(|seg| !seg.is_hole())
    }
}

/// Invariant violations reported by [`SegmentList::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("segment list is empty")]
    Empty,
    #[error("segment at page {0:#x} has no pages")]
    EmptySegment(u64),
    #[error("gap or overlap at page {0:#x}")]
    Discontiguous(u64),
    #[error("list ends at page {0:#x} instead of the span end")]
    Coverage(u64),
    #[error("adjacent holes at page {0:#x}")]
    UnmergedHoles(u64),
}

/// Ordered, exhaustive partition of `[0, span)` pages.
#[derive(Clone, Debug)]
pub struct SegmentList {
    segs: Vec<Segment>,
    span: u64,
}

impl SegmentList {
    /// A single hole covering `span` pages.
    pub fn new(span: PageIndex) -> Self {
        let mut list = Self { segs: Vec::new(), span: span.raw() };
        list.clear();
        list
    }

    pub fn span(&self) -> PageIndex {
        PageIndex::new(self.span)
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.segs.iter()
    }

    fn position(&self, page: PageIndex) -> usize {
        debug_assert!(page.raw() < self.span, "page {:#x} beyond segment list", page.raw());
        self.segs.partition_point(|seg| seg.start <= page).saturating_sub(1)
    }

    /// The segment containing `page`. Pages past the span resolve to the last segment.
    pub fn find(&self, page: PageIndex) -> &Segment {
        &self.segs[self.position(page)]
    }

    /// Splits the segment containing `page` so that a segment starts exactly at `page`.
    fn split_at(&mut self, page: PageIndex) {
        if page.raw() >= self.span {
            return;
        }
        let idx = self.position(page);
        let seg = &mut self.segs[idx];
        if seg.start == page {
            return;
        }
        let head = page.raw() - seg.start.raw();
        let tail = Segment {
            start: page,
            pages: seg.pages - head,
            mapping: seg.mapping.as_ref().map(|m| m.advanced(head)),
        };
        seg.pages = head;
        self.segs.insert(idx + 1, tail);
    }

    /// Start of the highest hole able to hold `pages` pages, if it lies at or above `floor`.
    pub fn place_high(&self, pages: u64, floor: PageIndex) -> Option<PageIndex> {
        let hole = self.segs.iter().rev().find(|seg| seg.is_hole() && seg.pages >= pages)?;
        let start = hole.end().raw() - pages;
        (start >= floor.raw()).then_some(PageIndex::new(start))
    }

    /// Places a segment of `pages` pages and returns where it went plus what it replaced.
    ///
    /// Returns `None` when no hole fits or a fixed range leaves the span.
    pub fn insert(
        &mut self,
        placement: Placement,
        pages: u64,
        mapping: Option<Mapping>,
    ) -> Option<Inserted> {
        if pages == 0 {
            return None;
        }
        let start = match placement {
            Placement::Anywhere { floor } => self.place_high(pages, floor)?,
            Placement::Fixed(start) => start,
        };
        if start.raw().checked_add(pages)? > self.span {
            return None;
        }
        let displaced = self.replace(start, pages, mapping);
        Some(Inserted { start, displaced })
    }

    fn replace(&mut self, start: PageIndex, pages: u64, mapping: Option<Mapping>) -> Vec<Segment> {
        let end = start.plus(pages);
        self.split_at(start);
        self.split_at(end);
        let first = self.position(start);
        let last = if end.raw() >= self.span { self.segs.len() } else { self.position(end) };
        let displaced: Vec<Segment> =
            self.segs.splice(first..last, [Segment { start, pages, mapping }]).collect();
        self.merge_holes_around(first);
        displaced
    }

    fn merge_holes_around(&mut self, mut idx: usize) {
        if !self.segs[idx].is_hole() {
            return;
        }
        if idx + 1 < self.segs.len() && self.segs[idx + 1].is_hole() {
            let next = self.segs.remove(idx + 1);
            self.segs[idx].pages += next.pages;
        }
        if idx > 0 && self.segs[idx - 1].is_hole() {
            let cur = self.segs.remove(idx);
            idx -= 1;
            self.segs[idx].pages += cur.pages;
        }
    }

    /// Merges every run of adjacent holes into one segment.
    pub fn coalesce(&mut self) {
        self.segs.dedup_by(|next, prev| {
            if prev.is_hole() && next.is_hole() {
                prev.pages += next.pages;
                true
            } else {
                false
            }
        });
    }

    /// Turns every segment owned by `thread` into a hole and returns the freed ranges.
    pub fn release_thread(&mut self, thread: ThreadId) -> Vec<(PageIndex, PageIndex)> {
        let mut freed = Vec::new();
        for seg in self.segs.iter_mut() {
            let owned = seg.mapping.as_ref().is_some_and(|m| m.owner == Some(thread));
            if owned {
                seg.mapping = None;
                freed.push((seg.start, seg.end()));
            }
        }
        if !freed.is_empty() {
            self.coalesce();
        }
        freed
    }

    /// Copy for a cloned space; thread ownership does not carry over.
    pub fn fork(&self) -> Self {
        let mut copy = self.clone();
        for mapping in copy.segs.iter_mut().filter_map(|seg| seg.mapping.as_mut()) {
            mapping.owner = None;
        }
        copy
    }

    /// Segments intersecting `[start, end)`.
    pub fn overlapping(
        &self,
        start: PageIndex,
        end: PageIndex,
    ) -> impl Iterator<Item = &Segment> + '_ {
        let first = if start.raw() < self.span { self.position(start) } else { self.segs.len() };
        self.segs[first..].iter().take_while(move |seg| seg.start < end)
    }

    /// Drops every segment, leaving one hole over the span.
    pub fn clear(&mut self) {
        self.segs.clear();
        self.segs.push(Segment { start: PageIndex::new(0), pages: self.span, mapping: None });
    }

    /// Checks ordering, exhaustiveness and hole merging.
    pub fn verify(&self) -> Result<(), ListError> {
        if self.segs.is_empty() {
            return Err(ListError::Empty);
        }
        let mut expected = 0u64;
        let mut prev_hole = false;
        for seg in &self.segs {
            if seg.pages == 0 {
                return Err(ListError::EmptySegment(seg.start.raw()));
            }
            if seg.start.raw() != expected {
                return Err(ListError::Discontiguous(expected));
            }
            if prev_hole && seg.is_hole() {
                return Err(ListError::UnmergedHoles(seg.start.raw()));
            }
            prev_hole = seg.is_hole();
            expected = seg.end().raw();
        }
        if expected != self.span {
            return Err(ListError::Coverage(expected));
        }
        Ok(())
    }

    /// Human-readable listing with `>` on the segment containing `addr`.
    pub fn dump(&self, addr: u64) -> Dump<'_> {
        Dump { list: self, addr }
    }
}

/// Display adapter returned by [`SegmentList::dump`].
pub struct Dump<'a> {
    list: &'a SegmentList,
    addr: u64,
}

impl fmt::Display for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.list.segs {
            let base = seg.start.addr();
            let last = seg.end().addr() - 1;
            let marker = if (base..=last).contains(&self.addr) { '>' } else { ' ' };
            match &seg.mapping {
                None => writeln!(f, "{marker}{base:#018x} - {last:#018x} UNMAPPED")?,
                Some(m) => {
                    let flag = |on: bool, set: char, unset: char| if on { set } else { unset };
                    writeln!(
                        f,
                        "{marker}{base:#018x} - {last:#018x} {}{} {}{}{} {} @0x{:016X}",
                        flag(m.is_shared(), 'S', 'P'),
                        flag(m.owner.is_some(), 'T', 't'),
                        flag(m.prot.contains(Prot::READ), 'R', 'r'),
                        flag(m.prot.contains(Prot::WRITE), 'W', 'w'),
                        flag(m.prot.contains(Prot::EXEC), 'X', 'x'),
                        flag(m.access.contains(Access::WRITE), 'W', 'R'),
                        m.offset,
                    )?;
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests_prop;
