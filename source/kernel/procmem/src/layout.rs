// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space geometry (user range bounds and page-table depth)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Layout, INDEX_BITS, ENTRIES_PER_TABLE
//! INVARIANTS: min_addr < max_addr, both page aligned; max_addr fits the table tree

use crate::types::{PageIndex, PAGE_SHIFT};

/// Index bits consumed per table level.
pub const INDEX_BITS: u32 = 9;
/// Entries in one table frame.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

const MAX_LEVELS: u32 = 5;

/// Bounds of the user address range and shape of the table tree.
///
/// The segment list spans page indices `[0, max_page)`; pages below `min_page` belong to
/// the initial hole and can only be mapped with a fixed address at or above `min_addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    min_addr: u64,
    max_addr: u64,
    levels: u32,
}

impl Layout {
    /// Lowest mappable user address.
    pub const DEFAULT_MIN_ADDR: u64 = 0x20_0000;
    /// One past the highest user address.
    pub const DEFAULT_MAX_ADDR: u64 = 0x80_0000_0000;
    /// PDPT → PD → PT.
    pub const DEFAULT_LEVELS: u32 = 3;

    /// Validates and builds a layout; returns `None` when the bounds are inconsistent.
    pub const fn new(min_addr: u64, max_addr: u64, levels: u32) -> Option<Self> {
        let page_mask = (1u64 << PAGE_SHIFT) - 1;
        if min_addr & page_mask != 0 || max_addr & page_mask != 0 {
            return None;
        }
        if min_addr >= max_addr || levels == 0 || levels > MAX_LEVELS {
            return None;
        }
        let covered_bits = PAGE_SHIFT + INDEX_BITS * levels;
        if covered_bits < 64 && max_addr > (1u64 << covered_bits) {
            return None;
        }
        Some(Self { min_addr, max_addr, levels })
    }

    pub const fn min_addr(&self) -> u64 {
        self.min_addr
    }

    pub const fn max_addr(&self) -> u64 {
        self.max_addr
    }

    pub const fn levels(&self) -> u32 {
        self.levels
    }

    pub const fn min_page(&self) -> PageIndex {
        PageIndex::from_addr(self.min_addr)
    }

    /// Number of pages covered by the segment list.
    pub const fn max_page(&self) -> PageIndex {
        PageIndex::from_addr(self.max_addr)
    }

    /// True when `addr` lies inside `[min_addr, max_addr)`.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.min_addr && addr < self.max_addr
    }

    /// Level of the tables holding leaf entries (root is level 0).
    pub const fn leaf_level(&self) -> u32 {
        self.levels - 1
    }

    /// Table slot used by `page` at `level`.
    pub const fn index(&self, page: PageIndex, level: u32) -> usize {
        let shift = INDEX_BITS * (self.levels - 1 - level);
        ((page.raw() >> shift) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    /// Pages covered by one entry at `level`.
    pub const fn span(&self, level: u32) -> u64 {
        1u64 << (INDEX_BITS * (self.levels - 1 - level))
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            min_addr: Self::DEFAULT_MIN_ADDR,
            max_addr: Self::DEFAULT_MAX_ADDR,
            levels: Self::DEFAULT_LEVELS,
        }
    }
}
