// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table entry encoding (hardware bits plus software state bits)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Entry
//! DEPENDS_ON: flags::Prot, types::Frame
//! INVARIANTS: loaded ⇒ frame field names a referenced frame; cow ⇒ !writable;
//!             shared ⇒ !cow; desired bits are only meaningful once PERM_OVR is set
//!
//! Bit positions follow the x86-64 long-mode entry format; the software fields live in
//! bits the hardware ignores (9..=11 and 52..=62).

use bitflags::bitflags;
use static_assertions::assert_eq_size;

use crate::flags::Prot;
use crate::types::{Frame, PAGE_SHIFT};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LOADED = 1 << 9;
        const COW = 1 << 10;
        const SHARED = 1 << 11;
        const PERM_OVR = 1 << 52;
        const WANT_READ = 1 << 53;
        const WANT_WRITE = 1 << 54;
        const WANT_EXEC = 1 << 55;
        const NO_EXEC = 1 << 63;
    }
}

const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;
const WANT_MASK: EntryFlags =
    EntryFlags::WANT_READ.union(EntryFlags::WANT_WRITE).union(EntryFlags::WANT_EXEC);

/// One slot of a page table, leaf or intermediate.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(u64);

assert_eq_size!(Entry, u64);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    /// Intermediate entry pointing at a next-level table.
    pub(crate) fn table(frame: Frame) -> Self {
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
        Entry((frame.phys_addr() & FRAME_MASK) | flags.bits())
    }

    #[inline]
    fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_retain(self.0)
    }

    #[inline]
    fn set(&mut self, flag: EntryFlags, on: bool) {
        if on {
            self.0 |= flag.bits();
        } else {
            self.0 &= !flag.bits();
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(EntryFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(EntryFlags::USER)
    }

    pub fn is_no_exec(self) -> bool {
        self.flags().contains(EntryFlags::NO_EXEC)
    }

    pub fn is_accessed(self) -> bool {
        self.flags().contains(EntryFlags::ACCESSED)
    }

    pub fn is_dirty(self) -> bool {
        self.flags().contains(EntryFlags::DIRTY)
    }

    pub fn is_loaded(self) -> bool {
        self.flags().contains(EntryFlags::LOADED)
    }

    pub fn is_cow(self) -> bool {
        self.flags().contains(EntryFlags::COW)
    }

    pub fn is_shared(self) -> bool {
        self.flags().contains(EntryFlags::SHARED)
    }

    /// Whether the desired protection has been computed for this page.
    pub fn is_overridden(self) -> bool {
        self.flags().contains(EntryFlags::PERM_OVR)
    }

    pub fn frame(self) -> Frame {
        Frame::from_raw((self.0 & FRAME_MASK) >> PAGE_SHIFT)
    }

    /// Protection the page is supposed to have.
    pub fn desired(self) -> Prot {
        let flags = self.flags();
        let mut prot = Prot::empty();
        prot.set(Prot::READ, flags.contains(EntryFlags::WANT_READ));
        prot.set(Prot::WRITE, flags.contains(EntryFlags::WANT_WRITE));
        prot.set(Prot::EXEC, flags.contains(EntryFlags::WANT_EXEC));
        prot
    }

    /// Protection currently enforced by the hardware bits.
    pub fn hardware(self) -> Prot {
        if !self.is_present() {
            return Prot::empty();
        }
        let mut prot = Prot::READ;
        prot.set(Prot::WRITE, self.is_writable());
        prot.set(Prot::EXEC, !self.is_no_exec());
        prot
    }

    pub(crate) fn set_frame(&mut self, frame: Frame) {
        self.0 = (self.0 & !FRAME_MASK) | (frame.phys_addr() & FRAME_MASK);
    }

    /// Records the desired protection and marks it as computed.
    pub(crate) fn set_desired(&mut self, prot: Prot) {
        self.0 &= !WANT_MASK.bits();
        self.set(EntryFlags::WANT_READ, prot.contains(Prot::READ));
        self.set(EntryFlags::WANT_WRITE, prot.contains(Prot::WRITE));
        self.set(EntryFlags::WANT_EXEC, prot.contains(Prot::EXEC));
        self.set(EntryFlags::PERM_OVR, true);
    }

    pub(crate) fn set_present(&mut self, on: bool) {
        self.set(EntryFlags::PRESENT, on);
    }

    pub(crate) fn set_writable(&mut self, on: bool) {
        self.set(EntryFlags::WRITABLE, on);
    }

    pub(crate) fn set_no_exec(&mut self, on: bool) {
        self.set(EntryFlags::NO_EXEC, on);
    }

    pub(crate) fn set_cow(&mut self, on: bool) {
        self.set(EntryFlags::COW, on);
    }

    pub(crate) fn set_accessed(&mut self, on: bool) {
        self.set(EntryFlags::ACCESSED, on);
    }

    pub(crate) fn set_dirty(&mut self, on: bool) {
        self.set(EntryFlags::DIRTY, on);
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }

    /// Populates a never-loaded entry with `frame`.
    ///
    /// Private pages start copy-on-write so that a later clone only has to keep the bit;
    /// shared pages get the desired write bit directly.
    pub(crate) fn install(&mut self, frame: Frame, shared: bool) {
        let desired = self.desired();
        self.set_frame(frame);
        self.set(EntryFlags::LOADED | EntryFlags::USER, true);
        self.set(EntryFlags::SHARED, shared);
        self.set(EntryFlags::COW, !shared);
        self.set_writable(shared && desired.contains(Prot::WRITE));
        self.set_no_exec(!desired.contains(Prot::EXEC));
        self.set_present(desired.contains(Prot::READ));
    }

    /// Brings the hardware bits of a loaded entry in line with `prot`.
    pub(crate) fn enforce(&mut self, prot: Prot) {
        self.set_present(prot.contains(Prot::READ));
        self.set_writable(prot.contains(Prot::WRITE) && !self.is_cow());
        self.set_no_exec(!prot.contains(Prot::EXEC));
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}
