// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protection, mapping and file-access flags of the mmap/mprotect surface
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Prot, MapFlags, Access
//! INVARIANTS: Bit values are part of the syscall ABI and must not change

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Access rights requested for a mapping.
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    /// Write and execute access both imply read access.
    pub fn normalized(self) -> Self {
        if self.intersects(Prot::WRITE | Prot::EXEC) {
            self | Prot::READ
        } else {
            self
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Flags accepted by `mmap`.
    pub struct MapFlags: u32 {
        /// Writes stay private to this address space (copy-on-write).
        const PRIVATE = 1 << 0;
        /// Writes are visible to every mapper of the same backing.
        const SHARED = 1 << 1;
        /// Zero-filled memory with no file.
        const ANON = 1 << 2;
        /// Place the mapping exactly at the requested address.
        const FIXED = 1 << 3;
        /// Tear the mapping down when the creating thread exits.
        const THREAD = 1 << 4;
        /// Replace the range with unmapped space.
        const UNMAP = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Open mode of the file behind a mapping.
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_exec_imply_read() {
        assert_eq!(Prot::WRITE.normalized(), Prot::READ | Prot::WRITE);
        assert_eq!(Prot::EXEC.normalized(), Prot::READ | Prot::EXEC);
        assert_eq!(Prot::empty().normalized(), Prot::empty());
    }

    #[test]
    fn unknown_bits_are_rejected() {
        assert!(Prot::from_bits(1 << 3).is_none());
        assert!(MapFlags::from_bits(1 << 6).is_none());
    }
}
