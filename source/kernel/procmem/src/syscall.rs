// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Register-level mmap/mprotect/munmap handlers
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Args, FileLookup, sys_mmap, sys_mprotect, sys_munmap
//! DEPENDS_ON: mapping (ProcMem::{map, protect, unmap})
//! INVARIANTS: Decode→Check→Execute; returns are the mapped address, 0, or a negative errno

use crate::error::Errno;
use crate::flags::{MapFlags, Prot};
use crate::mapping::OpenFile;
use crate::space::ProcMem;

/// Raw syscall argument registers.
#[derive(Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }

    /// Register `index` as a 32-bit flag word; wider values are invalid.
    fn get_u32(&self, index: usize) -> Result<u32, Errno> {
        u32::try_from(self.regs[index]).map_err(|_| Errno::Inval)
    }
}

/// File-descriptor table of the calling process.
pub trait FileLookup {
    fn file(&self, fd: usize) -> Option<OpenFile>;
}

#[derive(Clone)]
struct MmapArgsTyped {
    addr: u64,
    len: u64,
    prot: Prot,
    flags: MapFlags,
    file: Option<OpenFile>,
    offset: u64,
}

impl MmapArgsTyped {
    #[inline]
    fn decode(args: &Args, files: &dyn FileLookup) -> Result<Self, Errno> {
        let prot = Prot::from_bits(args.get_u32(2)?).ok_or(Errno::Inval)?;
        let flags = MapFlags::from_bits(args.get_u32(3)?).ok_or(Errno::Inval)?;
        let fd = args.get(4) as isize;
        let file = if fd < 0 { None } else { Some(files.file(fd as usize).ok_or(Errno::BadFd)?) };
        Ok(Self {
            addr: args.get(0) as u64,
            len: args.get(1) as u64,
            prot,
            flags,
            file,
            offset: args.get(5) as u64,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Errno> {
        if self.flags.contains(MapFlags::UNMAP) && self.file.is_some() {
            return Err(Errno::Inval);
        }
        self.addr.checked_add(self.len).ok_or(Errno::Inval)?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct MprotectArgsTyped {
    addr: u64,
    len: u64,
    prot: Prot,
}

impl MprotectArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Errno> {
        let prot = Prot::from_bits(args.get_u32(2)?).ok_or(Errno::Inval)?;
        Ok(Self { addr: args.get(0) as u64, len: args.get(1) as u64, prot })
    }

    #[inline]
    fn check(&self) -> Result<(), Errno> {
        self.addr.checked_add(self.len).ok_or(Errno::Inval)?;
        Ok(())
    }
}

fn encode(result: Result<u64, Errno>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(err) => err.as_neg(),
    }
}

fn mmap(space: &ProcMem, files: &dyn FileLookup, args: &Args) -> Result<u64, Errno> {
    let typed = MmapArgsTyped::decode(args, files)?;
    typed.check()?;
    space.map(typed.addr, typed.len, typed.prot, typed.flags, typed.file.as_ref(), typed.offset)
}

fn mprotect(space: &ProcMem, args: &Args) -> Result<u64, Errno> {
    let typed = MprotectArgsTyped::decode(args)?;
    typed.check()?;
    space.protect(typed.addr, typed.len, typed.prot)?;
    Ok(0)
}

/// `mmap(addr, len, prot, flags, fd, offset)`; `fd` is negative for anonymous mappings.
pub fn sys_mmap(space: &ProcMem, files: &dyn FileLookup, args: &Args) -> isize {
    encode(mmap(space, files, args))
}

/// `mprotect(addr, len, prot)`.
pub fn sys_mprotect(space: &ProcMem, args: &Args) -> isize {
    encode(mprotect(space, args))
}

/// `munmap(addr, len)`.
pub fn sys_munmap(space: &ProcMem, args: &Args) -> isize {
    encode(space.unmap(args.get(0) as u64, args.get(1) as u64).map(|()| 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Access;
    use crate::sim::{SimFile, SimMachine};
    use crate::types::PAGE_SIZE;
    use alloc::sync::Arc;

    struct Fds(Vec<Option<OpenFile>>);

    impl FileLookup for Fds {
        fn file(&self, fd: usize) -> Option<OpenFile> {
            self.0.get(fd).cloned().flatten()
        }
    }

    fn fds(sim: &SimMachine, file: &Arc<SimFile>) -> Fds {
        Fds(vec![None, None, None, Some(sim.open(file, Access::READ | Access::WRITE))])
    }

    const NO_FD: usize = usize::MAX;
    const PAGE: usize = PAGE_SIZE;

    #[test]
    fn mmap_returns_address_or_negative_errno() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let file = sim.file(4);
        let table = fds(&sim, &file);
        let anon = (MapFlags::ANON | MapFlags::PRIVATE).bits() as usize;
        let rw = (Prot::READ | Prot::WRITE).bits() as usize;

        let addr = sys_mmap(&space, &table, &Args::new([0, 2 * PAGE, rw, anon, NO_FD, 0]));
        assert!(addr > 0);
        assert_eq!(addr as u64 % PAGE as u64, 0);

        assert_eq!(sys_mmap(&space, &table, &Args::new([0, PAGE, 0x80, anon, NO_FD, 0])), -22);
        assert_eq!(sys_mmap(&space, &table, &Args::new([0, PAGE, rw, 1 << 9, NO_FD, 0])), -22);
        // bits above the 32-bit flag words are not truncated away
        let wide_prot = (1 << 32) | 1;
        assert_eq!(sys_mmap(&space, &table, &Args::new([0, PAGE, wide_prot, anon, NO_FD, 0])), -22);
        assert_eq!(sys_mmap(&space, &table, &Args::new([0, PAGE, rw, (1 << 40) | anon, NO_FD, 0])), -22);
        assert_eq!(sys_mmap(&space, &table, &Args::new([0, PAGE, rw, anon, 1, 0])), -9);
        let private = MapFlags::PRIVATE.bits() as usize;
        let shared = MapFlags::SHARED.bits() as usize;
        assert!(sys_mmap(&space, &table, &Args::new([0, PAGE, rw, private, 3, 0])) > 0);
        assert!(sys_mmap(&space, &table, &Args::new([0, PAGE, rw, shared, 3, 0])) > 0);
    }

    #[test]
    fn mprotect_and_munmap_report_zero_on_success() {
        let sim = SimMachine::new();
        let space = sim.space().unwrap();
        let file = sim.file(5);
        let table = fds(&sim, &file);
        let anon = (MapFlags::ANON | MapFlags::PRIVATE).bits() as usize;
        let addr = sys_mmap(&space, &table, &Args::new([0, PAGE, 3, anon, NO_FD, 0])) as usize;

        assert_eq!(sys_mprotect(&space, &Args::new([addr, PAGE, 1, 0, 0, 0])), 0);
        assert_eq!(sys_mprotect(&space, &Args::new([addr, PAGE, 0x10, 0, 0, 0])), -22);
        assert_eq!(sys_mprotect(&space, &Args::new([addr, PAGE, (1 << 32) | 1, 0, 0, 0])), -22);
        assert_eq!(sys_munmap(&space, &Args::new([addr, PAGE, 0, 0, 0, 0])), 0);
        assert_eq!(sys_mprotect(&space, &Args::new([addr, PAGE, 1, 0, 0, 0])), -12);
    }
}
