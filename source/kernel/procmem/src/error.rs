// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the address-space manager
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Errno, VmError, FaultError, PageInError, Signal, SigCode, SigInfo
//! INVARIANTS: Caller errors surface as Errno; unrecoverable faults only become signals in
//!             fault::dispatch

use thiserror::Error;

/// POSIX error numbers returned by the mapping syscalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Errno {
    #[error("bad file descriptor")]
    BadFd,
    #[error("out of memory")]
    NoMem,
    #[error("permission denied")]
    Access,
    #[error("no such device")]
    NoDev,
    #[error("invalid argument")]
    Inval,
}

impl Errno {
    /// Positive POSIX error number.
    pub const fn code(self) -> i32 {
        match self {
            Errno::BadFd => 9,
            Errno::NoMem => 12,
            Errno::Access => 13,
            Errno::NoDev => 19,
            Errno::Inval => 22,
        }
    }

    /// Negative-errno encoding used for syscall return registers.
    pub const fn as_neg(self) -> isize {
        -(self.code() as isize)
    }
}

/// Errors reported by space-level operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    /// The frame allocator has nothing left.
    #[error("no physical frame available")]
    OutOfFrames,
    /// Address space still has owners.
    #[error("address space still has owners")]
    InUse,
    /// Address space was already torn down.
    #[error("address space already destroyed")]
    Destroyed,
}

impl From<VmError> for Errno {
    fn from(value: VmError) -> Self {
        match value {
            VmError::OutOfFrames => Errno::NoMem,
            VmError::InUse | VmError::Destroyed => Errno::Inval,
        }
    }
}

/// The backing store could not supply a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("page-in from backing store failed")]
pub struct PageInError;

/// Classification of a fault that could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FaultError {
    /// Nothing is mapped at the address.
    #[error("address not mapped")]
    MapErr,
    /// Mapped, but the access is not permitted.
    #[error("access violates page protection")]
    AccErr,
    /// The backing object (file cache or frame allocator) failed.
    #[error("backing object unavailable")]
    ObjErr,
}

impl From<PageInError> for FaultError {
    fn from(_: PageInError) -> Self {
        FaultError::ObjErr
    }
}

impl From<VmError> for FaultError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::Destroyed => FaultError::MapErr,
            VmError::OutOfFrames | VmError::InUse => FaultError::ObjErr,
        }
    }
}

impl FaultError {
    /// Signal information delivered to the faulting thread.
    pub const fn siginfo(self, addr: u64) -> SigInfo {
        match self {
            FaultError::MapErr => SigInfo { signo: Signal::Segv, code: SigCode::MapErr, addr },
            FaultError::AccErr => SigInfo { signo: Signal::Segv, code: SigCode::AccErr, addr },
            FaultError::ObjErr => SigInfo { signo: Signal::Bus, code: SigCode::ObjErr, addr },
        }
    }
}

/// Signals raised by the fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Segv,
    Bus,
}

impl Signal {
    pub const fn number(self) -> i32 {
        match self {
            Signal::Bus => 7,
            Signal::Segv => 11,
        }
    }
}

/// `si_code` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigCode {
    MapErr,
    AccErr,
    ObjErr,
}

impl SigCode {
    pub const fn value(self) -> i32 {
        match self {
            SigCode::MapErr => 1,
            SigCode::AccErr => 2,
            SigCode::ObjErr => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: Signal,
    pub code: SigCode,
    pub addr: u64,
}
