// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process address-space manager (segments, lazy page tables, copy-on-write)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests per module, host integration tests under tests/
//! PUBLIC API: VmContext, ProcMem, SegmentList, PageTableWalker, Entry, sys_* handlers
//! DEPENDS_ON: hal::{FrameOwner, PhysMap, Mmu, Scheduler, FileTree}
//! INVARIANTS: Segments partition the whole address space; one lock per space guards
//!             its segments and its table tree; frame references only move through FrameOwner
//!
//! Control flow of a fault: `VmContext::dispatch_fault` → `ProcMem::fault` (space lock held)
//! → `SegmentList::find` → `PageTableWalker::materialize` → backing store / frame allocator
//! → entry update → TLB invalidation. Mapping operations mutate the segment list and, for
//! resident pages, the table tree under the same lock.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod anon;
pub mod entry;
pub mod error;
pub mod fault;
pub mod flags;
pub mod hal;
pub mod layout;
pub mod mapping;
pub mod segment;
pub mod space;
pub mod syscall;
pub mod types;
pub mod walker;
pub mod window;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use entry::Entry;
pub use error::{Errno, FaultError, PageInError, SigCode, SigInfo, Signal, VmError};
pub use fault::{AccessKind, FaultCounts, FaultInfo, FaultOutcome, FaultStats, Privilege};
pub use flags::{Access, MapFlags, Prot};
pub use hal::{FileTree, FrameOwner, Mmu, PhysMap, Scheduler};
pub use layout::Layout;
pub use mapping::OpenFile;
pub use segment::{Backing, Mapping, Segment, SegmentList, Sharing};
pub use space::{ProcMem, VmContext};
pub use types::{Frame, PageIndex, ThreadId, PAGE_SIZE};
pub use walker::PageTableWalker;
