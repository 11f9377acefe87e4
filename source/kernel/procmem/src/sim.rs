// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hosted simulation of the address-space collaborators
//! OWNERS: @kernel-mm-team
//! STATUS: Test support
//! PUBLIC API: SimMachine, SimFrames, SimMmu, SimScheduler, SimFile
//! DEPENDS_ON: hal::*, space::{VmContext, ProcMem}, fault::dispatch
//! INVARIANTS: Frame numbers start at 1; a frame is live from alloc until free or its last
//!             decref; freshly allocated frames are poisoned so missing zero-fills show up
//!
//! `SimMachine` plays the CPU: loads and stores check the leaf entry the way a hardware
//! walker would, raise a fault through `VmContext::dispatch_fault` when the entry does not
//! permit the access, and retry once the fault is resolved.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use spin::Mutex;

use crate::entry::Entry;
use crate::error::{FaultError, PageInError, SigInfo, VmError};
use crate::fault::{AccessKind, FaultInfo, FaultOutcome, Privilege};
use crate::flags::Access;
use crate::hal::{FileTree, FrameOwner, Mmu, PhysMap, Scheduler};
use crate::layout::Layout;
use crate::mapping::OpenFile;
use crate::space::{ProcMem, VmContext};
use crate::types::{Frame, ThreadId, PAGE_MASK, PAGE_SIZE};
use crate::window::FrameWindow;

const POISON: u8 = 0xa5;

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_SIZE]);

struct Slot {
    page: Box<UnsafeCell<PageBuf>>,
    refs: usize,
    live: bool,
    accessed: bool,
    dirty: bool,
}

#[derive(Default)]
struct FrameState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    limit: Option<usize>,
}

impl FrameState {
    fn slot(&mut self, frame: Frame) -> &mut Slot {
        let index = frame.raw() as usize - 1;
        &mut self.slots[index]
    }
}

/// Frame allocator and page-info table backed by host memory.
#[derive(Default)]
pub struct SimFrames {
    state: Mutex<FrameState>,
}

impl SimFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of simultaneously live frames.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.state.lock().limit = limit;
    }

    pub fn live_frames(&self) -> usize {
        self.state.lock().live
    }

    pub fn is_live(&self, frame: Frame) -> bool {
        self.state.lock().slot(frame).live
    }

    pub fn is_accessed(&self, frame: Frame) -> bool {
        self.state.lock().slot(frame).accessed
    }

    pub fn is_dirty(&self, frame: Frame) -> bool {
        self.state.lock().slot(frame).dirty
    }

    fn release(state: &mut FrameState, frame: Frame) {
        let slot = state.slot(frame);
        assert!(slot.live, "double free of {:?}", frame);
        slot.live = false;
        state.live -= 1;
        state.free.push(frame.raw() as usize - 1);
    }
}

impl FrameOwner for SimFrames {
    fn alloc(&self) -> Result<Frame, VmError> {
        let mut state = self.state.lock();
        if state.limit.is_some_and(|limit| state.live >= limit) {
            return Err(VmError::OutOfFrames);
        }
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                state.slots.push(Slot {
                    page: Box::new(UnsafeCell::new(PageBuf([0; PAGE_SIZE]))),
                    refs: 0,
                    live: false,
                    accessed: false,
                    dirty: false,
                });
                state.slots.len() - 1
            }
        };
        state.live += 1;
        let slot = &mut state.slots[index];
        slot.page.get_mut().0.fill(POISON);
        slot.refs = 0;
        slot.live = true;
        slot.accessed = false;
        slot.dirty = false;
        Ok(Frame::from_raw(index as u64 + 1))
    }

    fn free(&self, frame: Frame) {
        let mut state = self.state.lock();
        assert_eq!(state.slot(frame).refs, 0, "freeing referenced {:?}", frame);
        Self::release(&mut state, frame);
    }

    fn incref(&self, frame: Frame) {
        let mut state = self.state.lock();
        let slot = state.slot(frame);
        assert!(slot.live, "incref of dead {:?}", frame);
        slot.refs += 1;
    }

    fn decref(&self, frame: Frame) {
        let mut state = self.state.lock();
        let slot = state.slot(frame);
        assert!(slot.live && slot.refs > 0, "decref of unreferenced {:?}", frame);
        slot.refs -= 1;
        if slot.refs == 0 {
            Self::release(&mut state, frame);
        }
    }

    fn refcount(&self, frame: Frame) -> usize {
        let mut state = self.state.lock();
        let slot = state.slot(frame);
        if slot.live {
            slot.refs
        } else {
            0
        }
    }

    fn mark_accessed(&self, frame: Frame) {
        self.state.lock().slot(frame).accessed = true;
    }

    fn mark_dirty(&self, frame: Frame) {
        self.state.lock().slot(frame).dirty = true;
    }
}

impl PhysMap for SimFrames {
    fn frame_ptr(&self, frame: Frame) -> NonNull<u8> {
        let mut state = self.state.lock();
        let cell = &state.slot(frame).page;
        // SAFETY: UnsafeCell::get never returns null; the boxed page outlives the frame.
        unsafe { NonNull::new_unchecked(cell.get().cast::<u8>()) }
    }
}

#[derive(Default)]
struct MmuState {
    invalidated: Vec<u64>,
    flushes: usize,
    root: Option<Frame>,
    irq_disabled: bool,
    loads_with_irq_enabled: usize,
}

/// Records every translation-cache operation.
#[derive(Default)]
pub struct SimMmu {
    state: Mutex<MmuState>,
}

impl SimMmu {
    pub fn invalidated(&self) -> Vec<u64> {
        self.state.lock().invalidated.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn active_root(&self) -> Option<Frame> {
        self.state.lock().root
    }

    pub fn interrupts_enabled(&self) -> bool {
        !self.state.lock().irq_disabled
    }

    /// Root loads that happened with interrupts enabled.
    pub fn unguarded_loads(&self) -> usize {
        self.state.lock().loads_with_irq_enabled
    }
}

impl Mmu for SimMmu {
    fn invalidate_page(&self, addr: u64) {
        self.state.lock().invalidated.push(addr);
    }

    fn flush_all(&self) {
        self.state.lock().flushes += 1;
    }

    fn load_root(&self, root: Frame) {
        let mut state = self.state.lock();
        if !state.irq_disabled {
            state.loads_with_irq_enabled += 1;
        }
        state.root = Some(root);
    }

    fn disable_interrupts(&self) -> bool {
        let mut state = self.state.lock();
        let was_enabled = !state.irq_disabled;
        state.irq_disabled = true;
        was_enabled
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        self.state.lock().irq_disabled = !was_enabled;
    }
}

/// Single-CPU scheduler stand-in that records signals and wake-ups.
pub struct SimScheduler {
    current: Mutex<ThreadId>,
    signals: Mutex<Vec<(ThreadId, SigInfo)>>,
    wakes: Mutex<Vec<Frame>>,
}

impl Default for SimScheduler {
    fn default() -> Self {
        Self {
            current: Mutex::new(ThreadId::from_raw(1)),
            signals: Mutex::new(Vec::new()),
            wakes: Mutex::new(Vec::new()),
        }
    }
}

impl SimScheduler {
    pub fn set_current(&self, thread: ThreadId) {
        *self.current.lock() = thread;
    }

    pub fn signals(&self) -> Vec<(ThreadId, SigInfo)> {
        self.signals.lock().clone()
    }

    pub fn wakes(&self) -> Vec<Frame> {
        self.wakes.lock().clone()
    }
}

impl Scheduler for SimScheduler {
    fn current_thread(&self) -> ThreadId {
        *self.current.lock()
    }

    fn send_signal(&self, thread: ThreadId, info: SigInfo) {
        self.signals.lock().push((thread, info));
    }

    fn wake_blocked_on(&self, frame: Frame) {
        self.wakes.lock().push(frame);
    }
}

/// In-memory file whose pages hold a per-page byte pattern.
pub struct SimFile {
    seed: u8,
    frames: Arc<SimFrames>,
    window: Arc<FrameWindow>,
    pages: Mutex<BTreeMap<u64, Frame>>,
    failing: Mutex<BTreeSet<u64>>,
}

impl SimFile {
    /// Byte every position of the page at `offset` is filled with.
    pub fn pattern(&self, offset: u64) -> u8 {
        self.seed.wrapping_add((offset / PAGE_SIZE as u64) as u8).wrapping_mul(3) | 1
    }

    /// Makes reads of the page at `offset` fail with an I/O error.
    pub fn fail_at(&self, offset: u64) {
        self.failing.lock().insert(offset);
    }

    pub fn cached(&self, offset: u64) -> Option<Frame> {
        self.pages.lock().get(&offset).copied()
    }
}

impl FileTree for SimFile {
    fn get_page(&self, offset: u64) -> Result<Frame, PageInError> {
        if self.failing.lock().contains(&offset) {
            return Err(PageInError);
        }
        let mut pages = self.pages.lock();
        if let Some(&frame) = pages.get(&offset) {
            self.frames.incref(frame);
            return Ok(frame);
        }
        let frame = self.frames.alloc().map_err(|_| PageInError)?;
        self.window.write(frame, 0, &[self.pattern(offset); PAGE_SIZE]);
        self.frames.incref(frame);
        self.frames.incref(frame);
        pages.insert(offset, frame);
        Ok(frame)
    }
}

impl Drop for SimFile {
    fn drop(&mut self) {
        for (_, frame) in core::mem::take(self.pages.get_mut()) {
            self.frames.decref(frame);
        }
    }
}

/// One simulated machine: collaborators plus a context wired to them.
pub struct SimMachine {
    pub frames: Arc<SimFrames>,
    pub mmu: Arc<SimMmu>,
    pub sched: Arc<SimScheduler>,
    ctx: Arc<VmContext>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMachine {
    pub fn new() -> Self {
        Self::with_layout(Layout::default())
    }

    pub fn with_layout(layout: Layout) -> Self {
        let frames = Arc::new(SimFrames::new());
        let mmu = Arc::new(SimMmu::default());
        let sched = Arc::new(SimScheduler::default());
        let ctx = VmContext::new(
            layout,
            frames.clone(),
            frames.clone(),
            mmu.clone(),
            sched.clone(),
        );
        Self { frames, mmu, sched, ctx }
    }

    pub fn ctx(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub fn space(&self) -> Result<ProcMem, VmError> {
        ProcMem::create(&self.ctx)
    }

    pub fn file(&self, seed: u8) -> Arc<SimFile> {
        Arc::new(SimFile {
            seed,
            frames: self.frames.clone(),
            window: Arc::new(FrameWindow::new(self.frames.clone())),
            pages: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn open(&self, file: &Arc<SimFile>, access: Access) -> OpenFile {
        OpenFile::new(file.clone(), access)
    }

    pub fn window_read(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        self.ctx.window().read(frame, offset, buf);
    }

    fn permits(entry: Entry, access: AccessKind) -> bool {
        entry.is_present()
            && match access {
                AccessKind::Read => true,
                AccessKind::Write => entry.is_writable(),
                AccessKind::Execute => !entry.is_no_exec(),
            }
    }

    /// Translates `addr` like the hardware would, faulting until the entry permits `access`.
    pub fn translate(&self, space: &ProcMem, addr: u64, access: AccessKind) -> Result<Frame, SigInfo> {
        for _ in 0..2 {
            if let Some(entry) = space.entry(addr).filter(|e| Self::permits(*e, access)) {
                space.touch(addr, access == AccessKind::Write);
                return Ok(entry.frame());
            }
            let info = FaultInfo {
                addr,
                access,
                privilege: Privilege::User,
                thread: self.sched.current_thread(),
            };
            if let FaultOutcome::Signalled(sig) = self.ctx.dispatch_fault(Some(space), info) {
                return Err(sig);
            }
        }
        // a resolved fault that still does not permit the access is a protection bug
        Err(FaultError::AccErr.siginfo(addr))
    }

    fn split(addr: u64, len: usize) -> usize {
        let offset = (addr & PAGE_MASK) as usize;
        assert!(offset + len <= PAGE_SIZE, "simulated access crosses a page boundary");
        offset
    }

    /// User-mode store of `bytes` at `addr`.
    pub fn store(&self, space: &ProcMem, addr: u64, bytes: &[u8]) -> Result<(), SigInfo> {
        let offset = Self::split(addr, bytes.len());
        let frame = self.translate(space, addr, AccessKind::Write)?;
        self.ctx.window().write(frame, offset, bytes);
        Ok(())
    }

    /// User-mode load into `buf` from `addr`.
    pub fn load(&self, space: &ProcMem, addr: u64, buf: &mut [u8]) -> Result<(), SigInfo> {
        let offset = Self::split(addr, buf.len());
        let frame = self.translate(space, addr, AccessKind::Read)?;
        self.ctx.window().read(frame, offset, buf);
        Ok(())
    }

    /// Instruction fetch at `addr`.
    pub fn fetch(&self, space: &ProcMem, addr: u64) -> Result<(), SigInfo> {
        self.translate(space, addr, AccessKind::Execute).map(|_| ())
    }

    /// Contents of the page mapped at `addr`, read through the entry without faulting.
    pub fn peek_page(&self, space: &ProcMem, addr: u64) -> Option<Vec<u8>> {
        let entry = space.entry(addr).filter(|e| e.is_loaded())?;
        let mut page = vec![0u8; PAGE_SIZE];
        self.ctx.window().read(entry.frame(), 0, &mut page);
        Some(page)
    }
}
