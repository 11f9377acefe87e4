// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scratch window for touching frame contents from any address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameWindow
//! DEPENDS_ON: hal::PhysMap
//! INVARIANTS: The window lock is held for the whole of each copy and released before return

extern crate alloc;

use alloc::sync::Arc;
use core::ptr;

use spin::Mutex;

use crate::hal::PhysMap;
use crate::types::{Frame, PAGE_SIZE};

/// Shared scratch mapping used to zero and copy frames.
pub struct FrameWindow {
    phys: Arc<dyn PhysMap>,
    lock: Mutex<()>,
}

impl FrameWindow {
    pub fn new(phys: Arc<dyn PhysMap>) -> Self {
        Self { phys, lock: Mutex::new(()) }
    }

    /// Fills `frame` with zeroes.
    pub fn zero(&self, frame: Frame) {
        let _guard = self.lock.lock();
        let dst = self.phys.frame_ptr(frame);
        // SAFETY: PhysMap guarantees PAGE_SIZE valid bytes behind the pointer.
        unsafe { ptr::write_bytes(dst.as_ptr(), 0, PAGE_SIZE) };
    }

    /// Copies the full contents of `src` into `dst`.
    pub fn copy(&self, dst: Frame, src: Frame) {
        if dst == src {
            return;
        }
        let _guard = self.lock.lock();
        let from = self.phys.frame_ptr(src);
        let to = self.phys.frame_ptr(dst);
        // SAFETY: distinct frames never overlap and both pointers cover PAGE_SIZE bytes.
        unsafe { ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), PAGE_SIZE) };
    }

    /// Copies bytes out of `frame` starting at `offset`.
    pub fn read(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "window read crosses frame boundary");
        let _guard = self.lock.lock();
        let src = self.phys.frame_ptr(frame);
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr().add(offset), buf.as_mut_ptr(), buf.len()) };
    }

    /// Copies `buf` into `frame` starting at `offset`.
    pub fn write(&self, frame: Frame, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "window write crosses frame boundary");
        let _guard = self.lock.lock();
        let dst = self.phys.frame_ptr(frame);
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), dst.as_ptr().add(offset), buf.len()) };
    }

    pub(crate) fn phys(&self) -> &dyn PhysMap {
        &*self.phys
    }
}
