// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Zero-fill page tree backing anonymous shared mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AnonTree
//! DEPENDS_ON: hal::{FrameOwner, FileTree}, window::FrameWindow
//! INVARIANTS: Each cached page holds one reference owned by the tree; the tree lives as
//!             long as any segment (in any cloned space) still maps it

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::PageInError;
use crate::hal::{FileTree, FrameOwner};
use crate::types::Frame;
use crate::window::FrameWindow;

/// Page tree with no file behind it; pages materialize zeroed on first request.
pub struct AnonTree {
    frames: Arc<dyn FrameOwner>,
    window: Arc<FrameWindow>,
    pages: Mutex<BTreeMap<u64, Frame>>,
}

impl AnonTree {
    pub fn new(frames: Arc<dyn FrameOwner>, window: Arc<FrameWindow>) -> Self {
        Self { frames, window, pages: Mutex::new(BTreeMap::new()) }
    }

    /// Number of pages materialized so far.
    pub fn resident(&self) -> usize {
        self.pages.lock().len()
    }
}

impl FileTree for AnonTree {
    fn get_page(&self, offset: u64) -> Result<Frame, PageInError> {
        let mut pages = self.pages.lock();
        if let Some(&frame) = pages.get(&offset) {
            self.frames.incref(frame);
            return Ok(frame);
        }
        let frame = self.frames.alloc().map_err(|_| PageInError)?;
        self.window.zero(frame);
        // one reference for the cache, one for the caller
        self.frames.incref(frame);
        self.frames.incref(frame);
        pages.insert(offset, frame);
        Ok(frame)
    }
}

impl Drop for AnonTree {
    fn drop(&mut self) {
        for (_, frame) in core::mem::take(self.pages.get_mut()) {
            self.frames.decref(frame);
        }
    }
}
