// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted frame buffers.
//!
//! A captured or reconstructed frame may be held by several queues at once
//! (a pending aggregate, the excess-retry side channel, an in-flight
//! delivery). `FrameBuffer` hands out cheap clones of one shared allocation;
//! the bytes are released exactly once, when the last handle drops.

use std::sync::Arc;

type DeallocHook = Box<dyn Fn() + Send + Sync>;

struct FrameInner {
    bytes: Vec<u8>,
    dealloc_hook: Option<DeallocHook>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(hook) = self.dealloc_hook.take() {
            hook();
        }
    }
}

/// Shared handle to one frame's bytes.
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<FrameInner>,
}

impl FrameBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { inner: Arc::new(FrameInner { bytes, dealloc_hook: None }) }
    }

    /// Like `new`, with a hook fired when the underlying allocation is
    /// released. Used by tests to assert exactly-once deallocation.
    pub fn with_dealloc_hook(bytes: Vec<u8>, hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(FrameInner { bytes, dealloc_hook: Some(Box::new(hook)) }) }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    /// Number of live handles to this allocation.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Mutable access to the bytes, copy-on-write: if other handles share the
    /// allocation, this handle is repointed at a private copy first. The copy
    /// does not inherit the dealloc hook; the original allocation still fires
    /// it once when its last handle drops.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        if Arc::strong_count(&self.inner) > 1 {
            self.inner =
                Arc::new(FrameInner { bytes: self.inner.bytes.clone(), dealloc_hook: None });
        }
        // Sole owner now; no other Arc can exist.
        &mut Arc::get_mut(&mut self.inner).unwrap_or_else(|| unreachable!()).bytes
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameBuffer({} bytes, {} handles)", self.len(), self.handle_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dealloc_hook_fires_exactly_once() {
        let frees = Arc::new(AtomicUsize::new(0));
        let counter = frees.clone();
        let buf = FrameBuffer::with_dealloc_hook(vec![1, 2, 3], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clones: Vec<_> = (0..5).map(|_| buf.clone()).collect();
        assert_eq!(buf.handle_count(), 6);
        drop(clones);
        assert_eq!(frees.load(Ordering::SeqCst), 0);
        drop(buf);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn make_mut_copies_when_shared() {
        let frees = Arc::new(AtomicUsize::new(0));
        let counter = frees.clone();
        let buf = FrameBuffer::with_dealloc_hook(vec![0u8; 4], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut other = buf.clone();
        other.make_mut()[0] = 0xff;
        assert_eq!(buf.bytes()[0], 0);
        assert_eq!(other.bytes()[0], 0xff);
        // The private copy carries no hook; only the original fires.
        drop(other);
        assert_eq!(frees.load(Ordering::SeqCst), 0);
        drop(buf);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn make_mut_in_place_when_unique() {
        let mut buf = FrameBuffer::new(vec![7u8; 2]);
        buf.make_mut().push(9);
        assert_eq!(buf.bytes(), &[7, 7, 9]);
    }
}
