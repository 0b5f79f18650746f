//! Page providers shared by the integration tests.

#![allow(dead_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use sheaf::{PageProvider, PAGE_SIZE};

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Heap-backed provider that counts every page in and out, so tests can
/// assert the provider is balanced after teardown.
#[derive(Default)]
pub struct TrackingProvider {
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl TrackingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Pages handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.allocs() - self.frees()
    }
}

unsafe impl PageProvider for TrackingProvider {
    fn alloc_page(&self) -> Option<NonNull<u8>> {
        let page = NonNull::new(unsafe { alloc(page_layout()) })?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Some(page)
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        dealloc(page.as_ptr(), page_layout());
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tracking provider that fails after a fixed number of allocations, for
/// exercising init rollback and push-time exhaustion.
pub struct BudgetProvider {
    inner: TrackingProvider,
    budget: AtomicUsize,
}

impl BudgetProvider {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: TrackingProvider::new(),
            budget: AtomicUsize::new(budget),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }

    pub fn allocs(&self) -> usize {
        self.inner.allocs()
    }
}

unsafe impl PageProvider for BudgetProvider {
    fn alloc_page(&self) -> Option<NonNull<u8>> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .ok()?;
        self.inner.alloc_page()
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        self.inner.free_page(page);
    }
}
