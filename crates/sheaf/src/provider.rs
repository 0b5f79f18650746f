use std::ptr::{self, NonNull};

use crate::invariants::debug_assert_page_aligned;

/// Source of fixed-size pages backing all of the stack's memory.
///
/// The stack performs no raw memory operations of its own: every page it
/// touches - node pages, ring pages, the slot array - comes from one of
/// these. Implementations may be memory-mapped regions, aligned heap
/// allocations, an arena, or anything else that can hand out whole pages.
///
/// # Safety
///
/// Implementors must uphold the page contract:
///
/// - `alloc_page` returns memory that is writable, at least [`PAGE_SIZE`]
///   bytes long, and aligned to [`PAGE_SIZE`]. Undersized or misaligned
///   pages are undefined behavior.
/// - `free_page` accepts any page previously returned by `alloc_page` on
///   this provider, from any thread.
pub unsafe trait PageProvider: Sync {
    /// Hands out one page, or `None` when the provider is exhausted.
    fn alloc_page(&self) -> Option<NonNull<u8>>;

    /// Takes back a page previously returned by [`alloc_page`].
    ///
    /// # Safety
    ///
    /// `page` must have been returned by `alloc_page` on this provider and
    /// must not be used again after this call.
    ///
    /// [`alloc_page`]: PageProvider::alloc_page
    unsafe fn free_page(&self, page: NonNull<u8>);
}

/// Internal adapter over an optional provider.
///
/// Centralizes the two raw operations so the rest of the crate can treat an
/// absent provider and a failed allocation uniformly as a null page.
pub(crate) struct PageAlloc<'p> {
    provider: Option<&'p dyn PageProvider>,
}

impl<'p> PageAlloc<'p> {
    pub(crate) fn new(provider: Option<&'p dyn PageProvider>) -> Self {
        Self { provider }
    }

    /// Requests one page; null when the provider is absent or exhausted.
    pub(crate) fn alloc(&self) -> *mut u8 {
        match self.provider.and_then(PageProvider::alloc_page) {
            Some(page) => {
                debug_assert_page_aligned!(page.as_ptr());
                page.as_ptr()
            }
            None => ptr::null_mut(),
        }
    }

    /// Returns a page to the provider. No-op on a null page or an absent
    /// provider.
    pub(crate) fn free(&self, page: *mut u8) {
        if let (Some(provider), Some(page)) = (self.provider, NonNull::new(page)) {
            debug_assert_page_aligned!(page.as_ptr());
            // SAFETY: every non-null page in this crate originates from
            // `alloc` on this same adapter, and pages are freed exactly once
            // (teardown walks each page's base address a single time).
            unsafe { provider.free_page(page) };
        }
    }
}
