//! Sheaf - a lock-free LIFO stack over a per-CPU page substrate
//!
//! A concurrent last-in-first-out stack for multi-threaded producers and
//! consumers, built so that the hot path never takes a lock and never calls a
//! general-purpose allocator. Node memory is carved out of fixed-size pages
//! obtained from a caller-supplied [`PageProvider`]; each CPU slot keeps its
//! own free list, and nodes popped on a foreign slot travel home through a
//! bounded deferred-return ring.
//!
//! # Key design points
//!
//! - Double-word CAS on a `(top, tag)` pair defeats the ABA problem on the
//!   stack head without hazard pointers or epochs.
//! - Node memory is never returned to the page provider while the stack is
//!   live, so a stale `top` pointer is always safe to dereference.
//! - Per-slot free lists are single-writer; cross-slot returns go through a
//!   one-page SPSC ring whose indices live on separate cache lines.
//! - Teardown reclaims every page without allocating, by repurposing the ring
//!   pages as accounting storage.
//!
//! # Example
//!
//! ```
//! use std::alloc::{alloc, dealloc, Layout};
//! use std::ptr::NonNull;
//! use sheaf::{PageProvider, Sheaf, PAGE_SIZE};
//!
//! struct HeapPages;
//!
//! unsafe impl PageProvider for HeapPages {
//!     fn alloc_page(&self) -> Option<NonNull<u8>> {
//!         let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
//!         NonNull::new(unsafe { alloc(layout) })
//!     }
//!
//!     unsafe fn free_page(&self, page: NonNull<u8>) {
//!         let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
//!         dealloc(page.as_ptr(), layout);
//!     }
//! }
//!
//! let provider = HeapPages;
//! let stack = Sheaf::new(2, Some(&provider)).unwrap();
//!
//! let slot = stack.slot(0).unwrap();
//! slot.push(42).unwrap();
//! assert_eq!(slot.pop().unwrap(), 42);
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("sheaf requires a 64-bit target: the stack head is a 16-byte (pointer, tag) pair");

mod head;
mod invariants;
mod provider;
mod relax;
mod sheaf;
mod slot;

pub use crate::provider::PageProvider;
pub use crate::relax::Backoff;
pub use crate::sheaf::{Sheaf, SheafError, SlotRef};
pub use crate::slot::{MAX_SLOTS, RING_CAPACITY};

/// Size in bytes of the pages exchanged with the [`PageProvider`].
///
/// Every page handed to the stack must be exactly this large and aligned to
/// this boundary.
pub const PAGE_SIZE: usize = 4096;
