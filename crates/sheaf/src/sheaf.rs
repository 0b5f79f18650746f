use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::head::StackHead;
use crate::invariants::debug_assert_slot_index;
use crate::provider::{PageAlloc, PageProvider};
use crate::relax::Backoff;
use crate::slot::{init_slots, release_slots, Slot, MAX_SLOTS};

/// Error kinds for stack operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SheafError {
    /// Zero slots requested, a slot index out of range, or a slot that is
    /// already claimed by a live handle.
    #[error("invalid argument")]
    InvalidArgument,
    /// The page provider could not supply a required page (or no provider
    /// was given).
    #[error("page provider exhausted")]
    OutOfMemory,
    /// The stack was observed empty.
    #[error("stack is empty")]
    Empty,
}

// The claim mask below tracks one bit per slot.
const _: () = assert!(MAX_SLOTS <= 32);

/// Concurrent lock-free LIFO stack with per-slot node allocation.
///
/// Values are machine words pushed and popped through [`SlotRef`] handles,
/// one per slot. A slot is the unit of memory locality: each has its own
/// free list of nodes carved from provider pages, so pinned threads pushing
/// through their own slot never contend on an allocator. The stack itself
/// spawns no threads and knows nothing about CPUs beyond the slot indices
/// callers choose.
///
/// Dropping the stack drains it and returns every page to the provider; see
/// the crate docs for the overall design.
pub struct Sheaf<'p> {
    head: StackHead,
    slots: *mut Slot,
    nslots: usize,
    /// One bit per slot; set while a `SlotRef` for it is live.
    claims: AtomicU32,
    pa: PageAlloc<'p>,
}

// SAFETY: the raw slot pointer is shared across threads, but every access
// goes through atomics or through the single-writer discipline enforced by
// SlotRef claims; the provider reference is Sync by trait bound.
unsafe impl Send for Sheaf<'_> {}
unsafe impl Sync for Sheaf<'_> {}

impl<'p> Sheaf<'p> {
    /// Builds a stack with `nslots` slots over the given page provider.
    ///
    /// Allocates one page for the slot array plus, per slot, a ring page and
    /// a first node page. Fails with [`SheafError::InvalidArgument`] for
    /// zero slots and [`SheafError::OutOfMemory`] if the provider is absent,
    /// exhausted, or `nslots` exceeds [`MAX_SLOTS`]; on a partial failure
    /// every page already taken is returned before this function does.
    ///
    /// [`MAX_SLOTS`]: crate::MAX_SLOTS
    pub fn new(
        nslots: usize,
        provider: Option<&'p dyn PageProvider>,
    ) -> Result<Self, SheafError> {
        if nslots == 0 {
            return Err(SheafError::InvalidArgument);
        }

        let pa = PageAlloc::new(provider);
        // SAFETY: the pointer is released exactly once, in Drop, with the
        // same count and provider.
        let slots = unsafe { init_slots(nslots, &pa) }.ok_or(SheafError::OutOfMemory)?;

        Ok(Self {
            head: StackHead::new(),
            slots: slots.as_ptr(),
            nslots,
            claims: AtomicU32::new(0),
            pa,
        })
    }

    /// Claims slot `index`, returning the handle push and pop go through.
    ///
    /// At most one handle per slot is live at a time; a second claim fails
    /// with [`SheafError::InvalidArgument`] until the first handle is
    /// dropped. Handles may be sent to other threads, which is how a thread
    /// pool maps workers onto slots.
    pub fn slot(&self, index: usize) -> Result<SlotRef<'_, 'p>, SheafError> {
        if index >= self.nslots {
            return Err(SheafError::InvalidArgument);
        }

        let bit = 1u32 << index;
        if self.claims.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Err(SheafError::InvalidArgument);
        }

        Ok(SlotRef {
            sheaf: self,
            index,
            _not_sync: PhantomData,
        })
    }

    /// Number of slots the stack was built with.
    pub fn slot_count(&self) -> usize {
        self.nslots
    }

    /// True if the stack was observed empty. A snapshot under concurrency.
    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Number of nodes currently in transit through slot `index`'s
    /// deferred-return ring.
    ///
    /// Entries a producer has reserved but not yet published are counted.
    pub fn deferred_len(&self, index: usize) -> Result<usize, SheafError> {
        if index >= self.nslots {
            return Err(SheafError::InvalidArgument);
        }
        // SAFETY: index is in range and deferred_len only reads atomics.
        Ok(unsafe { self.slot_at(index) }.deferred_len())
    }

    /// # Safety
    ///
    /// `index` must be less than `self.nslots`.
    unsafe fn slot_at(&self, index: usize) -> &Slot {
        &*self.slots.add(index)
    }
}

impl Drop for Sheaf<'_> {
    fn drop(&mut self) {
        // Drain the stack first so every live node lands back on a free
        // list or ring; no handles can exist here (they borrow self), so
        // routing everything through slot 0 is single-threaded.
        while let Some(node) = self.head.pop() {
            let node = node.as_ptr();
            // SAFETY: a popped node is exclusively ours; slot 0 exists
            // because nslots > 0 is checked at construction.
            unsafe {
                let owner = (*node).owner;
                debug_assert_slot_index!(owner, self.nslots);
                let drainer = self.slot_at(0);
                if owner == 0 {
                    drainer.free_local(node);
                } else {
                    drainer.free_remote(self.slot_at(owner), node);
                }
            }
        }

        // SAFETY: constructed by init_slots with this count and provider;
        // &mut self guarantees exclusive access.
        unsafe { release_slots(self.slots, self.nslots, &self.pa) };
    }
}

/// Exclusive handle to one slot of a [`Sheaf`].
///
/// All pushes and pops happen through a handle: the handle is what pins the
/// slot's free list to a single thread at a time. Obtained from
/// [`Sheaf::slot`]; the claim is released on drop.
pub struct SlotRef<'s, 'p> {
    sheaf: &'s Sheaf<'p>,
    index: usize,
    /// Keeps the handle Send but not Sync: a shared reference crossing
    /// threads would let two threads drive the same free list.
    _not_sync: PhantomData<Cell<()>>,
}

// NOTE: SlotRef intentionally does not implement Clone or Copy. Two live
// handles to the same slot would let two threads mutate the slot's free
// list concurrently, breaking the single-writer invariant the lock-free
// design rests on.

impl SlotRef<'_, '_> {
    /// The slot index this handle drives.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pushes `value` onto the stack, allocating the node from this slot.
    ///
    /// Fails with [`SheafError::OutOfMemory`] if the slot's free list and
    /// ring are both empty and the provider cannot supply a page; the stack
    /// itself is untouched in that case.
    pub fn push(&self, value: usize) -> Result<(), SheafError> {
        // SAFETY: the claim bit makes us the slot's single driving thread.
        unsafe {
            let slot = self.sheaf.slot_at(self.index);
            let node = slot
                .alloc_node(&self.sheaf.pa)
                .ok_or(SheafError::OutOfMemory)?
                .as_ptr();

            (*node).value = value;
            (*node).owner = self.index;
            self.sheaf.head.push(node);
        }
        Ok(())
    }

    /// Pops the most recently pushed value.
    ///
    /// The freed node is routed back to the slot that pushed it: onto this
    /// slot's free list when it is ours, otherwise through the owner's
    /// deferred ring (or absorbed here if that ring is full).
    pub fn pop(&self) -> Result<usize, SheafError> {
        let node = self.sheaf.head.pop().ok_or(SheafError::Empty)?.as_ptr();

        // SAFETY: a popped node is exclusively ours; owner was written
        // before the node was published and is bounds-checked at push.
        unsafe {
            let value = (*node).value;
            let owner = (*node).owner;
            debug_assert_slot_index!(owner, self.sheaf.nslots);

            let slot = self.sheaf.slot_at(self.index);
            if owner == self.index {
                slot.free_local(node);
            } else {
                slot.free_remote(self.sheaf.slot_at(owner), node);
            }
            Ok(value)
        }
    }

    /// Like [`pop`], but waits out a transiently empty stack with an
    /// adaptive backoff before reporting [`SheafError::Empty`].
    ///
    /// [`pop`]: SlotRef::pop
    pub fn pop_with_backoff(&self) -> Result<usize, SheafError> {
        let mut backoff = Backoff::new();
        loop {
            match self.pop() {
                Err(SheafError::Empty) if !backoff.is_completed() => backoff.snooze(),
                result => return result,
            }
        }
    }
}

impl Drop for SlotRef<'_, '_> {
    fn drop(&mut self) {
        let bit = 1u32 << self.index;
        self.sheaf.claims.fetch_and(!bit, Ordering::Release);
    }
}
