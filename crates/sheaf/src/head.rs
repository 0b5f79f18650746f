use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;

use crate::relax::relax;
use crate::slot::Node;

// =============================================================================
// ABA PROTECTION
// =============================================================================
//
// The head is a (top, tag) pair updated as one 16-byte atomic word. A CAS on
// the bare pointer would admit the classical ABA: a thread loads top = A,
// stalls, A is popped and later re-pushed at the same address, and the stale
// CAS succeeds against a stack it never observed. The tag increments on every
// successful mutation, so a recycled address alone can no longer satisfy the
// compare.
//
// Tag wrap-around would need 2^64 head mutations within one stalled CAS
// window; it is not a practical concern.
//
// Popped nodes go back to per-slot free lists and are only handed to the page
// provider at teardown, so a popper holding a stale `top` always dereferences
// mapped memory. It may read a stale `next`, but the tag mismatch rejects the
// CAS and the loop reloads.
// =============================================================================

/// Top-of-stack pointer paired with its ABA tag.
///
/// Padded onto its own cache line: the head is the single most contended word
/// in the structure and must not share a line with the read-mostly facade
/// fields.
pub(crate) struct StackHead {
    state: CachePadded<AtomicU128>,
}

/// Low 64 bits: node pointer. High 64 bits: tag.
#[inline]
fn pack(top: *mut Node, tag: u64) -> u128 {
    (u128::from(tag) << 64) | (top as usize as u128)
}

#[inline]
fn unpack(word: u128) -> (*mut Node, u64) {
    (word as u64 as usize as *mut Node, (word >> 64) as u64)
}

impl StackHead {
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU128::new(pack(ptr::null_mut(), 0))),
        }
    }

    /// True if the stack was observed empty.
    ///
    /// A snapshot only: concurrent pushes and pops may change the answer
    /// before the caller acts on it.
    pub(crate) fn is_empty(&self) -> bool {
        let (top, _) = unpack(self.state.load(Ordering::Acquire));
        top.is_null()
    }

    /// Links `node` as the new top.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node owned by the caller and not reachable
    /// from anywhere else; this call publishes it.
    pub(crate) unsafe fn push(&self, node: *mut Node) {
        let mut observed = self.state.load(Ordering::Acquire);
        loop {
            let (top, tag) = unpack(observed);
            // The node is still private to us; the CAS release below
            // publishes this write together with value and owner.
            (*node).next.store(top, Ordering::Relaxed);

            let desired = pack(node, tag.wrapping_add(1));
            match self.state.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    log::trace!("head push: ({:p}, {}) -> ({:p}, {})", top, tag, node, tag.wrapping_add(1));
                    return;
                }
                Err(current) => {
                    observed = current;
                    relax();
                }
            }
        }
    }

    /// Unlinks and returns the top node, or `None` when the stack is empty.
    ///
    /// The returned node is exclusively owned by the caller; its `value` and
    /// `owner` fields are visible via the CAS acquire edge.
    pub(crate) fn pop(&self) -> Option<NonNull<Node>> {
        let mut observed = self.state.load(Ordering::Acquire);
        loop {
            let (top, tag) = unpack(observed);
            let top = NonNull::new(top)?;

            // SAFETY: nodes are never unmapped while the stack is live, so
            // even a stale `top` points at readable memory. The load may be
            // stale; the tag comparison below rejects it if so.
            let next = unsafe { top.as_ref().next.load(Ordering::Acquire) };

            let desired = pack(next, tag.wrapping_add(1));
            match self.state.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    log::trace!("head pop:  ({:p}, {}) -> ({:p}, {})", top, tag, next, tag.wrapping_add(1));
                    return Some(top);
                }
                Err(current) => {
                    observed = current;
                    relax();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicPtr;

    fn leak_node(value: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            next_free: ptr::null_mut(),
            next: AtomicPtr::new(ptr::null_mut()),
            owner: 0,
            value,
        }))
    }

    unsafe fn reclaim_node(node: NonNull<Node>) {
        drop(Box::from_raw(node.as_ptr()));
    }

    #[test]
    fn pack_round_trips() {
        let node = 0x7fff_dead_b000 as *mut Node;
        let (top, tag) = unpack(pack(node, 41));
        assert_eq!(top, node);
        assert_eq!(tag, 41);

        let (top, tag) = unpack(pack(ptr::null_mut(), u64::MAX));
        assert!(top.is_null());
        assert_eq!(tag, u64::MAX);
    }

    #[test]
    fn serial_push_pop_is_lifo() {
        let head = StackHead::new();
        assert!(head.is_empty());

        for value in [1usize, 2, 3] {
            unsafe { head.push(leak_node(value)) };
        }
        assert!(!head.is_empty());

        for expected in [3usize, 2, 1] {
            let node = head.pop().expect("stack should not be empty");
            unsafe {
                assert_eq!(node.as_ref().value, expected);
                reclaim_node(node);
            }
        }
        assert!(head.is_empty());
        assert!(head.pop().is_none());
    }

    #[test]
    fn tag_increments_on_every_mutation() {
        let head = StackHead::new();

        unsafe { head.push(leak_node(7)) };
        let (_, tag) = unpack(head.state.load(Ordering::Relaxed));
        assert_eq!(tag, 1);

        let node = head.pop().unwrap();
        let (top, tag) = unpack(head.state.load(Ordering::Relaxed));
        assert!(top.is_null());
        assert_eq!(tag, 2);

        unsafe { reclaim_node(node) };
    }
}
