//! A lock-free LIFO stack, the reference consumer of the hazard-pointer
//! reclamation core.
//!
//! `push` is a textbook Treiber stack insertion. `try_pop` additionally
//! protects the observed head with a [`Shield`] and re-reads the real head
//! before dereferencing it: this closes the window in which another thread
//! could have already unlinked and retired the node between the initial load
//! and the publication of the hazard.
use core::mem::ManuallyDrop;
use core::ptr;
use std::cell::RefCell;

cfg_if::cfg_if! {
    if #[cfg(feature = "check-loom")] {
        use loom::sync::atomic::{AtomicPtr, Ordering};
    } else {
        use core::sync::atomic::{AtomicPtr, Ordering};
    }
}

use crate::hazard::Shield;
use crate::retire::RetiredSet;

struct Node<T> {
    elem: ManuallyDrop<T>,
    next: AtomicPtr<Node<T>>,
}

thread_local! {
    /// One retired buffer per thread, shared by every `Stack` the thread
    /// ever pops from. This mirrors the reclamation core's contract that the
    /// retired list is thread-local, not per-container.
    static RETIRED: RefCell<RetiredSet<'static>> = RefCell::new(RetiredSet::default());
}

/// A lock-free, multi-producer multi-consumer LIFO stack.
pub struct Stack<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> Stack<T> {
    /// Create a new, empty stack.
    #[cfg(not(feature = "check-loom"))]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Create a new, empty stack.
    #[cfg(feature = "check-loom")]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push `value` onto the top of the stack.
    pub fn push(&self, value: T) {
        let new_node = Box::into_raw(Box::new(Node {
            elem: ManuallyDrop::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        loop {
            let head = self.head.load(Ordering::Relaxed);
            // Safety: `new_node` was just allocated and is not yet visible
            // to any other thread, so writing its `next` link is exclusive.
            unsafe { (*new_node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, new_node, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Remove and return the top value, or `None` if the stack is empty.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            if head.is_null() {
                return None;
            }

            let shield = Shield::default();
            // Publish the hazard and re-read the real head. If they no
            // longer match, `head` may already be retired elsewhere; retry
            // with whatever the shield observed instead.
            if shield.try_protect(head, &self.head).is_err() {
                continue;
            }

            // Safety: `shield` protects `head` against reclamation for as
            // long as it is alive, and the re-read above confirmed `head`
            // was still reachable from the stack after the hazard was
            // published.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };

            if self
                .head
                .compare_exchange_weak(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: `head` was just unlinked by the CAS above, so this
                // thread has exclusive access to its `elem` field; no other
                // live reference can read it back out.
                let value = unsafe { ManuallyDrop::take(&mut (*head).elem) };
                RETIRED.with(|retired| unsafe { retired.borrow_mut().retire(head) });
                return Some(value);
            }
        }
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // No concurrent accessors can remain once `&mut self` is available,
        // so the remaining chain can be walked and freed directly without
        // going through the hazard-pointer retire path.
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

#[cfg(all(test, not(feature = "check-loom")))]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering as StdOrdering};
    use std::thread;

    use super::Stack;

    #[test]
    fn pop_empty_returns_none() {
        let stack: Stack<i32> = Stack::new();
        assert_eq!(stack.try_pop(), None);
    }

    #[test]
    fn single_thread_push_pop_is_lifo() {
        let stack = Stack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.try_pop(), Some(3));
        assert_eq!(stack.try_pop(), Some(2));
        assert_eq!(stack.try_pop(), Some(1));
        assert_eq!(stack.try_pop(), None);
    }

    #[test]
    fn two_producers_two_consumers_balanced() {
        const PER_PRODUCER: i32 = 10_000;
        const PRODUCERS: i32 = 2;

        let stack = Arc::new(Stack::new());
        let producers_done = Arc::new(AtomicUsize::new(0));

        let producer_handles: Vec<_> = (0..PRODUCERS)
            .map(|offset| {
                let stack = stack.clone();
                let producers_done = producers_done.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        stack.push(offset + i * PRODUCERS);
                    }
                    producers_done.fetch_add(1, StdOrdering::SeqCst);
                })
            })
            .collect();

        let consumer_handles: Vec<_> = (0..2)
            .map(|_| {
                let stack = stack.clone();
                let producers_done = producers_done.clone();
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    loop {
                        match stack.try_pop() {
                            Some(v) => popped.push(v),
                            None => {
                                if producers_done.load(StdOrdering::SeqCst) as i32 == PRODUCERS {
                                    if let Some(v) = stack.try_pop() {
                                        popped.push(v);
                                        continue;
                                    }
                                    return popped;
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for h in producer_handles {
            h.join().unwrap();
        }

        let mut all = Vec::new();
        for h in consumer_handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();

        let expected: Vec<i32> = (0..PER_PRODUCER * PRODUCERS).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn stress_four_producers_four_consumers() {
        const PER_PRODUCER: i32 = 20_040;
        const PRODUCERS: i32 = 4;
        const CONSUMERS: usize = 4;

        let producers_done = Arc::new(AtomicUsize::new(0));
        let destructions = Arc::new(AtomicI32::new(0));

        struct Counted(Arc<AtomicI32>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, StdOrdering::SeqCst);
            }
        }

        let stack_of_pairs: Arc<Stack<(i32, Counted)>> = Arc::new(Stack::new());
        let producer_handles: Vec<_> = (0..PRODUCERS)
            .map(|offset| {
                let stack = stack_of_pairs.clone();
                let producers_done = producers_done.clone();
                let destructions = destructions.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let v = i * PRODUCERS + offset;
                        stack.push((v, Counted(destructions.clone())));
                    }
                    producers_done.fetch_add(1, StdOrdering::SeqCst);
                })
            })
            .collect();

        let consumer_handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let stack = stack_of_pairs.clone();
                let producers_done = producers_done.clone();
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    loop {
                        match stack.try_pop() {
                            Some((v, counted)) => {
                                popped.push(v);
                                drop(counted);
                            }
                            None => {
                                if producers_done.load(StdOrdering::SeqCst) as i32 == PRODUCERS {
                                    match stack.try_pop() {
                                        Some((v, counted)) => {
                                            popped.push(v);
                                            drop(counted);
                                        }
                                        None => return popped,
                                    }
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for h in producer_handles {
            h.join().unwrap();
        }

        let mut all = Vec::new();
        for h in consumer_handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();

        let expected: Vec<i32> = (0..PER_PRODUCER * PRODUCERS).collect();
        assert_eq!(all, expected);
        assert_eq!(
            destructions.load(StdOrdering::SeqCst),
            PER_PRODUCER * PRODUCERS
        );
    }

    #[test]
    fn protect_without_retire_has_no_effect() {
        let stack = Stack::new();
        stack.push(7);
        let shield = super::Shield::default();
        // Protecting the stack's own head slot while nothing retires it
        // should simply have no observable effect.
        let _ = shield.protect(&stack.head);
        assert_eq!(stack.try_pop(), Some(7));
        drop(shield);
    }

    #[test]
    fn distinct_values_survive_the_round_trip() {
        let stack = Stack::new();
        let mut seen = HashSet::new();
        for i in 0..1000 {
            stack.push(i);
        }
        while let Some(v) = stack.try_pop() {
            seen.insert(v);
        }
        assert_eq!(seen.len(), 1000);
    }
}
