use core::cell::Cell;
use core::ptr::{self, NonNull};
use std::collections::HashSet;
use std::fmt;

cfg_if::cfg_if! {
    if #[cfg(feature = "check-loom")] {
        use loom::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
    } else {
        use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
    }
}

use super::HAZARDS;

/// Represents the ownership of a hazard pointer slot.
pub struct Shield {
    slot: NonNull<HazardSlot>,
    /// Machine representation of the address last published through `set`,
    /// kept so `Drop` can issue a conditional clear without an argument.
    published: Cell<*mut ()>,
}

impl Shield {
    /// Creates a new shield for hazard pointer.
    pub fn new(hazards: &HazardBag) -> Self {
        let slot = hazards.acquire_slot().into();
        Self {
            slot,
            published: Cell::new(ptr::null_mut()),
        }
    }

    /// Store `pointer` to the hazard slot.
    ///
    /// Uses sequential consistency so that any thread performing a
    /// `snapshot`/`all_hazards` scan afterwards is guaranteed to observe
    /// this publication (see `validate`).
    pub fn set<T>(&self, pointer: *mut T) {
        let slot = unsafe { self.slot.as_ref() };
        let erased = pointer as *mut ();
        slot.hazard.store(erased, Ordering::SeqCst);
        self.published.set(erased);
    }

    /// Clear the hazard slot, but only if it still holds `pointer`.
    ///
    /// If the slot has since been overwritten by a later `set` to a
    /// different address, this is a no-op: a stale clear must never erase a
    /// subsequent protection.
    pub fn clear<T>(&self, pointer: *mut T) {
        let slot = unsafe { self.slot.as_ref() };
        let erased = pointer as *mut ();
        if slot
            .hazard
            .compare_exchange(erased, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.published.set(ptr::null_mut());
        }
    }

    /// Check if `src` still points to `pointer`. If not, returns the current value.
    ///
    /// For a pointer `p`, if "`src` still pointing to `pointer`" implies that `p` is not retired,
    /// then `Ok(())` means that shields set to `p` are validated.
    pub fn validate<T>(pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        let current = src.load(Ordering::SeqCst);
        // double check the pointer make sure beween the reader `load the pointer and store in the
        // hazard slot` happed before the `writer retire the pointer and scan the retired
        // list`
        if current == pointer {
            Ok(())
        } else {
            Err(current)
        }
    }

    /// Try protecting `pointer` obtained from `src`. If not, returns the current value.
    ///
    /// If "`src` still pointing to `pointer`" implies that `pointer` is not retired, then `Ok(())`
    /// means that this shield is validated.
    pub fn try_protect<T>(&self, pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        self.set(pointer);
        Self::validate(pointer, src).inspect_err(|_| self.clear(pointer))
    }

    /// Get a protected pointer from `src`.
    ///
    /// See `try_protect()`.
    pub fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut pointer = src.load(Ordering::Relaxed);
        while let Err(new) = self.try_protect(pointer, src) {
            pointer = new;
            #[cfg(feature = "check-loom")]
            loom::sync::atomic::spin_loop_hint();
        }
        pointer
    }
}

impl Default for Shield {
    fn default() -> Self {
        Self::new(&HAZARDS)
    }
}

impl Drop for Shield {
    /// Clear and release the ownership of the hazard slot.
    ///
    /// The clear is conditional on the address this shield last published,
    /// same as an explicit `clear` call: it never erases a value the shield
    /// itself didn't set.
    fn drop(&mut self) {
        let slot = unsafe { self.slot.as_ref() };
        let _ = slot.hazard.compare_exchange(
            self.published.get(),
            ptr::null_mut(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        slot.active.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Shield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shield")
            .field("slot address", &self.slot)
            .field("slot data", unsafe { self.slot.as_ref() })
            .finish()
    }
}

/// Global bag (multiset) of hazards pointers.
/// `HazardBag.head` and `HazardSlot.next` form a grow-only list of all hazard slots. Slots are
/// never removed from this list. Instead, it gets deactivated and recycled for other `Shield`s.
#[derive(Debug)]
pub struct HazardBag {
    head: AtomicPtr<HazardSlot>,
}

/// See `HazardBag`
#[derive(Debug)]
struct HazardSlot {
    // Whether this slot is occupied by a `Shield`.
    active: AtomicBool,
    // Machine representation of the hazard pointer.
    hazard: AtomicPtr<()>,
    // Immutable pointer to the next slot in the bag.
    next: *const HazardSlot,
}

impl HazardSlot {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            hazard: AtomicPtr::new(ptr::null_mut()),
            next: ptr::null(),
        }
    }
}

impl HazardBag {
    #[cfg(not(feature = "check-loom"))]
    /// Creates a new global hazard set.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[cfg(feature = "check-loom")]
    /// Creates a new global hazard set.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquires a slot in the hazard set, either by recycling an inactive slot or allocating a new
    /// slot.
    fn acquire_slot(&self) -> &HazardSlot {
        if let Some(slot) = self.try_acquire_inactive() {
            return slot;
        }

        // No inactive slot found, allocate a new slot.
        let slot = Box::new(HazardSlot::new());

        // Link the new slot to the head of the list.
        let slot_ptr = Box::into_raw(slot);
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { slot_ptr.as_mut().unwrap().next = head };
            if self
                .head
                .compare_exchange_weak(head, slot_ptr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return unsafe { &*slot_ptr };
            }
        }
    }

    /// Find an inactive slot and activate it.
    fn try_acquire_inactive(&self) -> Option<&HazardSlot> {
        let mut slot_ptr = self.head.load(Ordering::Relaxed);
        while !slot_ptr.is_null() {
            let slot = unsafe { &*slot_ptr };
            if !slot.active.load(Ordering::Relaxed)
                && slot
                    .active
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(slot);
            }
            slot_ptr = slot.next as *mut HazardSlot;
        }
        None
    }

    /// Returns all the hazards in the set.
    ///
    /// The head is loaded with sequential consistency: this snapshot is a
    /// lower bound on the hazard set as of that load, and any `publish` that
    /// completed strictly before it is guaranteed to be observed here.
    pub fn all_hazards(&self) -> HashSet<*mut ()> {
        let mut hazards = HashSet::new();
        let mut slot_ptr = self.head.load(Ordering::SeqCst);
        while !slot_ptr.is_null() {
            let slot = unsafe { &*slot_ptr };
            let hazard = slot.hazard.load(Ordering::Relaxed);
            if !hazard.is_null() {
                hazards.insert(hazard);
            }
            slot_ptr = slot.next as *mut HazardSlot;
        }
        hazards
    }
}

impl Default for HazardBag {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardBag {
    /// Frees all slots.
    fn drop(&mut self) {
        // # Safety
        // only one thread can own the `mut self`.
        unsafe {
            let mut slot_ptr = self.head.load(Ordering::Relaxed);
            while !slot_ptr.is_null() {
                let slot = Box::from_raw(slot_ptr);
                slot_ptr = slot.next as *mut HazardSlot;
            }
        }
    }
}

unsafe impl Send for HazardSlot {}
unsafe impl Sync for HazardSlot {}
