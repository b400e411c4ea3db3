//! Hazard-pointer based safe memory reclamation.
//!
//! This crate provides the building blocks for reclaiming memory in
//! lock-free data structures without ever freeing an object that another
//! thread might still be dereferencing:
//!
//! * [`hazard`] — the process-wide [`HazardBag`](hazard::HazardBag) and the
//!   scoped [`Shield`](hazard::Shield) a thread uses to announce "I am
//!   currently looking at this pointer".
//! * [`retire`] — the thread-local [`RetiredSet`](retire::RetiredSet) a
//!   thread uses to hand off an unlinked pointer for deferred deletion.
//! * [`stack`] — a lock-free LIFO [`Stack`](stack::Stack) built on top of the
//!   two modules above, serving both as the reference consumer and as the
//!   test harness for the reclamation discipline.
//!
//! The discipline every consumer must follow is: **protect before you read,
//! retire after you unlink**. A [`Shield`](hazard::Shield) must be published
//! and re-validated against the shared location before the pointer it
//! protects is dereferenced; only after a pointer has been atomically
//! unlinked from shared memory may it be passed to
//! [`RetiredSet::retire`](retire::RetiredSet::retire).
pub mod hazard;
pub mod retire;
pub mod stack;

pub use hazard::{HazardBag, Shield};
pub use retire::RetiredSet;
pub use stack::Stack;

#[cfg(not(feature = "check-loom"))]
/// The process-wide hazard registry used by [`Shield::default`] and
/// [`RetiredSet::default`].
///
/// Consumers that want an isolated registry (for example, to scope
/// reclamation to a single data structure rather than the whole process)
/// should construct their own [`HazardBag`] and pass it explicitly to
/// [`Shield::new`] and [`RetiredSet::new`] instead of relying on this
/// singleton.
pub static HAZARDS: HazardBag = HazardBag::new();

#[cfg(feature = "check-loom")]
loom::lazy_static! {
    /// See the non-loom definition above; `loom`'s `AtomicPtr` has no
    /// `const fn new`, so the loom build initializes this lazily instead.
    pub static ref HAZARDS: HazardBag = HazardBag::new();
}
