//! Buddy and first-fit dynamic memory managers over a caller-supplied byte region.
//!
//! Two independent allocation cores are provided:
//!
//! - [`ff::FirstFit`] — a classic Knuth first-fit arena: blocks partition the
//!   region with no gaps, tagged in-use/free, joined by a size-sorted doubly
//!   linked avail list.
//! - [`bud::Buddy`] — a power-of-two buddy arena with a bit-packed out-of-band
//!   size area, optionally backed by an embedded [`ff::FirstFit`] "emergency"
//!   arena used once the buddy main heap is exhausted.
//!
//! Neither core is thread-safe on its own; [`lock::LockedFirstFit`] and
//! [`lock::LockedBuddy`] add a `spin::Mutex` around a descriptor for callers
//! that don't already hold an external lock across `get`/`free`/`extend`.
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(clippy::missing_safety_doc)]

pub mod bud;
pub mod diag;
pub mod error;
pub mod ff;
pub mod lock;
pub mod region;

pub use bud::Buddy;
pub use error::AllocError;
pub use ff::FirstFit;
pub use lock::{LockedBuddy, LockedFirstFit};
pub use region::{PseudoPtr, Region};
