//! `spin::Mutex`-guarded wrappers around [`FirstFit`] and [`Buddy`], for
//! callers that want to share one arena across threads (or interrupt
//! contexts) without holding an external lock of their own — the same role
//! the teacher's `LockedBuddyAllocator<N>` plays around its bare
//! `BuddyAllocator<N>`.
//!
//! With the `global-alloc` feature enabled, both wrappers also implement
//! [`GlobalAlloc`], so either can be installed with `#[global_allocator]`.

use spin::Mutex;

use crate::bud::Buddy;
use crate::diag::HeapStats;
use crate::error::Result;
use crate::ff::FirstFit;
use crate::region::{PseudoPtr, Region};

/// A [`FirstFit`] arena behind a spinlock.
pub struct LockedFirstFit {
    inner: Mutex<FirstFit>,
}

impl LockedFirstFit {
    pub fn init(region: Region) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(FirstFit::init(region)?),
        })
    }

    pub fn get(&self, size: u32) -> Result<PseudoPtr> {
        self.inner.lock().get(size)
    }

    pub fn free(&self, ptr: PseudoPtr) -> Result<()> {
        self.inner.lock().free(ptr)
    }

    pub fn extend(&self, ptr: PseudoPtr, new_size: u32) -> Result<PseudoPtr> {
        self.inner.lock().extend(ptr, new_size)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn print<W: core::fmt::Write>(&self, w: &mut W) -> core::fmt::Result {
        self.inner.lock().print(w)
    }
}

/// A [`Buddy`] arena behind a spinlock.
pub struct LockedBuddy {
    inner: Mutex<Buddy>,
}

impl LockedBuddy {
    pub fn init(region: Region) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Buddy::init(region)?),
        })
    }

    pub fn get(&self, size: u32) -> Result<PseudoPtr> {
        self.inner.lock().get(size)
    }

    pub fn free(&self, ptr: PseudoPtr) -> Result<()> {
        self.inner.lock().free(ptr)
    }

    pub fn extend(&self, ptr: PseudoPtr, new_size: u32) -> Result<PseudoPtr> {
        self.inner.lock().extend(ptr, new_size)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn print<W: core::fmt::Write>(&self, w: &mut W) -> core::fmt::Result {
        self.inner.lock().print(w)
    }
}

#[cfg(feature = "global-alloc")]
mod global_alloc {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::NonNull;

    use super::{LockedBuddy, LockedFirstFit};

    unsafe impl GlobalAlloc for LockedFirstFit {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let mut inner = self.inner.lock();
            match inner.get(layout.size() as u32) {
                Ok(ptr) => unsafe { inner.region().host_ptr(ptr).as_ptr() },
                Err(_) => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            let mut inner = self.inner.lock();
            let Some(nn) = NonNull::new(ptr) else {
                return;
            };
            if let Some(off) = inner.region().ptr_to_offset(nn) {
                let _ = inner.free(off);
            }
        }
    }

    unsafe impl GlobalAlloc for LockedBuddy {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let mut inner = self.inner.lock();
            match inner.get(layout.size() as u32) {
                Ok(ptr) => unsafe { inner.region().host_ptr(ptr).as_ptr() },
                Err(_) => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            let mut inner = self.inner.lock();
            let Some(nn) = NonNull::new(ptr) else {
                return;
            };
            if let Some(off) = inner.region().ptr_to_offset(nn) {
                let _ = inner.free(off);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    #[test]
    fn locked_first_fit_round_trips_an_allocation() {
        let buf = Box::leak(vec![0u8; 256].into_boxed_slice());
        let region = unsafe { Region::new(NonNull::new(buf.as_mut_ptr()).unwrap(), 256) };
        let ff = LockedFirstFit::init(region).unwrap();

        let p = ff.get(32).unwrap();
        ff.free(p).unwrap();
        assert_eq!(ff.stats().used, 0);
    }

    #[test]
    fn locked_buddy_round_trips_an_allocation() {
        let buf = Box::leak(vec![0u8; 4096].into_boxed_slice());
        let region = unsafe { Region::new(NonNull::new(buf.as_mut_ptr()).unwrap(), 4096) };
        let bud = LockedBuddy::init(region).unwrap();

        let p = bud.get(100).unwrap();
        bud.free(p).unwrap();
        assert_eq!(bud.stats().used, 0);
    }
}
