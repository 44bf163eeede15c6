//! Fixed-slot descriptor table.
//!
//! Descriptor allocation is lock-free: claiming compare-exchanges a slot
//! from null to a reserved sentinel and assignment exchanges the sentinel
//! for the real handle.  Between the two phases the sentinel keeps
//! competing claimants out of the slot while staying invisible to
//! lookups.  Misusing the protocol (assigning a slot that was never
//! claimed) is a consistency violation and panics.
//!
//! Lookups and closes on a single descriptor are serialized by the
//! owning task; claims may race freely from any context.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::sync::Arc;

use crate::config;
use crate::error::{Result, TaskError};
use crate::file::File;

/// Sentinel marking a slot as claimed but not yet assigned.
fn claimed() -> *mut File {
    NonNull::<File>::dangling().as_ptr()
}

/// Per-task table mapping small integer descriptors to open resources.
pub struct FdTable {
    slots: [AtomicPtr<File>; config::MAX_OPEN_FILES],
}

impl FdTable {
    pub const fn new() -> FdTable {
        const EMPTY: AtomicPtr<File> = AtomicPtr::new(ptr::null_mut());
        FdTable {
            slots: [EMPTY; config::MAX_OPEN_FILES],
        }
    }

    /// Reserve the lowest empty slot, returning its index.
    ///
    /// The caller must follow up with [`assign`](FdTable::assign) or
    /// [`release_claim`](FdTable::release_claim).
    pub fn claim(&self) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(
                    ptr::null_mut(),
                    claimed(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(i);
            }
        }
        Err(TaskError::NoFreeHandle)
    }

    /// Install `file` into a slot previously returned by
    /// [`claim`](FdTable::claim).
    ///
    /// # Panics
    ///
    /// Panics if the slot was not claimed.
    pub fn assign(&self, fd: usize, file: Arc<File>) {
        let raw = Arc::into_raw(file) as *mut File;
        if self.slots[fd]
            .compare_exchange(claimed(), raw, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("handle slot {} assigned without claim", fd);
        }
    }

    /// Give back a claimed slot without assigning it.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not claimed.
    pub fn release_claim(&self, fd: usize) {
        if self.slots[fd]
            .compare_exchange(
                claimed(),
                ptr::null_mut(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            panic!("released handle slot {} that was not claimed", fd);
        }
    }

    /// Claim a slot and assign `file` in one call.
    pub fn install(&self, file: Arc<File>) -> Result<usize> {
        let fd = self.claim()?;
        self.assign(fd, file);
        Ok(fd)
    }

    /// Look up the resource behind a descriptor.
    pub fn get(&self, fd: usize) -> Result<Arc<File>> {
        if fd >= config::MAX_OPEN_FILES {
            return Err(TaskError::BadHandle);
        }
        let raw = self.slots[fd].load(Ordering::SeqCst);
        if raw.is_null() || raw == claimed() {
            return Err(TaskError::BadHandle);
        }
        // SAFETY: a non-sentinel pointer is the slot's live Arc<File>.
        // The owning task serializes get against close on one
        // descriptor, so the reference cannot be dropped under us.
        unsafe {
            Arc::increment_strong_count(raw);
            Ok(Arc::from_raw(raw))
        }
    }

    /// Duplicate a descriptor into the lowest free slot.
    pub fn dup(&self, fd: usize) -> Result<usize> {
        let file = self.get(fd)?;
        self.install(file)
    }

    /// Duplicate `oldfd` into exactly `newfd`, closing whatever `newfd`
    /// held.  Duplicating a descriptor onto itself is a no-op.  A slot
    /// in the middle of a claim cannot be displaced.
    pub fn dup2(&self, oldfd: usize, newfd: usize) -> Result<usize> {
        if newfd >= config::MAX_OPEN_FILES {
            return Err(TaskError::BadHandle);
        }
        let file = self.get(oldfd)?;
        if oldfd == newfd {
            return Ok(newfd);
        }
        let prev = self.slots[newfd].load(Ordering::SeqCst);
        if prev == claimed() {
            return Err(TaskError::BadHandle);
        }
        let raw = Arc::into_raw(file) as *mut File;
        if self.slots[newfd]
            .compare_exchange(prev, raw, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // SAFETY: the reference leaked for the slot was never
            // stored; reclaim it.
            unsafe { drop(Arc::from_raw(raw)) };
            return Err(TaskError::BadHandle);
        }
        if !prev.is_null() {
            // SAFETY: we displaced the slot's reference.
            unsafe { drop(Arc::from_raw(prev)) };
        }
        Ok(newfd)
    }

    /// Release a descriptor.  Empty and claimed-but-unassigned slots
    /// report [`TaskError::BadHandle`]; the claim itself is left alone.
    pub fn close(&self, fd: usize) -> Result<()> {
        if fd >= config::MAX_OPEN_FILES {
            return Err(TaskError::BadHandle);
        }
        let raw = self.slots[fd].load(Ordering::SeqCst);
        if raw.is_null() || raw == claimed() {
            return Err(TaskError::BadHandle);
        }
        if self.slots[fd]
            .compare_exchange(raw, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TaskError::BadHandle);
        }
        // SAFETY: we took the slot's reference out of the table.
        unsafe { drop(Arc::from_raw(raw)) };
        Ok(())
    }

    /// Release every open descriptor.  Part of exit teardown.
    pub(crate) fn close_all(&self) {
        for slot in self.slots.iter() {
            let prev = slot.swap(ptr::null_mut(), Ordering::SeqCst);
            if !prev.is_null() && prev != claimed() {
                // SAFETY: as in close.
                unsafe { drop(Arc::from_raw(prev)) };
            }
        }
    }

    /// Copy into a forked child's table: every open slot gains a
    /// reference to the same underlying resource.  Never a deep copy.
    /// `target` must be a freshly created, empty table.
    pub(crate) fn duplicate_into(&self, target: &FdTable) {
        for (i, slot) in self.slots.iter().enumerate() {
            let raw = slot.load(Ordering::SeqCst);
            if raw.is_null() || raw == claimed() {
                continue;
            }
            // SAFETY: extra reference taken for the copy; the owner
            // serializes fork against close on its own table.
            unsafe { Arc::increment_strong_count(raw) };
            target.slots[i].store(raw, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn duplicate(&self) -> FdTable {
        let copy = FdTable::new();
        self.duplicate_into(&copy);
        copy
    }

    /// Number of assigned descriptors.  Diagnostic only.
    pub fn count_open(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                let raw = slot.load(Ordering::SeqCst);
                !raw.is_null() && raw != claimed()
            })
            .count()
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl Default for FdTable {
    fn default() -> FdTable {
        FdTable::new()
    }
}
