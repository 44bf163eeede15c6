//! Address-space ownership handles.
//!
//! Virtual-memory management is an external collaborator; this crate only
//! tracks who owns which space.  A handle is created empty for a new user
//! task, duplicated on fork, and released when the owning task exits.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Owned handle to one task's virtual address space.
pub struct AddressSpace {
    id: u64,
}

impl AddressSpace {
    /// Allocate a fresh, empty address space.
    pub fn new_empty() -> AddressSpace {
        let id = NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("[mm] address space {} created", id);
        AddressSpace { id }
    }

    /// Duplicate this space for a forked child.
    pub fn duplicate(&self) -> AddressSpace {
        let copy = AddressSpace::new_empty();
        log::trace!("[mm] address space {} duplicated from {}", copy.id, self.id);
        copy
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        log::trace!("[mm] address space {} released", self.id);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AddressSpace").field(&self.id).finish()
    }
}

/// Switch the executing CPU onto the kernel-only address space.
///
/// Called on the exit path before the current task's user space is
/// released out from under it.
pub fn switch_to_kernel() {
    log::trace!("[mm] switched to kernel address space");
}
