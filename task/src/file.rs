//! Open-resource handles.
//!
//! A [`File`] is anything a descriptor can name: a pipe end, a device, a
//! directory used as a working-directory reference.  Behavior comes from
//! the [`FileOps`] trait; sharing and lifetime come from `Arc`, so fork
//! and dup duplicate references, never the resource.

use core::fmt;

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::error::{Result, TaskError};
use crate::poll::{PollMask, PollRegistration};

/// Operations a resource may support.  Everything has a default so
/// minimal resources implement only what they need.
pub trait FileOps: Send + Sync {
    /// Read into `buf`, returning bytes read; 0 means end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _ = buf;
        Err(TaskError::Unsupported)
    }

    /// Write from `buf`, returning bytes written.
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let _ = buf;
        Err(TaskError::Unsupported)
    }

    /// Report readiness for the conditions in `interest`, registering the
    /// caller's wait entries with this resource's event sources.
    ///
    /// The default treats the resource as always ready for read and
    /// write and registers nothing.
    fn poll(&self, interest: PollMask, registration: &mut PollRegistration<'_>) -> PollMask {
        let _ = registration;
        (PollMask::IN | PollMask::OUT) & interest
    }
}

/// A shared open resource.
pub struct File {
    ops: Box<dyn FileOps>,
}

impl File {
    pub fn new<O: FileOps + 'static>(ops: O) -> Arc<File> {
        Arc::new(File { ops: Box::new(ops) })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ops.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ops.write(buf)
    }

    pub fn poll(&self, interest: PollMask, registration: &mut PollRegistration<'_>) -> PollMask {
        self.ops.poll(interest, registration)
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("File")
    }
}
