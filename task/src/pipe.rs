//! Anonymous pipes: a bounded in-kernel byte channel with a read end
//! and a write end, each an ordinary [`File`].
//!
//! The operations themselves never block; an empty or full buffer
//! reports [`TaskError::WouldBlock`] and blocking is composed out of
//! [`crate::poll::poll`].  End-of-life is drop-driven: when the last
//! reference to the write end goes away readers see end of stream, and
//! writers without readers get [`TaskError::BrokenPipe`].

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::config;
use crate::error::{Result, TaskError};
use crate::file::{File, FileOps};
use crate::poll::{PollMask, PollRegistration};
use crate::sync::{Mutex, WaitQueue};

struct PipeState {
    buffer: Mutex<VecDeque<u8>>,
    /// Byte count mirror of `buffer`, maintained under the buffer lock
    /// and read lock-free by readiness checks.
    len: AtomicUsize,
    readers: AtomicUsize,
    writers: AtomicUsize,
    /// Tasks waiting for data.
    read_queue: WaitQueue,
    /// Tasks waiting for buffer space.
    write_queue: WaitQueue,
}

impl PipeState {
    fn new() -> Arc<PipeState> {
        Arc::new(PipeState {
            buffer: Mutex::new(VecDeque::with_capacity(config::PIPE_CAPACITY)),
            len: AtomicUsize::new(0),
            readers: AtomicUsize::new(1),
            writers: AtomicUsize::new(1),
            read_queue: WaitQueue::new(),
            write_queue: WaitQueue::new(),
        })
    }

    fn bytes_buffered(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    fn has_readers(&self) -> bool {
        self.readers.load(Ordering::SeqCst) > 0
    }

    fn has_writers(&self) -> bool {
        self.writers.load(Ordering::SeqCst) > 0
    }
}

struct PipeReader {
    state: Arc<PipeState>,
}

struct PipeWriter {
    state: Arc<PipeState>,
}

impl FileOps for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut buffer = self.state.buffer.lock();
        if buffer.is_empty() {
            // Writers flush under this lock, so an empty buffer with no
            // writers left really is the end of the stream.
            if !self.state.has_writers() {
                return Ok(0);
            }
            return Err(TaskError::WouldBlock);
        }
        let count = buf.len().min(buffer.len());
        for byte in buf[..count].iter_mut() {
            match buffer.pop_front() {
                Some(b) => *byte = b,
                None => break,
            }
        }
        self.state.len.store(buffer.len(), Ordering::SeqCst);
        drop(buffer);
        // Space was freed; let a blocked writer retry.
        self.state.write_queue.wake_all();
        Ok(count)
    }

    fn poll(&self, interest: PollMask, registration: &mut PollRegistration<'_>) -> PollMask {
        // Registration strictly before the readiness check: a write
        // between the two still lands a wake on the registered entry.
        registration.register(&self.state.read_queue);
        let mut ready = PollMask::empty();
        if self.state.bytes_buffered() > 0 {
            ready |= PollMask::IN;
        }
        if !self.state.has_writers() {
            ready |= PollMask::HUP;
        }
        ready & (interest | PollMask::ERR | PollMask::HUP)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if self.state.readers.fetch_sub(1, Ordering::SeqCst) == 1 {
            log::trace!("[pipe] last reader closed");
            self.state.write_queue.wake_all();
        }
    }
}

impl FileOps for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.state.has_readers() {
            return Err(TaskError::BrokenPipe);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut buffer = self.state.buffer.lock();
        let space = config::PIPE_CAPACITY - buffer.len();
        if space == 0 {
            return Err(TaskError::WouldBlock);
        }
        let count = buf.len().min(space);
        buffer.extend(buf[..count].iter().copied());
        self.state.len.store(buffer.len(), Ordering::SeqCst);
        drop(buffer);
        self.state.read_queue.wake_all();
        Ok(count)
    }

    fn poll(&self, interest: PollMask, registration: &mut PollRegistration<'_>) -> PollMask {
        registration.register(&self.state.write_queue);
        let mut ready = PollMask::empty();
        if self.state.bytes_buffered() < config::PIPE_CAPACITY {
            ready |= PollMask::OUT;
        }
        if !self.state.has_readers() {
            ready |= PollMask::ERR;
        }
        ready & (interest | PollMask::ERR | PollMask::HUP)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.state.writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            log::trace!("[pipe] last writer closed");
            self.state.read_queue.wake_all();
        }
    }
}

/// Create a connected pipe and return its (read, write) ends.
pub fn pipe() -> (Arc<File>, Arc<File>) {
    let state = PipeState::new();
    let read_end = File::new(PipeReader {
        state: state.clone(),
    });
    let write_end = File::new(PipeWriter { state });
    (read_end, write_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollTable;
    use alloc::sync::Weak;
    use alloc::vec;

    fn poll_once(file: &File, interest: PollMask) -> PollMask {
        let mut table = PollTable::new(Weak::new());
        let ready = file.poll(interest, &mut table.registration());
        table.unregister_all();
        ready
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (read_end, write_end) = pipe();
        assert_eq!(write_end.write(b"hello"), Ok(5));
        let mut buf = [0u8; 16];
        assert_eq!(read_end.read(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_empty_pipe_would_block() {
        let (read_end, _write_end) = pipe();
        let mut buf = [0u8; 4];
        assert_eq!(read_end.read(&mut buf), Err(TaskError::WouldBlock));
    }

    #[test]
    fn test_eof_after_writer_drops() {
        let (read_end, write_end) = pipe();
        write_end.write(b"ab").unwrap();
        drop(write_end);
        let mut buf = [0u8; 4];
        // Buffered data still drains, then end of stream.
        assert_eq!(read_end.read(&mut buf), Ok(2));
        assert_eq!(read_end.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_write_without_readers_is_broken() {
        let (read_end, write_end) = pipe();
        drop(read_end);
        assert_eq!(write_end.write(b"x"), Err(TaskError::BrokenPipe));
    }

    #[test]
    fn test_full_pipe_partial_then_blocks() {
        let (read_end, write_end) = pipe();
        let big = vec![7u8; config::PIPE_CAPACITY + 10];
        assert_eq!(write_end.write(&big), Ok(config::PIPE_CAPACITY));
        assert_eq!(write_end.write(b"x"), Err(TaskError::WouldBlock));

        let mut buf = [0u8; 10];
        assert_eq!(read_end.read(&mut buf), Ok(10));
        assert_eq!(write_end.write(b"x"), Ok(1));
    }

    #[test]
    fn test_reader_readiness() {
        let (read_end, write_end) = pipe();
        assert_eq!(poll_once(&read_end, PollMask::IN), PollMask::empty());
        write_end.write(b"z").unwrap();
        assert_eq!(poll_once(&read_end, PollMask::IN), PollMask::IN);
        drop(write_end);
        assert_eq!(
            poll_once(&read_end, PollMask::IN),
            PollMask::IN | PollMask::HUP
        );
    }

    #[test]
    fn test_writer_readiness() {
        let (read_end, write_end) = pipe();
        assert_eq!(poll_once(&write_end, PollMask::OUT), PollMask::OUT);
        let big = vec![0u8; config::PIPE_CAPACITY];
        write_end.write(&big).unwrap();
        assert_eq!(poll_once(&write_end, PollMask::OUT), PollMask::empty());
        drop(read_end);
        assert_eq!(
            poll_once(&write_end, PollMask::OUT),
            PollMask::OUT | PollMask::ERR
        );
    }

    #[test]
    fn test_hup_reported_even_when_not_requested() {
        let (read_end, write_end) = pipe();
        drop(write_end);
        assert_eq!(poll_once(&read_end, PollMask::empty()), PollMask::HUP);
    }

    #[test]
    fn test_write_wakes_registered_reader() {
        let (read_end, write_end) = pipe();
        let mut table = PollTable::new(Weak::new());
        read_end.poll(PollMask::IN, &mut table.registration());
        write_end.write(b"!").unwrap();
        assert!(table.has_event());
        table.unregister_all();
    }
}
