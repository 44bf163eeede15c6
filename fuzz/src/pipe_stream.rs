//! Pipe fuzzing: scripted reads, writes, and end drops checked against
//! a counter model.
//!
//! Written bytes are consecutive wrapping counter values, so ordering
//! and integrity fall out of comparing every read byte against the next
//! expected counter, without keeping a shadow buffer.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use solum_task::config;
use solum_task::error::TaskError;
use solum_task::file::File;
use solum_task::pipe::pipe;

use crate::{FuzzResult, FuzzTarget};

pub struct PipeStreamTarget {
    read_end: Option<Arc<File>>,
    write_end: Option<Arc<File>>,
    buffered: usize,
    next_write: u8,
    next_read: u8,
}

impl PipeStreamTarget {
    pub fn new() -> PipeStreamTarget {
        let (read_end, write_end) = pipe();
        PipeStreamTarget {
            read_end: Some(read_end),
            write_end: Some(write_end),
            buffered: 0,
            next_write: 0,
            next_read: 0,
        }
    }

    fn op_write(&mut self, n: usize) -> Option<String> {
        let Some(end) = self.write_end.as_ref() else {
            return None;
        };
        let mut buf = vec![0u8; n];
        let mut value = self.next_write;
        for byte in buf.iter_mut() {
            *byte = value;
            value = value.wrapping_add(1);
        }

        let expected = if self.read_end.is_none() {
            Err(TaskError::BrokenPipe)
        } else if n == 0 {
            Ok(0)
        } else if self.buffered == config::PIPE_CAPACITY {
            Err(TaskError::WouldBlock)
        } else {
            Ok(n.min(config::PIPE_CAPACITY - self.buffered))
        };

        match (end.write(&buf), expected) {
            (Ok(count), Ok(want)) if count == want => {
                self.buffered += count;
                self.next_write = self.next_write.wrapping_add(count as u8);
                None
            }
            (Err(got), Err(want)) if got == want => None,
            (result, expected) => Some(format!(
                "write of {} with {} buffered returned {:?}, expected {:?}",
                n, self.buffered, result, expected
            )),
        }
    }

    fn op_read(&mut self, n: usize) -> Option<String> {
        let Some(end) = self.read_end.as_ref() else {
            return None;
        };
        let mut buf = vec![0u8; n];

        let expected = if n == 0 {
            Ok(0)
        } else if self.buffered == 0 {
            if self.write_end.is_none() {
                Ok(0)
            } else {
                Err(TaskError::WouldBlock)
            }
        } else {
            Ok(n.min(self.buffered))
        };

        match (end.read(&mut buf), expected) {
            (Ok(count), Ok(want)) if count == want => {
                for (i, byte) in buf[..count].iter().enumerate() {
                    let want = self.next_read.wrapping_add(i as u8);
                    if *byte != want {
                        return Some(format!(
                            "byte {} of a {}-byte read was {:#04x}, expected {:#04x}",
                            i, count, byte, want
                        ));
                    }
                }
                self.buffered -= count;
                self.next_read = self.next_read.wrapping_add(count as u8);
                None
            }
            (Err(got), Err(want)) if got == want => None,
            (result, expected) => Some(format!(
                "read of {} with {} buffered returned {:?}, expected {:?}",
                n, self.buffered, result, expected
            )),
        }
    }

    fn op_recreate(&mut self) {
        let (read_end, write_end) = pipe();
        self.read_end = Some(read_end);
        self.write_end = Some(write_end);
        self.buffered = 0;
        self.next_write = 0;
        self.next_read = 0;
    }
}

impl Default for PipeStreamTarget {
    fn default() -> PipeStreamTarget {
        PipeStreamTarget::new()
    }
}

impl FuzzTarget for PipeStreamTarget {
    fn name(&self) -> &str {
        "pipe_stream"
    }

    fn fuzz(&mut self, input: &[u8]) -> FuzzResult {
        // Length bytes are scaled so a handful of writes can run the
        // buffer past capacity.
        let mut bytes = input.iter().copied();
        while let Some(op) = bytes.next() {
            let divergence = match op % 5 {
                0 => match bytes.next() {
                    Some(len) => self.op_write(len as usize * 37),
                    None => break,
                },
                1 => match bytes.next() {
                    Some(len) => self.op_read(len as usize * 37),
                    None => break,
                },
                2 => {
                    self.write_end = None;
                    None
                }
                3 => {
                    self.read_end = None;
                    None
                }
                _ => {
                    self.op_recreate();
                    None
                }
            };
            if let Some(message) = divergence {
                return FuzzResult::Violation(message);
            }
        }
        FuzzResult::Ok
    }

    fn reset(&mut self) {
        self.op_recreate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_target;

    #[test]
    fn test_write_close_drain_script_agrees() {
        let mut target = PipeStreamTarget::new();
        // Write 37 bytes, drop the writer, drain, then hit end of
        // stream twice.
        let script = [0u8, 1, 2, 1, 1, 1, 1, 1, 1];
        assert!(!target.fuzz(&script).is_violation());
    }

    #[test]
    fn test_fuzz_smoke() {
        let mut target = PipeStreamTarget::new();
        let seeds: [&[u8]; 3] = [&[0, 4, 1, 2, 1, 8], &[3, 0, 2, 4, 0, 1], &[0, 255, 0, 255, 1, 255]];
        let report = run_target(&mut target, &seeds, 512, 0x9175e);
        assert!(
            report.clean(),
            "divergence found: {:?}",
            report.first_violation
        );
    }
}
