//! Descriptor-table fuzzing: byte-scripted claim, assign, install, dup,
//! dup2, get, and close runs against the real table and a trivial
//! slot-state model in lockstep.
//!
//! The script respects the owner-serialization contract: assign and
//! release only ever touch slots the script itself claimed, so the
//! table's misuse panics are unreachable by construction.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use solum_task::config;
use solum_task::error::TaskError;
use solum_task::file::{File, FileOps};
use solum_task::task::fd::FdTable;

use crate::{FuzzResult, FuzzTarget};

struct NullFile;
impl FileOps for NullFile {}

fn open_file() -> Arc<File> {
    File::new(NullFile)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Claimed,
    Open,
}

pub struct DescriptorTarget {
    table: FdTable,
    model: [Slot; config::MAX_OPEN_FILES],
}

impl DescriptorTarget {
    pub fn new() -> DescriptorTarget {
        DescriptorTarget {
            table: FdTable::new(),
            model: [Slot::Free; config::MAX_OPEN_FILES],
        }
    }

    fn lowest_free(&self) -> Option<usize> {
        self.model.iter().position(|slot| *slot == Slot::Free)
    }

    fn lowest_claimed(&self) -> Option<usize> {
        self.model.iter().position(|slot| *slot == Slot::Claimed)
    }

    fn is_open(&self, fd: usize) -> bool {
        fd < config::MAX_OPEN_FILES && self.model[fd] == Slot::Open
    }

    fn open_count(&self) -> usize {
        self.model.iter().filter(|slot| **slot == Slot::Open).count()
    }

    fn op_install(&mut self) -> Option<String> {
        match (self.table.install(open_file()), self.lowest_free()) {
            (Ok(fd), Some(want)) if fd == want => {
                self.model[fd] = Slot::Open;
                None
            }
            (Ok(fd), want) => Some(format!("install chose slot {}, model wanted {:?}", fd, want)),
            (Err(TaskError::NoFreeHandle), None) => None,
            (Err(err), want) => Some(format!("install failed with {} against model {:?}", err, want)),
        }
    }

    fn op_claim(&mut self) -> Option<String> {
        match (self.table.claim(), self.lowest_free()) {
            (Ok(fd), Some(want)) if fd == want => {
                self.model[fd] = Slot::Claimed;
                None
            }
            (Ok(fd), want) => Some(format!("claim chose slot {}, model wanted {:?}", fd, want)),
            (Err(TaskError::NoFreeHandle), None) => None,
            (Err(err), want) => Some(format!("claim failed with {} against model {:?}", err, want)),
        }
    }

    /// Resolve the oldest outstanding claim, alternating between assign
    /// and release on the selector byte.
    fn op_resolve(&mut self, selector: u8) -> Option<String> {
        let fd = self.lowest_claimed()?;
        if selector & 1 == 0 {
            self.table.assign(fd, open_file());
            self.model[fd] = Slot::Open;
        } else {
            self.table.release_claim(fd);
            self.model[fd] = Slot::Free;
        }
        None
    }

    fn op_close(&mut self, fd: usize) -> Option<String> {
        let expected_ok = self.is_open(fd);
        match (self.table.close(fd), expected_ok) {
            (Ok(()), true) => {
                self.model[fd] = Slot::Free;
                None
            }
            (Err(TaskError::BadHandle), false) => None,
            (result, _) => Some(format!("close({}) returned {:?}", fd, result)),
        }
    }

    fn op_get(&mut self, fd: usize) -> Option<String> {
        match (self.table.get(fd), self.is_open(fd)) {
            (Ok(_), true) => None,
            (Err(TaskError::BadHandle), false) => None,
            (result, open) => Some(format!("get({}) returned {:?}, model open={}", fd, result.map(|_| ()), open)),
        }
    }

    fn op_dup(&mut self, fd: usize) -> Option<String> {
        let expected = if !self.is_open(fd) {
            Err(TaskError::BadHandle)
        } else {
            match self.lowest_free() {
                Some(want) => Ok(want),
                None => Err(TaskError::NoFreeHandle),
            }
        };
        match (self.table.dup(fd), expected) {
            (Ok(new), Ok(want)) if new == want => {
                self.model[new] = Slot::Open;
                None
            }
            (Err(got), Err(want)) if got == want => None,
            (result, expected) => {
                Some(format!("dup({}) returned {:?}, expected {:?}", fd, result, expected))
            }
        }
    }

    fn op_dup2(&mut self, oldfd: usize, newfd: usize) -> Option<String> {
        let expected = if newfd >= config::MAX_OPEN_FILES || !self.is_open(oldfd) {
            Err(TaskError::BadHandle)
        } else if self.model[newfd] == Slot::Claimed {
            Err(TaskError::BadHandle)
        } else {
            Ok(newfd)
        };
        match (self.table.dup2(oldfd, newfd), expected) {
            (Ok(new), Ok(want)) if new == want => {
                self.model[new] = Slot::Open;
                None
            }
            (Err(got), Err(want)) if got == want => None,
            (result, expected) => Some(format!(
                "dup2({}, {}) returned {:?}, expected {:?}",
                oldfd, newfd, result, expected
            )),
        }
    }
}

impl Default for DescriptorTarget {
    fn default() -> DescriptorTarget {
        DescriptorTarget::new()
    }
}

impl FuzzTarget for DescriptorTarget {
    fn name(&self) -> &str {
        "descriptor_table"
    }

    fn fuzz(&mut self, input: &[u8]) -> FuzzResult {
        // Slot bytes range a little past the table so out-of-range
        // descriptors get probed too.
        let slot_span = config::MAX_OPEN_FILES + 4;
        let mut bytes = input.iter().copied();

        while let Some(op) = bytes.next() {
            let divergence = match op % 7 {
                0 => self.op_install(),
                1 => self.op_claim(),
                2 => match bytes.next() {
                    Some(selector) => self.op_resolve(selector),
                    None => break,
                },
                3 => match bytes.next() {
                    Some(fd) => self.op_close(fd as usize % slot_span),
                    None => break,
                },
                4 => match bytes.next() {
                    Some(fd) => self.op_get(fd as usize % slot_span),
                    None => break,
                },
                5 => match bytes.next() {
                    Some(fd) => self.op_dup(fd as usize % slot_span),
                    None => break,
                },
                _ => match (bytes.next(), bytes.next()) {
                    (Some(old), Some(new)) => {
                        self.op_dup2(old as usize % slot_span, new as usize % slot_span)
                    }
                    _ => break,
                },
            };
            if let Some(message) = divergence {
                return FuzzResult::Violation(message);
            }
        }

        if self.table.count_open() != self.open_count() {
            return FuzzResult::Violation(format!(
                "table reports {} open slots, model has {}",
                self.table.count_open(),
                self.open_count()
            ));
        }
        FuzzResult::Ok
    }

    fn reset(&mut self) {
        self.table = FdTable::new();
        self.model = [Slot::Free; config::MAX_OPEN_FILES];
    }
}
