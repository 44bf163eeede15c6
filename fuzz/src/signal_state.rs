//! Signal bookkeeping fuzzing: sends, mask edits, and dequeues run
//! against a pair of shadow bitmasks.
//!
//! Send bytes are passed through unmasked so out-of-range signal
//! numbers get probed alongside valid ones.

use alloc::format;
use alloc::string::String;

use solum_task::error::TaskError;
use solum_task::signal::{sigmask, SignalState, NSIG, SIGKILL, SIGSTOP};

use crate::{FuzzResult, FuzzTarget};

const UNBLOCKABLE: u64 = sigmask(SIGKILL) | sigmask(SIGSTOP);

pub struct SignalTarget {
    state: SignalState,
    pending: u64,
    blocked: u64,
}

impl SignalTarget {
    pub fn new() -> SignalTarget {
        SignalTarget {
            state: SignalState::new(),
            pending: 0,
            blocked: 0,
        }
    }

    fn op_send(&mut self, signum: u8) -> Option<String> {
        let valid = signum != 0 && signum < NSIG;
        match (self.state.send(signum), valid) {
            (Ok(()), true) => {
                self.pending |= sigmask(signum);
                None
            }
            (Err(TaskError::InvalidArgument(_)), false) => None,
            (result, valid) => Some(format!(
                "send({}) returned {:?}, valid={}",
                signum, result, valid
            )),
        }
    }

    fn op_dequeue(&mut self) -> Option<String> {
        let deliverable = self.pending & !self.blocked;
        let expected = if deliverable == 0 {
            None
        } else {
            Some(deliverable.trailing_zeros() as u8)
        };
        let got = self.state.dequeue();
        if got != expected {
            return Some(format!(
                "dequeue returned {:?}, expected {:?}",
                got, expected
            ));
        }
        if let Some(signum) = got {
            self.pending &= !sigmask(signum);
        }
        None
    }

    fn op_probe(&self) -> Option<String> {
        if self.state.blocked() != self.blocked {
            return Some(format!(
                "blocked mask is {:#x}, model has {:#x}",
                self.state.blocked(),
                self.blocked
            ));
        }
        let expect_pending = self.pending & !self.blocked != 0;
        if self.state.has_pending() != expect_pending {
            return Some(format!(
                "has_pending was {}, model expected {}",
                self.state.has_pending(),
                expect_pending
            ));
        }
        None
    }
}

impl Default for SignalTarget {
    fn default() -> SignalTarget {
        SignalTarget::new()
    }
}

impl FuzzTarget for SignalTarget {
    fn name(&self) -> &str {
        "signal_state"
    }

    fn fuzz(&mut self, input: &[u8]) -> FuzzResult {
        let mut bytes = input.iter().copied();
        while let Some(op) = bytes.next() {
            let divergence = match op % 5 {
                0 => match bytes.next() {
                    Some(signum) => self.op_send(signum),
                    None => break,
                },
                1 => match (bytes.next(), bytes.next()) {
                    (Some(a), Some(b)) => {
                        let mask = sigmask(a % NSIG) | sigmask(b % NSIG);
                        self.state.block(mask);
                        self.blocked |= mask & !UNBLOCKABLE;
                        None
                    }
                    _ => break,
                },
                2 => match (bytes.next(), bytes.next()) {
                    (Some(a), Some(b)) => {
                        let mask = sigmask(a % NSIG) | sigmask(b % NSIG);
                        self.state.unblock(mask);
                        self.blocked &= !mask;
                        None
                    }
                    _ => break,
                },
                3 => self.op_dequeue(),
                _ => self.op_probe(),
            };
            if let Some(message) = divergence {
                return FuzzResult::Violation(message);
            }
        }

        // Drain everything deliverable and confirm ascending order,
        // with one extra pass to see the empty set reported as such.
        loop {
            let empty = self.pending & !self.blocked == 0;
            if let Some(message) = self.op_dequeue() {
                return FuzzResult::Violation(message);
            }
            if empty {
                break;
            }
        }
        FuzzResult::Ok
    }

    fn reset(&mut self) {
        self.state = SignalState::new();
        self.pending = 0;
        self.blocked = 0;
    }
}
