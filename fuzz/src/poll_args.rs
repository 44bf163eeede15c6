//! Poll argument validation fuzzing: byte-scripted descriptor lists and
//! timeouts against the argument checks at the front of `poll`.
//!
//! Only argument sets the model says are invalid are actually called;
//! those fail before the current-task lookup, so the target needs no
//! task context.  Scripts whose every call would dispatch are reported
//! as rejected rather than silently passed.

use alloc::format;
use alloc::vec::Vec;

use solum_task::config;
use solum_task::error::TaskError;
use solum_task::poll::{self, PollFd, PollMask};

use crate::{FuzzResult, FuzzTarget};

/// The rejection `poll` must produce for these arguments, `None` when
/// they would reach the readiness loop.
fn expected_rejection(len: usize, timeout: i64) -> Option<&'static str> {
    if len > config::MAX_POLL_FDS {
        Some("too many poll entries")
    } else if len == 0 && timeout < 0 {
        Some("nothing to wait for")
    } else {
        None
    }
}

pub struct PollArgsTarget;

impl PollArgsTarget {
    pub fn new() -> PollArgsTarget {
        PollArgsTarget
    }
}

impl FuzzTarget for PollArgsTarget {
    fn name(&self) -> &str {
        "poll_args"
    }

    /// Script: repeating 5-byte records of little-endian length, a
    /// timeout selector, and two descriptor seed bytes.
    fn fuzz(&mut self, input: &[u8]) -> FuzzResult {
        // Lengths span both sides of the limit.
        let len_span = 2 * config::MAX_POLL_FDS + 1;
        let mut checked = 0u32;
        let mut bytes = input.iter().copied();
        loop {
            let (Some(len_lo), Some(len_hi), Some(timeout_sel), Some(seed_a), Some(seed_b)) = (
                bytes.next(),
                bytes.next(),
                bytes.next(),
                bytes.next(),
                bytes.next(),
            ) else {
                break;
            };
            let len = u16::from_le_bytes([len_lo, len_hi]) as usize % len_span;
            let timeout = match timeout_sel % 5 {
                0 => -1,
                1 => 0,
                2 => 1,
                3 => i64::MAX,
                _ => -7_000,
            };
            let Some(want) = expected_rejection(len, timeout) else {
                // Dispatchable arguments need a current task; skip.
                continue;
            };

            let mut fds: Vec<PollFd> = Vec::with_capacity(len);
            for i in 0..len {
                let seed = if i % 2 == 0 { seed_a } else { seed_b };
                let interest = if seed & 1 == 0 {
                    PollMask::IN
                } else {
                    PollMask::OUT
                };
                // Offset below zero so negative descriptors appear too.
                fds.push(PollFd::new(seed as i32 - 4, interest));
            }

            match poll::poll(&mut fds, timeout) {
                Err(TaskError::InvalidArgument(msg)) if msg == want => {}
                other => {
                    return FuzzResult::Violation(format!(
                        "poll({} entries, timeout {}) returned {:?}, wanted rejection {:?}",
                        len, timeout, other, want
                    ));
                }
            }
            // Rejection must happen before any entry is touched.
            if fds.iter().any(|entry| !entry.revents.is_empty()) {
                return FuzzResult::Violation(format!(
                    "poll({} entries, timeout {}) set revents while rejecting",
                    len, timeout
                ));
            }
            checked += 1;
        }
        if checked == 0 {
            return FuzzResult::Rejected(format!(
                "no rejectable argument set in {} bytes",
                input.len()
            ));
        }
        FuzzResult::Ok
    }

    fn reset(&mut self) {}
}
