//! Per-task signal state.
//!
//! Only the bookkeeping lives here: pending and blocked bitmasks, with
//! send/dequeue primitives.  Delivery policy (handlers, dispositions,
//! user-space trampolines) belongs to the embedding kernel, which
//! consumes this module through the "has pending signal" predicate.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TaskError};

// ─── Signal numbers (Linux x86_64) ──────────────────────────────────

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQUIT: u8 = 3;
pub const SIGKILL: u8 = 9;
pub const SIGUSR1: u8 = 10;
pub const SIGUSR2: u8 = 12;
pub const SIGPIPE: u8 = 13;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGSTOP: u8 = 19;

/// Maximum signal number we handle.
pub const NSIG: u8 = 64;

/// Signals that can never be masked out.
const UNBLOCKABLE: u64 = (1 << SIGKILL) | (1 << SIGSTOP);

/// Per-task signal state (bit N = signal N).
#[derive(Debug)]
pub struct SignalState {
    /// Bitmask of pending signals.
    pending: AtomicU64,
    /// Bitmask of blocked signals.
    blocked: AtomicU64,
}

impl SignalState {
    pub const fn new() -> SignalState {
        SignalState {
            pending: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Queue a signal for delivery.
    pub fn send(&self, signum: u8) -> Result<()> {
        if signum == 0 || signum >= NSIG {
            return Err(TaskError::InvalidArgument("signal number out of range"));
        }
        self.pending.fetch_or(1u64 << signum, Ordering::SeqCst);
        Ok(())
    }

    /// Whether a signal is pending and not blocked.
    pub fn has_pending(&self) -> bool {
        self.deliverable() != 0
    }

    /// Take the next deliverable signal (lowest numbered), clearing it
    /// from the pending set.
    pub fn dequeue(&self) -> Option<u8> {
        loop {
            let deliverable = self.deliverable();
            if deliverable == 0 {
                return None;
            }
            let signum = deliverable.trailing_zeros() as u8;
            let bit = 1u64 << signum;
            let prev = self.pending.fetch_and(!bit, Ordering::SeqCst);
            if prev & bit != 0 {
                return Some(signum);
            }
            // Lost the bit to a concurrent dequeue; look again.
        }
    }

    /// Add signals to the blocked mask.  SIGKILL and SIGSTOP stay
    /// unblockable.
    pub fn block(&self, mask: u64) {
        self.blocked.fetch_or(mask & !UNBLOCKABLE, Ordering::SeqCst);
    }

    /// Remove signals from the blocked mask.
    pub fn unblock(&self, mask: u64) {
        self.blocked.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Current blocked mask.
    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::SeqCst)
    }

    fn deliverable(&self) -> u64 {
        self.pending.load(Ordering::SeqCst) & !self.blocked.load(Ordering::SeqCst)
    }
}

impl Default for SignalState {
    fn default() -> SignalState {
        SignalState::new()
    }
}

/// Bit for a signal number, for building block masks.
pub const fn sigmask(signum: u8) -> u64 {
    1u64 << signum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_dequeue_lowest_first() {
        let state = SignalState::new();
        state.send(SIGTERM).unwrap();
        state.send(SIGINT).unwrap();
        assert!(state.has_pending());
        assert_eq!(state.dequeue(), Some(SIGINT));
        assert_eq!(state.dequeue(), Some(SIGTERM));
        assert_eq!(state.dequeue(), None);
        assert!(!state.has_pending());
    }

    #[test]
    fn test_blocked_signal_not_deliverable() {
        let state = SignalState::new();
        state.block(sigmask(SIGUSR1));
        state.send(SIGUSR1).unwrap();
        assert!(!state.has_pending());
        assert_eq!(state.dequeue(), None);
        state.unblock(sigmask(SIGUSR1));
        assert!(state.has_pending());
        assert_eq!(state.dequeue(), Some(SIGUSR1));
    }

    #[test]
    fn test_sigkill_cannot_be_blocked() {
        let state = SignalState::new();
        state.block(u64::MAX);
        state.send(SIGKILL).unwrap();
        assert!(state.has_pending());
    }

    #[test]
    fn test_invalid_signum_rejected() {
        let state = SignalState::new();
        assert!(state.send(0).is_err());
        assert!(state.send(NSIG).is_err());
        assert!(state.send(NSIG + 1).is_err());
    }
}
