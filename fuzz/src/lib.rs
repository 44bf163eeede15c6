//! Solum Fuzzing Harnesses
//!
//! Differential fuzzing for the task subsystem's state machines.  Each
//! target interprets the input bytes as a script of operations, runs
//! them against the real implementation and a naive model side by side,
//! and reports any divergence.  Only non-blocking paths are driven, so
//! targets need no scheduler and no current task.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod descriptor;
pub mod pipe_stream;
pub mod poll_args;
pub mod signal_state;

use alloc::string::String;
use alloc::vec::Vec;

/// Fuzzing target trait
pub trait FuzzTarget {
    /// Name of the fuzz target
    fn name(&self) -> &str;

    /// Run one fuzzing iteration with input
    fn fuzz(&mut self, input: &[u8]) -> FuzzResult;

    /// Reset state between iterations
    fn reset(&mut self);
}

/// Result of a fuzz iteration
#[derive(Debug, Clone)]
pub enum FuzzResult {
    /// Input processed, implementation and model agree
    Ok,
    /// Input rejected up front (malformed script)
    Rejected(String),
    /// Implementation diverged from the model
    Violation(String),
}

impl FuzzResult {
    pub fn is_violation(&self) -> bool {
        matches!(self, FuzzResult::Violation(_))
    }
}

/// Deterministic input mutator
pub struct Mutator {
    seed: u64,
}

impl Mutator {
    pub fn new(seed: u64) -> Mutator {
        Mutator { seed }
    }

    fn random(&mut self) -> u64 {
        self.seed = self.seed.wrapping_mul(1103515245).wrapping_add(12345);
        self.seed
    }

    /// Apply one random mutation to `input`.
    pub fn mutate(&mut self, input: &mut Vec<u8>) {
        match self.random() % 8 {
            0 => self.bit_flip(input),
            1 => self.byte_flip(input),
            2 => self.byte_insert(input),
            3 => self.byte_delete(input),
            4 => self.byte_replace(input),
            5 => self.interesting_value(input),
            6 => self.havoc(input),
            _ => self.append_random(input),
        }
    }

    fn bit_flip(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let pos = (self.random() as usize) % input.len();
        let bit = (self.random() % 8) as u8;
        input[pos] ^= 1 << bit;
    }

    fn byte_flip(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let pos = (self.random() as usize) % input.len();
        input[pos] ^= 0xFF;
    }

    fn byte_insert(&mut self, input: &mut Vec<u8>) {
        let pos = if input.is_empty() {
            0
        } else {
            (self.random() as usize) % input.len()
        };
        input.insert(pos, (self.random() & 0xFF) as u8);
    }

    fn byte_delete(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let pos = (self.random() as usize) % input.len();
        input.remove(pos);
    }

    fn byte_replace(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let pos = (self.random() as usize) % input.len();
        input[pos] = (self.random() & 0xFF) as u8;
    }

    fn interesting_value(&mut self, input: &mut Vec<u8>) {
        const INTERESTING: &[u8] = &[0, 1, 19, 20, 0x7F, 0x80, 0xFF];
        if input.is_empty() {
            return;
        }
        let pos = (self.random() as usize) % input.len();
        input[pos] = INTERESTING[(self.random() as usize) % INTERESTING.len()];
    }

    fn havoc(&mut self, input: &mut Vec<u8>) {
        let rounds = (self.random() % 16) + 1;
        for _ in 0..rounds {
            match self.random() % 5 {
                0 => self.bit_flip(input),
                1 => self.byte_flip(input),
                2 => self.byte_insert(input),
                3 => self.byte_delete(input),
                _ => self.byte_replace(input),
            }
        }
    }

    fn append_random(&mut self, input: &mut Vec<u8>) {
        let count = ((self.random() % 8) + 1) as usize;
        for _ in 0..count {
            input.push((self.random() & 0xFF) as u8);
        }
    }
}

/// Counters for one fuzzing run
#[derive(Debug, Clone, Default)]
pub struct FuzzStats {
    pub iterations: u64,
    pub rejected: u64,
    pub violations: u64,
}

/// Outcome of a fuzzing run
#[derive(Debug)]
pub struct FuzzReport {
    pub stats: FuzzStats,
    /// First diverging input and the divergence message, if any.
    pub first_violation: Option<(Vec<u8>, String)>,
}

impl FuzzReport {
    pub fn clean(&self) -> bool {
        self.first_violation.is_none()
    }
}

/// Mutate outward from `seeds` and drive `target` for `iterations`
/// rounds.
pub fn run_target(
    target: &mut dyn FuzzTarget,
    seeds: &[&[u8]],
    iterations: u64,
    seed: u64,
) -> FuzzReport {
    let mut mutator = Mutator::new(seed);
    let mut stats = FuzzStats::default();
    let mut first_violation = None;

    let mut corpus: Vec<Vec<u8>> = seeds.iter().map(|s| s.to_vec()).collect();
    if corpus.is_empty() {
        corpus.push(Vec::new());
    }

    for round in 0..iterations {
        let mut input = corpus[(round as usize) % corpus.len()].clone();
        mutator.mutate(&mut input);
        if input.len() > 4096 {
            input.truncate(4096);
        }

        target.reset();
        stats.iterations += 1;
        match target.fuzz(&input) {
            FuzzResult::Ok => {}
            FuzzResult::Rejected(_) => stats.rejected += 1,
            FuzzResult::Violation(message) => {
                stats.violations += 1;
                if first_violation.is_none() {
                    first_violation = Some((input.clone(), message));
                }
            }
        }

        // Inputs that made it through whole become new bases.
        if corpus.len() < 64 {
            corpus.push(input);
        }
    }

    FuzzReport {
        stats,
        first_violation,
    }
}
