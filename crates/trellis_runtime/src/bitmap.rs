//! Node readiness bitmap.
//!
//! Slots `0..inputs` track input ports, the following slots track async
//! pipes. A slot's bit is set when its source can make progress. The
//! required mask selects which bits gate scheduling: input slots normally,
//! pipe slots while the node is suspended.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// Atomic readiness bitset of one node
#[derive(Debug)]
pub struct ReadyBitMap {
    bits: Vec<AtomicU64>,
    required: Vec<AtomicU64>,
    input_mask: Vec<u64>,
    pipe_mask: Vec<u64>,
    inputs: usize,
    pipes: usize,
}

/// Point-in-time copy of a bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSnapshot {
    /// Set bits
    pub bits: Vec<u64>,
    /// Required bits
    pub required: Vec<u64>,
}

impl BitSnapshot {
    /// Whether every required bit is set
    #[must_use]
    pub fn is_active(&self) -> bool {
        is_active(&self.bits, &self.required)
    }
}

/// Activation rule: all required bits are set
#[must_use]
pub fn is_active(bits: &[u64], required: &[u64]) -> bool {
    required
        .iter()
        .enumerate()
        .all(|(i, req)| bits.get(i).copied().unwrap_or(0) & req == *req)
}

fn mask(range: std::ops::Range<usize>, words: usize) -> Vec<u64> {
    let mut out = vec![0u64; words];
    for slot in range {
        out[slot / WORD_BITS] |= 1 << (slot % WORD_BITS);
    }
    out
}

impl ReadyBitMap {
    /// Create a bitmap for `inputs` input ports and `pipes` async pipes
    #[must_use]
    pub fn new(inputs: usize, pipes: usize) -> Self {
        let slots = inputs + pipes;
        let words = slots.div_ceil(WORD_BITS).max(1);
        let input_mask = mask(0..inputs, words);
        let pipe_mask = mask(inputs..slots, words);
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            required: input_mask.iter().map(|w| AtomicU64::new(*w)).collect(),
            input_mask,
            pipe_mask,
            inputs,
            pipes,
        }
    }

    /// Number of input slots
    #[must_use]
    pub const fn inputs(&self) -> usize {
        self.inputs
    }

    /// Number of pipe slots
    #[must_use]
    pub const fn pipes(&self) -> usize {
        self.pipes
    }

    /// Set or clear a slot
    pub fn assign(&self, slot: usize, value: bool) {
        let Some(word) = self.bits.get(slot / WORD_BITS) else {
            return;
        };
        let bit = 1u64 << (slot % WORD_BITS);
        if value {
            word.fetch_or(bit, Ordering::SeqCst);
        } else {
            word.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    /// Set a slot
    pub fn set(&self, slot: usize) {
        self.assign(slot, true);
    }

    /// Clear a slot
    pub fn clear(&self, slot: usize) {
        self.assign(slot, false);
    }

    /// Whether a slot is set
    #[must_use]
    pub fn is_set(&self, slot: usize) -> bool {
        self.bits
            .get(slot / WORD_BITS)
            .is_some_and(|w| w.load(Ordering::SeqCst) & (1 << (slot % WORD_BITS)) != 0)
    }

    /// Gate scheduling on the pipe slots (node suspended)
    pub fn arm_pipes(&self) {
        for (word, value) in self.required.iter().zip(&self.pipe_mask) {
            word.store(*value, Ordering::SeqCst);
        }
    }

    /// Gate scheduling on the input slots again
    pub fn disarm_pipes(&self) {
        for (word, value) in self.required.iter().zip(&self.input_mask) {
            word.store(*value, Ordering::SeqCst);
        }
    }

    /// Whether pipe slots currently gate scheduling
    #[must_use]
    pub fn pipes_armed(&self) -> bool {
        self.pipes > 0
            && self
                .required
                .iter()
                .zip(&self.pipe_mask)
                .all(|(w, m)| w.load(Ordering::SeqCst) == *m)
    }

    /// Copy the current state
    #[must_use]
    pub fn snapshot(&self) -> BitSnapshot {
        BitSnapshot {
            bits: self.bits.iter().map(|w| w.load(Ordering::SeqCst)).collect(),
            required: self.required.iter().map(|w| w.load(Ordering::SeqCst)).collect(),
        }
    }

    /// Whether the node may be scheduled now
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.snapshot().is_active()
    }
}
