//! Sliding-window replay protection for session nonces
//!
//! Nonces may arrive out of order within the window. Anything at or below
//! `highest - REPLAY_WINDOW_SIZE` is rejected, as is any nonce already
//! accepted. `check` is side-effect free so a forged packet cannot move the
//! window; callers `accept` only after the AEAD tag verifies.

/// Number of nonces tracked behind the highest accepted one
pub const REPLAY_WINDOW_SIZE: u64 = 2048;

const WORDS: usize = (REPLAY_WINDOW_SIZE / 64) as usize;

/// Replay window over 64-bit nonces
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    bitmap: [u64; WORDS],
    highest: u64,
    initialized: bool,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            highest: 0,
            initialized: false,
        }
    }

    /// Whether `nonce` would be accepted.
    pub fn check(&self, nonce: u64) -> bool {
        if !self.initialized || nonce > self.highest {
            return true;
        }
        if self.highest - nonce >= REPLAY_WINDOW_SIZE {
            return false;
        }
        !self.is_set(nonce)
    }

    /// Record `nonce` as received.
    pub fn accept(&mut self, nonce: u64) {
        if !self.initialized {
            self.initialized = true;
            self.highest = nonce;
            self.set(nonce);
            return;
        }

        if nonce > self.highest {
            let advance = nonce - self.highest;
            if advance >= REPLAY_WINDOW_SIZE {
                self.bitmap = [0; WORDS];
            } else {
                for n in self.highest + 1..nonce {
                    self.clear(n);
                }
            }
            self.highest = nonce;
        }
        self.set(nonce);
    }

    /// Highest nonce accepted so far
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Forget everything, for a rekeyed session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn slot(nonce: u64) -> (usize, u64) {
        let bit = nonce % REPLAY_WINDOW_SIZE;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn is_set(&self, nonce: u64) -> bool {
        let (word, mask) = Self::slot(nonce);
        self.bitmap[word] & mask != 0
    }

    fn set(&mut self, nonce: u64) {
        let (word, mask) = Self::slot(nonce);
        self.bitmap[word] |= mask;
    }

    fn clear(&mut self, nonce: u64) {
        let (word, mask) = Self::slot(nonce);
        self.bitmap[word] &= !mask;
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
