//! Scrubbing for buffers that held key material or fresh signatures.
//!
//! Freed secret buffers are overwritten with the alternating `A5 5A` pattern
//! rather than zeros so a stray use-after-scrub shows up as an obviously
//! bogus value in a core dump instead of a plausible empty one.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{compiler_fence, Ordering};

const POISON: [u8; 2] = [0xA5, 0x5A];

/// An owned byte buffer that poisons itself on drop.
#[derive(Debug, Default)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }

    /// Overwrite the contents with the poison pattern.
    fn scrub(&mut self) {
        for (i, byte) in self.0.iter_mut().enumerate() {
            // volatile so the scrub survives dead-store elimination
            unsafe { core::ptr::write_volatile(byte, POISON[i % 2]) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for SecretBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.scrub();
    }
}
