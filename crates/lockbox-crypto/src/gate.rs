//! In-memory tamper-evidence gate
//!
//! Three buffers live for the lifetime of the gate:
//! - `key`: random bytes drawn at construction
//! - `flags`: derived from `key` by a fixed byte relation
//! - `padding`: random filler re-randomized on every check
//!
//! [`IntegrityGate::validate`] recomputes the relation at a few sampled
//! positions. A mismatch means the process memory was altered after
//! construction. This is tamper-evidence only; AEAD tags and the whole-file
//! digest still carry all functional guarantees.

use std::sync::Mutex;

use rand::{Rng, RngCore};
use subtle::ConstantTimeEq;
use tracing::error;
use zeroize::Zeroize;

use lockbox_core::{VaultError, VaultResult};

/// Size of the key and flags buffers
pub const GATE_SIZE: usize = 64;

/// Positions always sampled by `validate`
const FIXED_SAMPLES: [usize; 2] = [0, 15];
const RANDOM_SAMPLES: usize = 2;

pub struct IntegrityGate {
    key: Box<[u8; GATE_SIZE]>,
    flags: Box<[u8; GATE_SIZE]>,
    padding: Mutex<Vec<u8>>,
}

#[inline]
fn relation(key: &[u8; GATE_SIZE], i: usize) -> u8 {
    key[i] ^ key[(i + 1) % GATE_SIZE].rotate_left((i % 8) as u32) ^ 0x5C
}

fn padding_size() -> usize {
    let raw = rand::thread_rng().gen_range(64..256usize).next_power_of_two();
    (raw + GATE_SIZE - 1) & !(GATE_SIZE - 1)
}

impl IntegrityGate {
    pub fn new() -> Self {
        let mut key = Box::new([0u8; GATE_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut key[..]);

        let mut flags = Box::new([0u8; GATE_SIZE]);
        for (i, f) in flags.iter_mut().enumerate() {
            *f = relation(&key, i);
        }

        let mut padding = vec![0u8; padding_size()];
        rand::rngs::OsRng.fill_bytes(&mut padding);

        Self {
            key,
            flags,
            padding: Mutex::new(padding),
        }
    }

    /// Build a gate from explicit buffers.
    ///
    /// Buffers that do not satisfy the relation produce a gate whose
    /// `validate` fails.
    pub fn from_parts(key: [u8; GATE_SIZE], flags: [u8; GATE_SIZE]) -> Self {
        let mut padding = vec![0u8; padding_size()];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        Self {
            key: Box::new(key),
            flags: Box::new(flags),
            padding: Mutex::new(padding),
        }
    }

    /// Re-randomize the padding buffer.
    pub fn scramble_padding(&self) {
        let mut padding = self.padding.lock().unwrap_or_else(|e| e.into_inner());
        let mut entropy = vec![0u8; padding.len()];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        for (p, e) in padding.iter_mut().zip(entropy.iter()) {
            *p ^= *e;
        }
        entropy.zeroize();
    }

    /// Check the key/flags relation at sampled positions in constant time.
    pub fn validate(&self) -> bool {
        let mut rng = rand::thread_rng();
        let mut positions = [0usize; FIXED_SAMPLES.len() + RANDOM_SAMPLES];
        positions[..FIXED_SAMPLES.len()].copy_from_slice(&FIXED_SAMPLES);
        for p in positions.iter_mut().skip(FIXED_SAMPLES.len()) {
            *p = rng.gen_range(0..GATE_SIZE);
        }

        let mut actual = [0u8; FIXED_SAMPLES.len() + RANDOM_SAMPLES];
        let mut expected = [0u8; FIXED_SAMPLES.len() + RANDOM_SAMPLES];
        for (slot, &pos) in positions.iter().enumerate() {
            actual[slot] = self.flags[pos];
            expected[slot] = relation(&self.key, pos);
        }

        self.scramble_padding();

        let ok = bool::from(actual[..].ct_eq(&expected[..]));
        actual.zeroize();
        expected.zeroize();
        ok
    }

    /// `validate`, mapped to `TamperDetected` on failure.
    pub fn ensure(&self) -> VaultResult<()> {
        if self.validate() {
            Ok(())
        } else {
            error!("integrity gate validation failed; aborting before sensitive work");
            Err(VaultError::TamperDetected)
        }
    }
}

impl Default for IntegrityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntegrityGate {
    fn drop(&mut self) {
        (*self.key).zeroize();
        (*self.flags).zeroize();
    }
}

impl std::fmt::Debug for IntegrityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_gate_validates() {
        let gate = IntegrityGate::new();
        for _ in 0..100 {
            assert!(gate.validate());
        }
        assert!(gate.ensure().is_ok());
    }

    #[test]
    fn test_tampered_flags_detected() {
        let key = [0x33u8; GATE_SIZE];
        let mut flags = [0u8; GATE_SIZE];
        for (i, f) in flags.iter_mut().enumerate() {
            *f = relation(&key, i);
        }
        assert!(IntegrityGate::from_parts(key, flags).validate());

        flags[0] ^= 0x80;
        let gate = IntegrityGate::from_parts(key, flags);
        assert!(!gate.validate());
        assert!(matches!(gate.ensure(), Err(VaultError::TamperDetected)));
    }

    #[test]
    fn test_padding_size_is_aligned() {
        for _ in 0..50 {
            let size = padding_size();
            assert!(size >= 64 && size <= 256);
            assert_eq!(size % GATE_SIZE, 0);
        }
    }

    #[test]
    fn test_scramble_changes_padding() {
        let gate = IntegrityGate::new();
        let before = gate.padding.lock().unwrap().clone();
        gate.scramble_padding();
        let after = gate.padding.lock().unwrap().clone();
        assert_eq!(before.len(), after.len());
        assert_ne!(before, after);
    }

    #[test]
    fn test_gate_is_shareable() {
        let gate = std::sync::Arc::new(IntegrityGate::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || (0..100).all(|_| gate.validate()))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
