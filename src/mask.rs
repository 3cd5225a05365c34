//! WebSocket frame masking utilities

use std::sync::OnceLock;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Apply the WebSocket payload mask in place (RFC 6455 section 5.3).
///
/// XORs the data with the repeating 4-byte key. Masking is an involution:
/// applying the same key twice restores the original bytes, so this one
/// function serves both masking and unmasking.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    // Widen the key to 8 bytes so the bulk of the payload is XORed a word at
    // a time; 8 is a multiple of 4, so the key phase survives each chunk.
    let key_word = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ key_word;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// The process-wide CSPRNG, seeded once from the operating system.
static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

/// Fill `buf` from the process-wide CSPRNG.
pub(crate) fn random_bytes(buf: &mut [u8]) {
    let rng = RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()));
    rng.lock().fill_bytes(buf);
}

/// Generate a fresh 4-byte masking key from the process-wide CSPRNG.
#[inline]
pub fn make_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    random_bytes(&mut key);
    key
}
