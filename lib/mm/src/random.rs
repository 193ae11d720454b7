//! Entropy hook used for address-space randomization and IPC id seeding.
//!
//! The source is registered by whoever owns a hardware or software RNG.
//! Without one, [`random_get`] reports zero bytes and callers fall back to
//! deterministic behavior (no ASLR shift, sequence-seeded IPC ids).

use spin::Once;

static ENTROPY: Once<fn(&mut [u8])> = Once::new();

/// Registers the entropy source. Later registrations are ignored.
pub fn seed_entropy(source: fn(&mut [u8])) {
    ENTROPY.call_once(|| source);
}

/// Fills `buf` with random bytes; returns how many bytes were produced,
/// which is 0 when no source is registered.
pub fn random_get(buf: &mut [u8]) -> usize {
    match ENTROPY.get() {
        Some(fill) => {
            fill(buf);
            buf.len()
        }
        None => 0,
    }
}
