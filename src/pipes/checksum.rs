//! Polymorphic checksummer: XXH64 for unencrypted content, keyed
//! BLAKE2b-512 for encrypted content, plain XXH64 always for the
//! structural checksum on catalogue/snapshot bodies.

use blake2::digest::{Digest, KeyInit, Mac, Update};
use blake2::{Blake2b512, Blake2bMac512};

use crate::content_ref::Checksum;

/// A running hash. `reset` starts a fresh digest without losing a
/// previously-derived encryption key (for the keyed variant).
pub enum Checksummer {
    Xxh64(xxhash_rust::xxh64::Xxh64),
    Blake2b512(Blake2b512),
    Blake2b512Keyed { key: [u8; 32], mac: Blake2bMac512 },
}

impl Checksummer {
    pub fn xxh64() -> Self {
        Checksummer::Xxh64(xxhash_rust::xxh64::Xxh64::new(0))
    }

    pub fn blake2b512() -> Self {
        Checksummer::Blake2b512(Blake2b512::new())
    }

    /// Keyed BLAKE2b-512, used for content when encryption is on: the
    /// archive key doubles as the MAC key so the checksum also serves as
    /// authentication for the unauthenticated XChaCha20 content stream.
    pub fn blake2b512_keyed(key: &[u8; 32]) -> Self {
        let mac = Blake2bMac512::new_from_slice(key).expect("32-byte key is valid for Blake2bMac512");
        Checksummer::Blake2b512Keyed { key: *key, mac }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksummer::Xxh64(h) => h.update(data),
            Checksummer::Blake2b512(h) => Digest::update(h, data),
            Checksummer::Blake2b512Keyed { mac, .. } => mac.update(data),
        }
    }

    /// Restarts the digest in place, keeping the keyed variant's key.
    pub fn reset(&mut self) {
        match self {
            Checksummer::Xxh64(h) => *h = xxhash_rust::xxh64::Xxh64::new(0),
            Checksummer::Blake2b512(h) => Digest::reset(h),
            Checksummer::Blake2b512Keyed { key, mac } => {
                *mac = Blake2bMac512::new_from_slice(key).expect("key already validated")
            }
        }
    }

    /// Consumes a clone of the running state into a final digest, leaving
    /// `self` usable for continued updates (mirrors `finish()` being
    /// non-destructive in the original streaming pipe).
    pub fn finalize(&self) -> Checksum {
        match self {
            Checksummer::Xxh64(h) => Checksum::Xxh64(h.digest()),
            Checksummer::Blake2b512(h) => {
                let bytes = h.clone().finalize();
                let mut out = [0u8; 64];
                out.copy_from_slice(&bytes);
                Checksum::Blake2b512(out)
            }
            Checksummer::Blake2b512Keyed { mac, .. } => {
                let bytes = mac.clone().finalize().into_bytes();
                let mut out = [0u8; 64];
                out.copy_from_slice(&bytes);
                Checksum::Blake2b512(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xxh64_matches_direct_call() {
        let mut cs = Checksummer::xxh64();
        cs.update(b"hello");
        cs.update(b" world");
        let Checksum::Xxh64(got) = cs.finalize() else {
            panic!("wrong variant");
        };
        assert_eq!(got, xxhash_rust::xxh64::xxh64(b"hello world", 0));
    }

    #[test]
    fn reset_clears_state() {
        let mut cs = Checksummer::xxh64();
        cs.update(b"garbage");
        cs.reset();
        cs.update(b"hello");
        let Checksum::Xxh64(got) = cs.finalize() else {
            panic!("wrong variant");
        };
        assert_eq!(got, xxhash_rust::xxh64::xxh64(b"hello", 0));
    }

    #[test]
    fn keyed_blake2b_is_deterministic_for_same_key() {
        let key = [7u8; 32];
        let mut a = Checksummer::blake2b512_keyed(&key);
        let mut b = Checksummer::blake2b512_keyed(&key);
        a.update(b"data");
        b.update(b"data");
        assert_eq!(
            std::mem::discriminant(&a.finalize()),
            std::mem::discriminant(&b.finalize())
        );
        match (a.finalize(), b.finalize()) {
            (Checksum::Blake2b512(x), Checksum::Blake2b512(y)) => assert_eq!(x, y),
            _ => panic!("wrong variant"),
        }
    }
}
