//! Filter-chain descriptors. A `FilterSet` records which pipes were used
//! to produce a given blob of bytes (a content file, a snapshot state
//! file, the catalogue body) so a reader can rebuild the same chain
//! without guessing.

use serde::{Deserialize, Serialize};

use crate::pipes::crypto::NONCE_LEN;

/// Declares the pipe chain used to write a blob. `zstd` is `Some(level)`
/// when compression is in the chain; at most one of `chapoly`/`chacha`
/// is set, matching the two encryption pipes being mutually exclusive
/// per use site (ChaCha20-Poly1305 for catalogue/snapshot, XChaCha20 for
/// content).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterSet {
    pub zstd_level: Option<i32>,
    pub chapoly_nonce: Option<[u8; NONCE_LEN]>,
    pub chacha_nonce: Option<[u8; NONCE_LEN]>,
}

impl FilterSet {
    pub fn is_encrypted(&self) -> bool {
        self.chapoly_nonce.is_some() || self.chacha_nonce.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_filters() {
        let f = FilterSet::default();
        assert!(f.zstd_level.is_none());
        assert!(!f.is_encrypted());
    }
}
