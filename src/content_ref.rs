//! The value object linking a logical file blob to its bytes inside a
//! content file.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::filters::FilterSet;

/// A polymorphic digest. XXH64 when the archive is unencrypted, keyed
/// BLAKE2b-512 when it is — see
/// [`crate::pipes::checksum::Checksummer`]. Equality compares the
/// variant and the bytes together (the derive does this for free: two
/// values of different variants are never equal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checksum {
    Xxh64(u64),
    Blake2b512([u8; 64]),
}

/// One blob's address and bookkeeping. Ordered and deduplicated by
/// `(content_file_name, from)` — invariant C1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRef {
    pub content_file_name: String,
    pub from: u64,
    pub to: u64,
    pub filters: FilterSet,
    /// Bytes this blob occupies inside the content file after filters.
    /// Never zero on a successful add; a zero reading from the
    /// underlying writer is replaced with 1 (see `content_writer`).
    pub space_taken: u64,
    pub checksum: Checksum,
    pub ref_count: u64,
}

impl ContentRef {
    pub fn key(&self) -> (&str, u64) {
        (&self.content_file_name, self.from)
    }
}

impl PartialEq for ContentRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for ContentRef {}

impl PartialOrd for ContentRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ContentRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.content_file_name
            .cmp(&other.content_file_name)
            .then(self.from.cmp(&other.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ref(name: &str, from: u64) -> ContentRef {
        ContentRef {
            content_file_name: name.to_string(),
            from,
            to: from + 10,
            filters: FilterSet::default(),
            space_taken: 10,
            checksum: Checksum::Xxh64(0),
            ref_count: 1,
        }
    }

    #[test]
    fn ordering_is_by_name_then_from() {
        let mut refs = vec![make_ref("c2", 0), make_ref("c1", 10), make_ref("c1", 0)];
        refs.sort();
        assert_eq!(
            refs.iter().map(|r| r.key()).collect::<Vec<_>>(),
            vec![("c1", 0), ("c1", 10), ("c2", 0)]
        );
    }

    #[test]
    fn equality_ignores_ref_count_and_checksum() {
        let mut a = make_ref("c1", 0);
        let mut b = make_ref("c1", 0);
        a.ref_count = 5;
        b.checksum = Checksum::Blake2b512([1u8; 64]);
        assert_eq!(a, b);
    }
}
