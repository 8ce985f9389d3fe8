//! Dedup signature digests.

use sha2::{Digest, Sha256};

/// Digest of a task's dedup signature, stored in a UNIQUE column.
///
/// The task name is part of the digest so that two kinds of work keyed by
/// the same URL do not collapse into each other.
pub fn signature_hash(name: &str, signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(signature.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stability() {
        let a = signature_hash("CrawlActivityStreams", "https://remote/note/1");
        let b = signature_hash("CrawlActivityStreams", "https://remote/note/1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_different_name() {
        let crawl = signature_hash("CrawlActivityStreams", "https://remote/note/1");
        let other = signature_hash("Deliver", "https://remote/note/1");
        assert_ne!(crawl, other);
    }

    #[test]
    fn test_hash_format() {
        let hash = signature_hash("CrawlActivityStreams", "https://remote/note/1");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
