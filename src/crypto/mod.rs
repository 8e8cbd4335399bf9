pub mod key_manager;

pub use key_manager::{
    ClusterKeyInfo, EncryptionMetadata, EncryptionMode, KeyError, KeyManager, WrappedKey,
};

/// Prefix carried by every content address the store hands out
pub const DIGEST_PREFIX: &str = "sha256-";

// Utility struct for common crypto operations
pub struct CryptoUtils;

impl CryptoUtils {
    // Compute a SHA-256 hash of the given data
    pub fn sha256_hash(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        format!("{:x}", result)
    }

    /// Content address of `data`, e.g. `sha256-9f86d0...`
    pub fn content_hash(data: &[u8]) -> String {
        format!("{}{}", DIGEST_PREFIX, Self::sha256_hash(data))
    }

    // Verify a content address against the given data
    pub fn verify_content_hash(data: &[u8], expected: &str) -> bool {
        Self::content_hash(data) == expected
    }

    /// A well-formed content address: the prefix followed by 64 lowercase hex chars
    pub fn is_valid_digest(digest: &str) -> bool {
        match digest.strip_prefix(DIGEST_PREFIX) {
            Some(hex_part) => {
                hex_part.len() == 64
                    && hex_part
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_format() {
        let digest = CryptoUtils::content_hash(b"test");
        assert_eq!(
            digest,
            "sha256-9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert!(CryptoUtils::is_valid_digest(&digest));
        assert!(CryptoUtils::verify_content_hash(b"test", &digest));
        assert!(!CryptoUtils::verify_content_hash(b"tset", &digest));
    }

    #[test]
    fn test_rejects_malformed_digests() {
        assert!(!CryptoUtils::is_valid_digest("sha256-xyz"));
        assert!(!CryptoUtils::is_valid_digest("md5-abc"));
        assert!(!CryptoUtils::is_valid_digest("sha256-../../etc/passwd"));
    }
}
