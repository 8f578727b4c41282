// Cryptographic utilities

use sha2::{Digest, Sha256};

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Short, log-safe fingerprint of a secret (hash prefix only).
pub fn secret_fingerprint(input: &str) -> String {
    let mut hex = sha256_hex(input.as_bytes());
    hex.truncate(12);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let a = secret_fingerprint("sk-abcdefghijklmnop");
        assert_eq!(a.len(), 12);
        assert_eq!(a, secret_fingerprint("sk-abcdefghijklmnop"));
        assert_ne!(a, secret_fingerprint("sk-abcdefghijklmnoq"));
    }
}
