//! Credential fingerprinting.

use sha2::{Digest, Sha256};

use super::SESSION_ID_LEN;

/// SHA-256 of the credential, hex encoded and truncated to [`SESSION_ID_LEN`].
pub fn fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(SESSION_ID_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_known_value() {
        // sha256("") = e3b0c44298fc1c149afbf4c8996fb924...
        assert_eq!(fingerprint(""), "e3b0c44298fc1c14");
    }

    #[test]
    fn test_fingerprint_is_hex() {
        let fp = fingerprint("sk-test-key");
        assert_eq!(fp.len(), SESSION_ID_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
