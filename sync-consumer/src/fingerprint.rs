use std::fmt;

use sha2::{Digest, Sha256};

/// Hex encoded SHA-256 of a message payload, exactly as it was read from the topic.
///
/// The message key is not part of it: the same record published twice under two surrogate
/// keys is still one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(payload: &[u8]) -> Self {
        Fingerprint(format!("{:x}", Sha256::digest(payload)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_payload_bytes() {
        assert_eq!(
            Fingerprint::of(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(Fingerprint::of(b"").short(), "e3b0c442");
    }

    #[test]
    fn same_payload_same_fingerprint() {
        let a = Fingerprint::of(br#"{"id":"1","name":"A"}"#);
        let b = Fingerprint::of(br#"{"id":"1","name":"A"}"#);
        let changed = Fingerprint::of(br#"{"id":"1","name":"B"}"#);

        assert_eq!(a, b);
        assert_ne!(a, changed);
    }
}
