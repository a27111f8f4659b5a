use sha2::{Digest, Sha256};

/// Incremental sha256 used for content fingerprints, parameter hashes and
/// payload checksums. Every field is length-prefixed so adjacent values
/// cannot run into each other.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.hasher.update(value.to_bits().to_le_bytes());
        self
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Plain sha256 of a byte slice, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
