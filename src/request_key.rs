use sha2::{Digest, Sha256};

// Bump when the key layout changes so old keys never collide with new ones.
const KEY_VERSION: &str = "summary-request/v1";
const SEPARATOR: u8 = 0x1f;

/// Builds the idempotency key of a summary request.
///
/// The key is the hex-encoded SHA-256 of the job kind, target, content
/// fingerprint, prompt version and force flag. Identical requests always map
/// to the same key, which the job table holds unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestKeyBuilder<'a> {
    kind: &'a str,
    target_id: &'a str,
    metadata_hash: &'a str,
    prompt_version: &'a str,
    force: bool,
}

impl<'a> RequestKeyBuilder<'a> {
    /// Start a key for `target_id` in the `kind` queue.
    pub fn new(kind: &'a str, target_id: &'a str) -> Self {
        Self {
            kind,
            target_id,
            metadata_hash: "",
            prompt_version: "",
            force: false,
        }
    }

    /// Set the content fingerprint.
    pub fn metadata_hash(mut self, metadata_hash: &'a str) -> Self {
        self.metadata_hash = metadata_hash;
        self
    }

    /// Set the prompt version.
    pub fn prompt_version(mut self, prompt_version: &'a str) -> Self {
        self.prompt_version = prompt_version;
        self
    }

    /// Set the force flag.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Compute the key.
    pub fn build(&self) -> String {
        let force = if self.force { "1" } else { "0" };
        let mut hasher = Sha256::new();
        for part in [
            KEY_VERSION,
            self.kind,
            self.target_id,
            self.metadata_hash,
            self.prompt_version,
            force,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([SEPARATOR]);
        }
        hex::encode(hasher.finalize())
    }
}
