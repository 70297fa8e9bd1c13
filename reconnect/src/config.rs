use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};

/// Stream-layer configuration. Loaded and supplied by the caller; the core
/// never reads configuration from disk or environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Digest algorithm to hash nodes with. Reserved for future digest
    /// agility; every hash produced today is `Sha256` regardless of this
    /// field's value, the same way [`crate::hash::DigestType`] already
    /// reserves a wire tag for it.
    pub hash_digest: HashAlgorithm,
    /// Capacity of both the input and output FIFOs backing each direction
    /// of the stream (`async-stream-buffer-size`).
    pub async_stream_buffer_size: usize,
    /// Send/poll timeout in milliseconds (`async-stream-timeout-ms`).
    pub async_stream_timeout_ms: u64,
    /// Max milliseconds between output flushes (`async-output-flush-ms`).
    pub async_output_flush_ms: u64,
    /// Upper bound on a single framed message's serialised size, rejected
    /// before the input pump allocates a buffer for it.
    pub max_message_size: u32,
    /// Whether `run_learner` recomputes the installed root's hash and
    /// compares it against the teacher-declared root hash before handing
    /// the new tree back to the caller.
    pub verify_root_hash: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            hash_digest: HashAlgorithm::Sha256,
            async_stream_buffer_size: 1_000,
            async_stream_timeout_ms: 60_000,
            async_output_flush_ms: 50,
            max_message_size: 16 * 1024 * 1024,
            verify_root_hash: false,
        }
    }
}

impl ReconnectConfig {
    pub fn send_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.async_stream_timeout_ms)
    }

    pub fn poll_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.async_stream_timeout_ms)
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.async_output_flush_ms)
    }
}
