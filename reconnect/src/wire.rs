//! On-the-wire message kinds and framing.
//!
//! Framing mirrors `libp2p_streaming_response::v2::protocol`: a four-byte
//! big-endian length prefix followed by a CBOR-encoded body. Every message
//! kind the core produces implements `serde::{Serialize, Deserialize}`
//! directly rather than going through a class-id registry at this layer —
//! the class-id/version pair a node's codec is keyed on is carried as an
//! explicit field inside `Lesson::Internal`/`Lesson::CustomSubtreeMarker`
//! and dispatched by the teacher/learner traversal, not by this framing.

use crate::error::{ReconnectError, Result};
use crate::hash::{Hash, HASH_LEN};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Teacher → learner: "do you already have this node?"
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Query {
    pub hash: [u8; HASH_LEN],
}

impl Query {
    pub fn new(hash: Hash) -> Self {
        Query { hash: hash.as_bytes() }
    }

    pub fn hash(&self) -> Result<Hash> {
        Hash::from_bytes(self.hash)
    }
}

/// Learner → teacher: one bit per query, in query order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Response {
    pub already_have: bool,
}

/// Teacher → learner: the follow-up to exactly one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Lesson {
    /// Learner already had this subtree; nothing more is sent for it.
    Empty,
    /// The view-specific serialisation of a leaf payload.
    Leaf { class_id: u64, version: i32, bytes: Vec<u8> },
    /// A plain internal node: its header plus the ordered child hashes.
    Internal {
        class_id: u64,
        version: i32,
        child_hashes: Vec<[u8; HASH_LEN]>,
        /// Set only on the top-level root of the reconnected subtree.
        is_root_of_state: bool,
        /// Virtual-map root nodes additionally carry their leaf-path bounds.
        vmap_bounds: Option<(i64, i64)>,
    },
    /// Recursion point: the node declares a custom view.
    CustomSubtreeMarker { class_id: u64, version: i32 },
}

impl Lesson {
    pub fn child_hashes(&self) -> Result<Vec<Hash>> {
        match self {
            Lesson::Internal { child_hashes, .. } => {
                child_hashes.iter().map(|b| Hash::from_bytes(*b)).collect()
            }
            _ => Err(ReconnectError::Invariant(
                "child_hashes() called on a non-internal lesson".into(),
            )),
        }
    }
}

/// Writes a single length-prefixed, CBOR-encoded message.
pub async fn write_message<W, T>(writer: &mut W, msg: &T, max_message_size: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_cbor::to_vec(msg)?;
    let size = bytes.len();
    if size > max_message_size as usize {
        return Err(ReconnectError::Protocol(format!(
            "outgoing message too large: {size} > {max_message_size}"
        )));
    }
    writer.write_all(&(size as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Reads a single length-prefixed, CBOR-encoded message. A `size == 0`
/// read on the length prefix (EOF before any byte) is reported as an `Io`
/// error of kind `UnexpectedEof`, matching the teacher's convention of
/// surfacing a clean connection close as an I/O failure at this layer.
pub async fn read_message<R, T>(reader: &mut R, max_message_size: u32) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut size_bytes = [0u8; 4];
    reader.read_exact(&mut size_bytes).await?;
    let size = u32::from_be_bytes(size_bytes);
    if size > max_message_size {
        return Err(ReconnectError::Protocol(format!(
            "incoming message too large: {size} > {max_message_size}"
        )));
    }
    let mut bytes = vec![0u8; size as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(serde_cbor::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_query() {
        let mut buf = Vec::new();
        let q = Query::new(Hash::of_leaf(b"x"));
        write_message(&mut buf, &q, 1024).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let q2: Query = read_message(&mut cursor, 1024).await.unwrap();
        assert_eq!(q.hash, q2.hash);
    }

    #[tokio::test]
    async fn rejects_oversized_incoming_message() {
        let mut buf = Vec::new();
        let lesson = Lesson::Leaf {
            class_id: 1,
            version: 0,
            bytes: vec![0u8; 100],
        };
        write_message(&mut buf, &lesson, 1024).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message::<_, Lesson>(&mut cursor, 8).await.unwrap_err();
        assert!(matches!(err, ReconnectError::Protocol(_)));
    }
}
