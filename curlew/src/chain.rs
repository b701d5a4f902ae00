//! Append-only chains of response bytes.
//!
//! A transfer's header and body streams each land in a [`BufferChain`].
//! Every non-empty engine callback becomes one node holding a private copy of
//! the delivered bytes, so the nodes concatenated in order reproduce the
//! stream exactly.

use bytes::{Bytes, BytesMut};

/// Ordered sequence of byte chunks with a running total.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferChain {
    chunks: Vec<Bytes>,
    len: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a copy of `data` as a new node. Empty slices are ignored.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.chunks.push(Bytes::copy_from_slice(data));
        self.len += data.len();
    }

    /// Total bytes across all nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nodes in arrival order.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }

    /// Copy every node into one contiguous buffer.
    pub fn concat(&self) -> Bytes {
        concat(&self.chunks, self.len)
    }
}

pub(crate) fn concat(chunks: &[Bytes], len: usize) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [only] => only.clone(),
        _ => {
            let mut buf = BytesMut::with_capacity(len);
            for chunk in chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        }
    }
}
