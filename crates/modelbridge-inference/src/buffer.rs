//! Engine-visible byte buffers.

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

use crate::error::InferenceError;
use crate::Result;

/// Owned, immutable byte buffer handed to and returned from engines.
///
/// Cloning is cheap; clones share the same allocation. The buffer never
/// borrows from the caller, so the source of a [`BufferAdapter::wrap`] may be
/// dropped immediately afterwards.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct NativeBuffer {
    bytes: Bytes,
}

impl NativeBuffer {
    /// Take ownership of a vector without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(data),
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read-only view of the contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Deref for NativeBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for NativeBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for NativeBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Converts between raw bytes and [`NativeBuffer`]s.
pub struct BufferAdapter;

impl BufferAdapter {
    /// Copy `data` into a freshly allocated buffer.
    ///
    /// Fails with [`InferenceError::Allocation`] instead of aborting when the
    /// allocator cannot satisfy the request.
    pub fn wrap(data: &[u8]) -> Result<NativeBuffer> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(data.len())
            .map_err(|_| InferenceError::Allocation(data.len()))?;
        owned.extend_from_slice(data);
        Ok(NativeBuffer::from_vec(owned))
    }

    /// Wrap an already owned vector. No copy is made.
    pub fn wrap_owned(data: Vec<u8>) -> NativeBuffer {
        NativeBuffer::from_vec(data)
    }

    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Result<NativeBuffer> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(len)
            .map_err(|_| InferenceError::Allocation(len))?;
        owned.resize(len, 0);
        Ok(NativeBuffer::from_vec(owned))
    }

    /// Borrow the bytes of a buffer. The view lives as long as the buffer.
    pub fn unwrap(buffer: &NativeBuffer) -> &[u8] {
        buffer.as_slice()
    }
}
