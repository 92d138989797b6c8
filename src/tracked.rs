// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Tracked file surface (§6.4, §4.E, §9).
//!
//! `read_dma` is the only operation that must return permit-charged buffers;
//! `write_dma`, `flush`, `close` and `size` are unaccounted (§6.4). A
//! [`TrackedBuffer`] keeps its [`crate::semaphore::Permit`] alive for as
//! long as the buffer itself is alive, breaking the permit/buffer cycle by
//! shared ownership rather than a back-pointer (§9).

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::Result, semaphore::Permit};

/// Underlying raw file a storage layer provides; out of scope to implement
/// for real disk I/O (§1), but the shape mirrors `read_dma`/`write_dma`
/// surfaces used by the teacher's object-store-backed sst readers.
#[async_trait]
pub trait RawFile: Send + Sync {
    async fn read_dma_raw(&self, offset: u64, len: usize) -> Result<Bytes>;
    async fn write_dma(&self, offset: u64, data: &[u8]) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn size(&self) -> u64;
}

/// A buffer whose byte size has been charged against a [`Permit`]; the
/// charge is released when the buffer is dropped, regardless of whether the
/// [`Tracked`] file that produced it is still alive (§4.E: "Buffers may
/// outlive the tracked file handle; the tracker follows the buffer.").
pub struct TrackedBuffer {
    bytes: Bytes,
    permit: Permit,
}

impl TrackedBuffer {
    fn new(bytes: Bytes, permit: Permit) -> Self {
        permit.charge(bytes.len() as i64);
        TrackedBuffer { bytes, permit }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The permit this buffer's memory charge is accounted against.
    pub fn permit(&self) -> &Permit {
        &self.permit
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.permit.release_charge(self.bytes.len() as i64);
    }
}

/// Wraps a [`RawFile`] with a [`Permit`] so every `read_dma` buffer it
/// produces is charged to that permit (§4.E `track`).
pub struct Tracked<F> {
    inner: F,
    permit: Permit,
}

pub fn track<F: RawFile>(inner: F, permit: Permit) -> Tracked<F> {
    Tracked { inner, permit }
}

impl<F: RawFile> Tracked<F> {
    pub async fn read_dma(&self, offset: u64, len: usize) -> Result<TrackedBuffer> {
        let bytes = self.inner.read_dma_raw(offset, len).await?;
        Ok(TrackedBuffer::new(bytes, self.permit.clone()))
    }

    pub async fn write_dma(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_dma(offset, data).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }
}
