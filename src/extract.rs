//! The pluggable chunk extractor and result merging contracts.
//!
//! The pipeline never interprets chunk bytes. Callers supply a
//! [`ChunkExtractor`] that turns one chunk into a typed output, and the
//! output type decides how per-chunk outputs merge through [`Consolidate`].

use crate::error::ExtractError;
use crate::pipeline::ChunkMetadata;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Processes the bytes of one chunk.
///
/// Each worker context owns its own extractor instance and calls it on the
/// blocking thread pool, one chunk at a time. A panic inside `extract` is
/// treated as a crash of that context: the instance is dropped, a fresh one is
/// built from the factory and the chunk is retried.
pub trait ChunkExtractor: Send + 'static {
    /// Per-chunk output, merged in chunk order at the end of the run.
    type Output: Consolidate + Send + 'static;

    fn extract(
        &mut self,
        bytes: &[u8],
        offset: u64,
        metadata: &ChunkMetadata,
    ) -> Result<Self::Output, ExtractError>;
}

/// Builds a fresh extractor for a worker context.
pub type ExtractorFactory<E> = Arc<dyn Fn() -> Result<E, ExtractError> + Send + Sync>;

/// Box a closure as an [`ExtractorFactory`].
pub fn factory<E, F>(f: F) -> ExtractorFactory<E>
where
    F: Fn() -> Result<E, ExtractError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Extractor backed by a closure.
#[derive(Clone)]
pub struct FnExtractor<F> {
    f: F,
}

/// Wrap a closure as a [`ChunkExtractor`].
pub fn from_fn<F, T>(f: F) -> FnExtractor<F>
where
    F: FnMut(&[u8], u64, &ChunkMetadata) -> Result<T, ExtractError> + Send + 'static,
    T: Consolidate + Send + 'static,
{
    FnExtractor { f }
}

impl<F, T> ChunkExtractor for FnExtractor<F>
where
    F: FnMut(&[u8], u64, &ChunkMetadata) -> Result<T, ExtractError> + Send + 'static,
    T: Consolidate + Send + 'static,
{
    type Output = T;

    fn extract(
        &mut self,
        bytes: &[u8],
        offset: u64,
        metadata: &ChunkMetadata,
    ) -> Result<T, ExtractError> {
        (self.f)(bytes, offset, metadata)
    }
}

/// Merges per-chunk outputs, given in chunk index order.
pub trait Consolidate: Sized {
    fn consolidate(parts: Vec<Self>) -> Self;
}

impl Consolidate for () {
    fn consolidate(_parts: Vec<Self>) -> Self {}
}

impl Consolidate for String {
    fn consolidate(parts: Vec<Self>) -> Self {
        parts.concat()
    }
}

impl<T> Consolidate for Vec<T> {
    fn consolidate(parts: Vec<Self>) -> Self {
        parts.into_iter().flatten().collect()
    }
}

impl Consolidate for Bytes {
    fn consolidate(parts: Vec<Self>) -> Self {
        let mut merged = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in parts {
            merged.extend_from_slice(&part);
        }
        merged.freeze()
    }
}

impl Consolidate for u64 {
    fn consolidate(parts: Vec<Self>) -> Self {
        parts.into_iter().sum()
    }
}

impl Consolidate for usize {
    fn consolidate(parts: Vec<Self>) -> Self {
        parts.into_iter().sum()
    }
}
