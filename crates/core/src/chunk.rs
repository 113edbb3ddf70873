//! Chunk planning
//!
//! Splits a byte range into objects (when a provider caps object size or part
//! count) and each object into contiguous, non-overlapping chunks.

use std::ops::Range;

use crate::error::{Error, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Provider limits that constrain how a dataset is chunked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Smallest chunk size accepted (the last chunk of an object may be shorter)
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Chunk sizes must be a multiple of this value
    pub granularity: u64,
    /// Maximum number of chunks committed into one remote object
    pub max_chunks_per_object: u64,
    /// Single-object size ceiling; larger datasets span several objects
    pub max_object_size: u64,
    /// Upper bound on concurrent chunk uploads into one object
    pub max_upload_concurrency: Option<usize>,
}

impl ChunkPolicy {
    /// A policy without provider limits
    pub const fn unrestricted() -> Self {
        Self {
            min_chunk_size: 1,
            max_chunk_size: u64::MAX,
            granularity: 1,
            max_chunks_per_object: u64::MAX,
            max_object_size: u64::MAX,
            max_upload_concurrency: None,
        }
    }

    /// Check a requested chunk size against the policy
    pub fn validate(&self, chunk_size: u64) -> Result<u64> {
        let reject = |reason: String| Error::InvalidChunkSize {
            requested: chunk_size,
            reason,
        };

        if chunk_size == 0 {
            return Err(reject("chunk size must be greater than zero".to_string()));
        }
        if chunk_size < self.min_chunk_size {
            return Err(reject(format!(
                "below the provider minimum of {} bytes",
                self.min_chunk_size
            )));
        }
        if chunk_size > self.max_chunk_size {
            return Err(reject(format!(
                "above the provider maximum of {} bytes",
                self.max_chunk_size
            )));
        }
        if self.granularity > 1 && chunk_size % self.granularity != 0 {
            return Err(reject(format!(
                "not a multiple of {} bytes",
                self.granularity
            )));
        }
        if chunk_size > self.max_object_size {
            return Err(reject(format!(
                "larger than the maximum object size of {} bytes",
                self.max_object_size
            )));
        }

        Ok(chunk_size)
    }

    /// Largest object size that holds a whole number of chunks
    pub fn object_capacity(&self, chunk_size: u64) -> u64 {
        let by_size = (self.max_object_size / chunk_size) * chunk_size;
        let by_count = self.max_chunks_per_object.saturating_mul(chunk_size);
        by_size.min(by_count).max(chunk_size)
    }

    /// Effective upload concurrency for a requested worker count
    pub fn upload_concurrency(&self, requested: usize) -> usize {
        let requested = requested.max(1);
        match self.max_upload_concurrency {
            Some(max) => requested.min(max.max(1)),
            None => requested,
        }
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self::unrestricted()
    }
}

/// Lifecycle of one chunk inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Sent,
    Acked,
    Failed,
}

/// A contiguous byte sub-range transferred as one wire-protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the whole dataset, starting at 0
    pub index: usize,
    pub object_index: usize,
    /// Position inside the object, starting at 0
    pub part: usize,
    /// Byte range within the dataset
    pub range: Range<u64>,
    /// Dataset offset of the first byte of the owning object
    pub object_offset: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Byte range relative to the start of the owning object
    pub fn object_range(&self) -> Range<u64> {
        (self.range.start - self.object_offset)..(self.range.end - self.object_offset)
    }
}

/// The chunks of one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPlan {
    pub index: usize,
    /// Dataset offset of the object's first byte
    pub offset: u64,
    pub size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<Chunk>,
}

/// Ordered partition of a dataset into objects and chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub objects: Vec<ObjectPlan>,
}

impl ChunkPlan {
    /// Build a plan from consecutive `(object_size, chunk_size)` pairs
    ///
    /// A zero-sized object gets no chunks.
    pub fn from_objects(layout: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut objects = Vec::new();
        let mut offset = 0u64;
        let mut next_index = 0usize;

        for (object_index, (size, chunk_size)) in layout.into_iter().enumerate() {
            let chunk_size = chunk_size.max(1);
            let mut chunks = Vec::new();
            let mut start = offset;
            let end_of_object = offset + size;

            while start < end_of_object {
                let end = (start + chunk_size).min(end_of_object);
                chunks.push(Chunk {
                    index: next_index,
                    object_index,
                    part: chunks.len(),
                    range: start..end,
                    object_offset: offset,
                });
                next_index += 1;
                start = end;
            }

            objects.push(ObjectPlan {
                index: object_index,
                offset,
                size,
                chunk_size,
                chunks,
            });
            offset = end_of_object;
        }

        Self {
            total_size: offset,
            objects,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.objects.iter().map(|o| o.chunks.len()).sum()
    }

    /// All chunks in increasing index order
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.objects.iter().flat_map(|o| o.chunks.iter())
    }
}

/// Computes chunk plans under a provider's [`ChunkPolicy`]
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    policy: ChunkPolicy,
}

impl ChunkPlanner {
    pub fn new(policy: ChunkPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    /// Plan an upload of `total_size` bytes in chunks of `chunk_size`
    ///
    /// Produces `ceil(total_size / chunk_size)` chunks. The dataset is split
    /// into several objects only when the policy caps object size or part count.
    pub fn plan(&self, total_size: u64, chunk_size: u64) -> Result<ChunkPlan> {
        if total_size == 0 {
            return Err(Error::EmptyFile("the source".to_string()));
        }
        let chunk_size = self.policy.validate(chunk_size)?;
        let capacity = self.policy.object_capacity(chunk_size);

        let object_count = total_size.div_ceil(capacity);
        let layout = (0..object_count).map(|i| {
            let start = i * capacity;
            ((total_size - start).min(capacity), chunk_size)
        });

        Ok(ChunkPlan::from_objects(layout))
    }
}
