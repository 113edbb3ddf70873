//! Checksum accumulation
//!
//! A [`ChecksumEngine`] folds chunk bytes into a provider-specific digest. Chunks
//! must be applied in strictly increasing index order; concurrent workers hand
//! their results to a [`ReorderBuffer`] which releases them in order.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use crc::{CRC_32_ISCSI, Crc, Digest};

use crate::error::{Error, Result};

static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Digest flavour reported by a provider for a committed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// Base64 MD5 of the object content (Azure `Content-MD5`)
    Md5,
    /// Base64 of the big-endian CRC32C of the content (GCS)
    Crc32c,
    /// Hex MD5 over the concatenated part MD5s, suffixed with `-<parts>` (S3 ETag)
    MultipartEtag,
}

impl DigestAlgorithm {
    pub fn strategy(&self) -> Box<dyn HashStrategy> {
        match self {
            DigestAlgorithm::Md5 => Box::new(Md5Strategy::default()),
            DigestAlgorithm::Crc32c => Box::new(Crc32cStrategy::default()),
            DigestAlgorithm::MultipartEtag => Box::new(MultipartEtagStrategy::default()),
        }
    }

    /// Whether the digest depends on where chunk boundaries fall
    pub fn is_boundary_sensitive(&self) -> bool {
        matches!(self, DigestAlgorithm::MultipartEtag)
    }
}

/// Pluggable hashing applied by a [`ChecksumEngine`]
///
/// `update` is called once per chunk, in chunk order.
pub trait HashStrategy: Send {
    fn update(&mut self, chunk: &[u8]);

    /// Encoded digest of everything applied so far
    fn finalize(&self) -> String;
}

#[derive(Clone)]
pub struct Md5Strategy {
    ctx: md5::Context,
}

impl Default for Md5Strategy {
    fn default() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }
}

impl HashStrategy for Md5Strategy {
    fn update(&mut self, chunk: &[u8]) {
        self.ctx.consume(chunk);
    }

    fn finalize(&self) -> String {
        B64.encode(self.ctx.clone().compute().0)
    }
}

#[derive(Clone)]
pub struct Crc32cStrategy {
    digest: Digest<'static, u32>,
}

impl Default for Crc32cStrategy {
    fn default() -> Self {
        Self {
            digest: CASTAGNOLI.digest(),
        }
    }
}

impl HashStrategy for Crc32cStrategy {
    fn update(&mut self, chunk: &[u8]) {
        self.digest.update(chunk);
    }

    fn finalize(&self) -> String {
        encode_crc32c(self.digest.clone().finalize())
    }
}

#[derive(Clone)]
pub struct MultipartEtagStrategy {
    ctx: md5::Context,
    parts: usize,
}

impl Default for MultipartEtagStrategy {
    fn default() -> Self {
        Self {
            ctx: md5::Context::new(),
            parts: 0,
        }
    }
}

impl HashStrategy for MultipartEtagStrategy {
    fn update(&mut self, chunk: &[u8]) {
        self.ctx.consume(md5::compute(chunk).0);
        self.parts += 1;
    }

    fn finalize(&self) -> String {
        format!("{}-{}", hex::encode(self.ctx.clone().compute().0), self.parts)
    }
}

/// Base64 MD5 of a buffer, as sent in `Content-MD5` headers
pub fn md5_base64(data: &[u8]) -> String {
    B64.encode(md5::compute(data).0)
}

/// Hex MD5 of a buffer, as returned in S3 part ETags
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

/// Base64 big-endian CRC32C of a buffer
pub fn crc32c_base64(data: &[u8]) -> String {
    encode_crc32c(CASTAGNOLI.checksum(data))
}

fn encode_crc32c(value: u32) -> String {
    B64.encode(value.to_be_bytes())
}

/// Order-enforcing digest accumulator
pub struct ChecksumEngine {
    algorithm: DigestAlgorithm,
    strategy: Box<dyn HashStrategy>,
    next_index: usize,
    bytes: u64,
}

impl ChecksumEngine {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            strategy: algorithm.strategy(),
            next_index: 0,
            bytes: 0,
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Apply chunk `index`; indices must arrive as 0, 1, 2, ...
    pub fn update(&mut self, index: usize, chunk: &[u8]) -> Result<()> {
        if index != self.next_index {
            return Err(Error::General(format!(
                "checksum update out of order: expected chunk {}, got {index}",
                self.next_index
            )));
        }
        self.strategy.update(chunk);
        self.next_index += 1;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Number of chunks applied so far
    pub fn chunks_applied(&self) -> usize {
        self.next_index
    }

    pub fn bytes_applied(&self) -> u64 {
        self.bytes
    }

    /// Digest of all applied chunks
    pub fn digest(&self) -> String {
        self.strategy.finalize()
    }

    /// Exact comparison against a provider-reported digest
    pub fn verify(&self, remote_digest: &str) -> bool {
        let remote = remote_digest.trim().trim_matches('"');
        match self.algorithm {
            // ETags are hex; providers differ in case
            DigestAlgorithm::MultipartEtag => self.digest().eq_ignore_ascii_case(remote),
            _ => self.digest() == remote,
        }
    }
}

impl std::fmt::Debug for ChecksumEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumEngine")
            .field("algorithm", &self.algorithm)
            .field("next_index", &self.next_index)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Holds results that complete early until their predecessors arrive
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(first_index: usize) -> Self {
        Self {
            next: first_index,
            pending: BTreeMap::new(),
        }
    }

    /// Insert a completed item and return every item now releasable, in order
    pub fn push(&mut self, index: usize, item: T) -> Vec<(usize, T)> {
        self.pending.insert(index, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push((self.next, item));
            self.next += 1;
        }
        ready
    }

    /// Index of the next item to be released
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Number of items held back
    pub fn held(&self) -> usize {
        self.pending.len()
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        // md5("hello world") = 5eb63bbbe01eeed093cb22bb8f5acdc3
        let mut engine = ChecksumEngine::new(DigestAlgorithm::Md5);
        engine.update(0, b"hello ").unwrap();
        engine.update(1, b"world").unwrap();
        assert_eq!(engine.digest(), md5_base64(b"hello world"));
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_crc32c_known_value() {
        // CRC32C("123456789") = 0xE3069283
        assert_eq!(crc32c_base64(b"123456789"), B64.encode(0xE306_9283u32.to_be_bytes()));

        let mut engine = ChecksumEngine::new(DigestAlgorithm::Crc32c);
        engine.update(0, b"1234").unwrap();
        engine.update(1, b"56789").unwrap();
        assert_eq!(engine.digest(), crc32c_base64(b"123456789"));
        assert!(engine.verify("4waSgw=="));
    }

    #[test]
    fn test_multipart_etag() {
        let mut engine = ChecksumEngine::new(DigestAlgorithm::MultipartEtag);
        engine.update(0, b"aaaa").unwrap();
        engine.update(1, b"bb").unwrap();

        let mut concat = Vec::new();
        concat.extend_from_slice(&md5::compute(b"aaaa").0);
        concat.extend_from_slice(&md5::compute(b"bb").0);
        let expected = format!("{}-2", md5_hex(&concat));

        assert_eq!(engine.digest(), expected);
        assert!(engine.verify(&format!("\"{}\"", expected.to_uppercase())));
    }

    #[test]
    fn test_update_rejects_out_of_order() {
        let mut engine = ChecksumEngine::new(DigestAlgorithm::Md5);
        assert!(engine.update(1, b"x").is_err());
        engine.update(0, b"x").unwrap();
        assert!(engine.update(0, b"x").is_err());
        assert_eq!(engine.chunks_applied(), 1);
        assert_eq!(engine.bytes_applied(), 1);
    }

    #[test]
    fn test_verify_mismatch() {
        let mut engine = ChecksumEngine::new(DigestAlgorithm::Md5);
        engine.update(0, b"data").unwrap();
        assert!(!engine.verify(&md5_base64(b"other")));
        assert!(engine.verify(&md5_base64(b"data")));
    }

    #[test]
    fn test_reorder_buffer_reversed_completion() {
        let mut buffer = ReorderBuffer::new(0);
        assert!(buffer.push(3, "d").is_empty());
        assert!(buffer.push(2, "c").is_empty());
        assert!(buffer.push(1, "b").is_empty());
        assert_eq!(buffer.held(), 3);

        let ready = buffer.push(0, "a");
        let order: Vec<usize> = ready.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(buffer.is_drained());
        assert_eq!(buffer.next_index(), 4);
    }

    #[test]
    fn test_reordered_digest_matches_sequential() {
        let chunks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 10 + i as usize]).collect();

        let mut sequential = ChecksumEngine::new(DigestAlgorithm::Crc32c);
        for (i, c) in chunks.iter().enumerate() {
            sequential.update(i, c).unwrap();
        }

        let mut engine = ChecksumEngine::new(DigestAlgorithm::Crc32c);
        let mut buffer = ReorderBuffer::new(0);
        for i in [2usize, 0, 5, 1, 4, 3] {
            for (index, data) in buffer.push(i, chunks[i].clone()) {
                engine.update(index, &data).unwrap();
            }
        }

        assert!(buffer.is_drained());
        assert_eq!(engine.digest(), sequential.digest());
    }
}
