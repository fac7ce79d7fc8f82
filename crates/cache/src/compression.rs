//! Compression codecs and the decorator that applies them
//!
//! A [`CodecChain`] encodes stored content with each codec in order and
//! decodes loaded content in reverse. [`CompressingAccess`] wraps any
//! [`BuildCacheAccess`] with a chain, so the coordinator never knows whether
//! compression is active. Decorators nest by construction:
//!
//! ```ignore
//! let access = CompressingAccess::new(CompressingAccess::new(tiered, lz4), zstd);
//! ```

use crate::access::{BuildCacheAccess, LoadHandler, StoreHandler, Tier};
use crate::error::RemoteError;
use crate::key::CacheKey;
use crate::writer::{BytesWriter, EntryWriter};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Reversible byte transform applied to entry content
pub trait Codec: Send + Sync {
    /// Name used in diagnostics and configuration
    fn name(&self) -> &'static str;

    /// Encode the full content of `writer`
    fn encode(&self, writer: &dyn EntryWriter) -> Result<Bytes>;

    /// Wrap `input` in a decoding stream
    fn decoder<'r>(&self, input: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>>;
}

/// Codec selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Store content as-is
    None,
    /// gzip (DEFLATE)
    Gzip,
    /// LZ4 frame format
    Lz4,
    /// LZF in "ZV" chunks
    Lzf,
    /// Zstandard
    Zstd,
}

impl Compression {
    /// Codec implementing this selection; `None` for no compression
    #[must_use]
    pub fn codec(self) -> Option<Arc<dyn Codec>> {
        match self {
            Self::None => None,
            Self::Gzip => Some(Arc::new(GzipCodec)),
            Self::Lz4 => Some(Arc::new(Lz4Codec)),
            Self::Lzf => Some(Arc::new(LzfCodec)),
            Self::Zstd => Some(Arc::new(ZstdCodec::default())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Lz4 => "lz4",
            Self::Lzf => "lzf",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// gzip via `flate2`
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

impl Codec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn encode(&self, writer: &dyn EntryWriter) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        writer
            .write_to(&mut encoder)
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        let encoded = encoder
            .finish()
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    fn decoder<'r>(&self, input: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(Box::new(GzDecoder::new(input)))
    }
}

/// LZ4 frame format via `lz4`
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, writer: &dyn EntryWriter) -> Result<Bytes> {
        let mut encoder = lz4::EncoderBuilder::new()
            .build(Vec::new())
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        writer
            .write_to(&mut encoder)
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        let (encoded, finished) = encoder.finish();
        finished.map_err(|e| Error::codec(self.name(), e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    fn decoder<'r>(&self, input: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(Box::new(lz4::Decoder::new(input)?))
    }
}

/// Zstandard via `zstd`
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Codec with an explicit compression level
    #[must_use]
    pub const fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn encode(&self, writer: &dyn EntryWriter) -> Result<Bytes> {
        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), self.level)
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        writer
            .write_to(&mut encoder)
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        let encoded = encoder
            .finish()
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    fn decoder<'r>(&self, input: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(input)?))
    }
}

// LZF chunk framing: "ZV", a type byte, then big-endian lengths.
//   type 0: len(u16) + raw bytes
//   type 1: compressed_len(u16) + original_len(u16) + compressed bytes
//   type 2: total decoded length(u64), always the last chunk
const LZF_MAGIC: &[u8; 2] = b"ZV";
const LZF_UNCOMPRESSED: u8 = 0;
const LZF_COMPRESSED: u8 = 1;
const LZF_END: u8 = 2;
const LZF_MAX_CHUNK: usize = 0xFFFF;

/// LZF via the `lzf` crate, framed in independent chunks
#[derive(Debug, Clone, Copy, Default)]
pub struct LzfCodec;

impl Codec for LzfCodec {
    fn name(&self) -> &'static str {
        "lzf"
    }

    fn encode(&self, writer: &dyn EntryWriter) -> Result<Bytes> {
        let mut content = Vec::new();
        writer
            .write_to(&mut content)
            .map_err(|e| Error::codec(self.name(), e.to_string()))?;

        let mut encoded = Vec::with_capacity(content.len() / 2 + 16);
        for chunk in content.chunks(LZF_MAX_CHUNK) {
            encoded.extend_from_slice(LZF_MAGIC);
            match lzf::compress(chunk) {
                Ok(compressed) if compressed.len() < chunk.len() => {
                    encoded.push(LZF_COMPRESSED);
                    push_u16(&mut encoded, compressed.len());
                    push_u16(&mut encoded, chunk.len());
                    encoded.extend_from_slice(&compressed);
                }
                // Incompressible chunks are stored raw
                _ => {
                    encoded.push(LZF_UNCOMPRESSED);
                    push_u16(&mut encoded, chunk.len());
                    encoded.extend_from_slice(chunk);
                }
            }
        }
        encoded.extend_from_slice(LZF_MAGIC);
        encoded.push(LZF_END);
        encoded.extend_from_slice(&(content.len() as u64).to_be_bytes());
        Ok(Bytes::from(encoded))
    }

    fn decoder<'r>(&self, input: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        Ok(Box::new(LzfReader {
            inner: input,
            chunk: Vec::new(),
            position: 0,
            decoded: 0,
            finished: false,
        }))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn push_u16(out: &mut Vec<u8>, value: usize) {
    // Chunks never exceed LZF_MAX_CHUNK
    out.extend_from_slice(&(value as u16).to_be_bytes());
}

struct LzfReader<R: Read> {
    inner: R,
    chunk: Vec<u8>,
    position: usize,
    decoded: u64,
    finished: bool,
}

impl<R: Read> LzfReader<R> {
    fn read_u16(&mut self) -> io::Result<usize> {
        let mut raw = [0u8; 2];
        self.inner.read_exact(&mut raw)?;
        Ok(usize::from(u16::from_be_bytes(raw)))
    }

    /// Load the next chunk; `false` once the end chunk has been verified
    fn next_chunk(&mut self) -> io::Result<bool> {
        let mut magic = [0u8; 2];
        let first = loop {
            match self.inner.read(&mut magic[..1]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        };
        if first == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "LZF stream ended before its end chunk",
            ));
        }
        self.inner.read_exact(&mut magic[1..])?;
        if &magic != LZF_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing LZF chunk header",
            ));
        }

        let mut kind = [0u8; 1];
        self.inner.read_exact(&mut kind)?;
        self.chunk = match kind[0] {
            LZF_UNCOMPRESSED => {
                let len = self.read_u16()?;
                let mut raw = vec![0u8; len];
                self.inner.read_exact(&mut raw)?;
                raw
            }
            LZF_COMPRESSED => {
                let compressed_len = self.read_u16()?;
                let original_len = self.read_u16()?;
                let mut compressed = vec![0u8; compressed_len];
                self.inner.read_exact(&mut compressed)?;
                let chunk = lzf::decompress(&compressed, original_len).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("LZF chunk: {e:?}"))
                })?;
                if chunk.len() != original_len {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "LZF chunk length mismatch",
                    ));
                }
                chunk
            }
            LZF_END => {
                let mut raw = [0u8; 8];
                self.inner.read_exact(&mut raw)?;
                let total = u64::from_be_bytes(raw);
                if total != self.decoded {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "LZF stream declares {total} bytes but {} were decoded",
                            self.decoded
                        ),
                    ));
                }
                self.finished = true;
                self.chunk.clear();
                self.position = 0;
                return Ok(false);
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown LZF chunk type {other}"),
                ));
            }
        };
        self.decoded += self.chunk.len() as u64;
        self.position = 0;
        Ok(true)
    }
}

impl<R: Read> Read for LzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.chunk.len() {
            if self.finished || !self.next_chunk()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.chunk.len() - self.position);
        buf[..n].copy_from_slice(&self.chunk[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Ordered list of codecs
#[derive(Clone, Default)]
pub struct CodecChain {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecChain {
    /// Chain applying `codecs` in order on store
    #[must_use]
    pub fn new(codecs: Vec<Arc<dyn Codec>>) -> Self {
        Self { codecs }
    }

    /// Chain for configured selections, skipping `none`
    #[must_use]
    pub fn from_config(selection: &[Compression]) -> Self {
        Self::new(selection.iter().filter_map(|c| c.codec()).collect())
    }

    /// Whether the chain does nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Codec names joined with `+`
    #[must_use]
    pub fn name(&self) -> String {
        if self.codecs.is_empty() {
            return "none".to_string();
        }
        self.codecs
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Encode with every codec in order
    pub fn encode(&self, writer: Box<dyn EntryWriter>) -> Result<Box<dyn EntryWriter>> {
        let mut current = writer;
        for codec in &self.codecs {
            current = Box::new(BytesWriter::new(codec.encode(current.as_ref())?));
        }
        Ok(current)
    }

    /// Decode with every codec in reverse order
    pub fn decoder<'r>(&self, input: Box<dyn Read + 'r>) -> io::Result<Box<dyn Read + 'r>> {
        self.codecs
            .iter()
            .rev()
            .try_fold(input, |stream, codec| codec.decoder(stream))
    }
}

impl fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CodecChain").field(&self.name()).finish()
    }
}

/// Decorates a [`BuildCacheAccess`] with a codec chain
#[derive(Debug)]
pub struct CompressingAccess<A> {
    delegate: A,
    chain: CodecChain,
}

impl<A: BuildCacheAccess> CompressingAccess<A> {
    /// Wrap `delegate`
    #[must_use]
    pub fn new(delegate: A, chain: CodecChain) -> Self {
        Self { delegate, chain }
    }

    /// Wrapped access
    #[must_use]
    pub fn delegate(&self) -> &A {
        &self.delegate
    }
}

#[async_trait]
impl<A: BuildCacheAccess> BuildCacheAccess for CompressingAccess<A> {
    async fn load<P, H>(&self, entries: HashMap<CacheKey, P>, handler: &H) -> Result<()>
    where
        P: Send,
        H: LoadHandler<P> + ?Sized,
    {
        let decoding = DecompressingLoadHandler {
            inner: handler,
            chain: &self.chain,
        };
        self.delegate.load(entries, &decoding).await
    }

    async fn store<P, H>(&self, entries: HashMap<CacheKey, P>, handler: &H) -> Result<()>
    where
        P: Send,
        H: StoreHandler<P> + ?Sized,
    {
        let encoding = CompressingStoreHandler {
            inner: handler,
            chain: &self.chain,
        };
        self.delegate.store(entries, &encoding).await
    }

    async fn close(&self) -> Result<()> {
        self.delegate.close().await
    }
}

/// Records whether the decoding stream failed while being read
struct TrackedDecoder<'a, 'r> {
    inner: Box<dyn Read + 'r>,
    failed: &'a Cell<bool>,
}

impl Read for TrackedDecoder<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed.set(true))
    }
}

struct DecompressingLoadHandler<'a, H: ?Sized> {
    inner: &'a H,
    chain: &'a CodecChain,
}

impl<P, H: LoadHandler<P> + ?Sized> LoadHandler<P> for DecompressingLoadHandler<'_, H> {
    fn handle(&self, input: &mut dyn Read, payload: P) -> Result<()> {
        let failed = Cell::new(false);
        let decoder = self
            .chain
            .decoder(Box::new(input))
            .map_err(|e| Error::codec("decompress", format!("{}: {e}", self.chain.name())))?;
        let mut decoded = TrackedDecoder {
            inner: decoder,
            failed: &failed,
        };
        match self.inner.handle(&mut decoded, payload) {
            Err(error) if failed.get() => Err(Error::codec(
                "decompress",
                format!("{}: {error}", self.chain.name()),
            )),
            outcome => outcome,
        }
    }

    fn ensure_load_operation_started(&self, key: &CacheKey) {
        self.inner.ensure_load_operation_started(key);
    }

    fn record_load_hit(&self, key: &CacheKey, tier: Tier, size: u64) {
        self.inner.record_load_hit(key, tier, size);
    }

    fn record_load_miss(&self, key: &CacheKey) {
        self.inner.record_load_miss(key);
    }

    fn record_load_failure(&self, key: &CacheKey, error: &RemoteError) {
        self.inner.record_load_failure(key, error);
    }

    fn record_unpack_failure(&self, key: &CacheKey, error: &Error) {
        self.inner.record_unpack_failure(key, error);
    }
}

struct CompressingStoreHandler<'a, H: ?Sized> {
    inner: &'a H,
    chain: &'a CodecChain,
}

impl<P, H: StoreHandler<P> + ?Sized> StoreHandler<P> for CompressingStoreHandler<'_, H> {
    fn create_writer(&self, payload: &P) -> Result<Box<dyn EntryWriter>> {
        let writer = self.inner.create_writer(payload)?;
        self.chain.encode(writer)
    }

    fn ensure_store_operation_started(&self, key: &CacheKey) {
        self.inner.ensure_store_operation_started(key);
    }

    fn record_store_finished(&self, key: &CacheKey, stored: bool) {
        self.inner.record_store_finished(key, stored);
    }

    fn record_store_failure(&self, key: &CacheKey, error: &RemoteError) {
        self.inner.record_store_failure(key, error);
    }

    fn record_pack_failure(&self, key: &CacheKey, error: &Error) {
        self.inner.record_pack_failure(key, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::materialize;

    fn round_trip(chain: &CodecChain, content: &[u8]) -> Vec<u8> {
        let encoded = chain
            .encode(Box::new(BytesWriter::new(content.to_vec())))
            .unwrap();
        let bytes = materialize(encoded.as_ref()).unwrap();
        let mut decoded = Vec::new();
        chain
            .decoder(Box::new(&bytes[..]))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog\n".repeat(4000)
    }

    #[test]
    fn every_codec_round_trips() {
        for selection in [
            Compression::Gzip,
            Compression::Lz4,
            Compression::Lzf,
            Compression::Zstd,
        ] {
            let chain = CodecChain::from_config(&[selection]);
            assert_eq!(round_trip(&chain, &sample()), sample(), "{selection}");
            assert!(round_trip(&chain, b"").is_empty(), "{selection}");
        }
    }

    #[test]
    fn encoded_size_reflects_compressed_length() {
        let chain = CodecChain::from_config(&[Compression::Zstd]);
        let content = sample();
        let encoded = chain.encode(Box::new(BytesWriter::new(content.clone()))).unwrap();
        assert!(encoded.size() < content.len() as u64);
    }

    #[test]
    fn chained_codecs_decode_in_reverse() {
        let chain = CodecChain::from_config(&[Compression::Lz4, Compression::Gzip]);
        assert_eq!(chain.name(), "lz4+gzip");
        assert_eq!(round_trip(&chain, &sample()), sample());
    }

    #[test]
    fn none_is_identity() {
        let chain = CodecChain::from_config(&[Compression::None]);
        assert!(chain.is_empty());
        assert_eq!(round_trip(&chain, b"raw"), b"raw");
    }

    #[test]
    fn lzf_stores_incompressible_chunks_raw() {
        let noise: Vec<u8> = (0..70_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let chain = CodecChain::from_config(&[Compression::Lzf]);
        assert_eq!(round_trip(&chain, &noise), noise);
    }

    #[test]
    fn lzf_rejects_stream_cut_at_chunk_boundary() {
        // Two full chunks of compressible but non-repeating content
        let content: Vec<u8> = (0..160_000u32)
            .flat_map(|i| format!("{i:08}\n").into_bytes())
            .take(160_000)
            .collect();
        let encoded = LzfCodec
            .encode(&BytesWriter::new(content.clone()))
            .unwrap();
        let first_len = usize::from(u16::from_be_bytes([encoded[3], encoded[4]]));
        let second_chunk = if encoded[2] == LZF_COMPRESSED {
            7 + first_len
        } else {
            5 + first_len
        };
        assert_eq!(&encoded[second_chunk..second_chunk + 2], LZF_MAGIC);

        let mut out = Vec::new();
        let err = LzfCodec
            .decoder(Box::new(&encoded[..second_chunk]))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut full = Vec::new();
        LzfCodec
            .decoder(Box::new(&encoded[..]))
            .unwrap()
            .read_to_end(&mut full)
            .unwrap();
        assert_eq!(full, content);
    }

    #[test]
    fn lzf_rejects_foreign_data() {
        let mut out = Vec::new();
        let err = LzfCodec
            .decoder(Box::new(&b"not lzf"[..]))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn compression_names_parse_from_config() {
        #[derive(Deserialize)]
        struct Doc {
            compression: Vec<Compression>,
        }
        let doc: Doc = toml::from_str(r#"compression = ["zstd", "lzf", "none"]"#).unwrap();
        assert_eq!(
            doc.compression,
            vec![Compression::Zstd, Compression::Lzf, Compression::None]
        );
    }
}
