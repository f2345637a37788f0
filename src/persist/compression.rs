//! Adaptive compression for persisted raftstate and snapshot blobs (spec
//! §4.4).
//!
//! `flate2`'s Deflate is used as a stand-in for the original's codec split
//! (see `networking/routing/serialization/binary.rs` in the teacher repo,
//! which does the same substitution): raftstate uses `Compression::fast()`
//! for low-latency ~2x ratio, snapshots use a middle level for ~3x.
//! Everything is framed behind a fixed header; reads fall back to treating
//! unheadered input as a legacy raw blob.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

const MAGIC: u32 = 0x4B_56_52_41; // "KVRA"
const MIN_COMPRESS_BYTES: usize = 512;
const MIN_RATIO: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Stored uncompressed (input too small, or compression didn't pay off).
    None = 0,
    /// Fast, low-latency codec for raftstate (~2x expected ratio).
    Fast = 1,
    /// Middle compression level for snapshots (~3x expected ratio).
    HighRatio = 2,
}

impl Codec {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Codec::None),
            1 => Some(Codec::Fast),
            2 => Some(Codec::HighRatio),
            _ => None,
        }
    }

    fn level(self) -> Compression {
        match self {
            Codec::None => Compression::none(),
            Codec::Fast => Compression::fast(),
            Codec::HighRatio => Compression::new(6),
        }
    }
}

const HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4;

struct Header {
    codec: Codec,
    level: u8,
    original_size: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4] = self.codec as u8;
        buf[5] = self.level;
        buf[6..8].copy_from_slice(&0u16.to_le_bytes());
        buf[8..12].copy_from_slice(&self.original_size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return None;
        }
        let codec = Codec::from_u8(buf[4])?;
        let level = buf[5];
        let original_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Some(Header {
            codec,
            level,
            original_size,
        })
    }
}

fn deflate(input: &[u8], level: Compression) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(input.len() / 2), level);
    encoder.write_all(input).expect("in-memory deflate cannot fail");
    encoder.finish().expect("in-memory deflate cannot fail")
}

fn inflate(input: &[u8], original_size: usize) -> Vec<u8> {
    let mut decoder = DeflateDecoder::new(input);
    let mut out = Vec::with_capacity(original_size);
    decoder
        .read_to_end(&mut out)
        .expect("persisted blob is corrupt: deflate stream did not decode");
    out
}

/// Compress `input` with `codec`, falling back to an uncompressed, headered
/// blob if the input is too small or compression doesn't clear
/// `MIN_RATIO`.
pub fn adaptive_compress(input: &[u8], codec: Codec) -> Vec<u8> {
    let (chosen, payload) = if input.len() < MIN_COMPRESS_BYTES || matches!(codec, Codec::None) {
        (Codec::None, input.to_vec())
    } else {
        let compressed = deflate(input, codec.level());
        if (compressed.len() as f64) * MIN_RATIO < input.len() as f64 {
            (codec, compressed)
        } else {
            (Codec::None, input.to_vec())
        }
    };

    let header = Header {
        codec: chosen,
        level: 0,
        original_size: input.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload);
    out
}

/// Decompress a blob produced by `adaptive_compress`. Falls back to
/// treating the whole input as a legacy, unheadered raw blob when no valid
/// header is present (spec §4.4 "Reads must accept unheadered legacy
/// payloads").
pub fn adaptive_decompress(input: &[u8]) -> Vec<u8> {
    let Some(header) = Header::decode(input) else {
        return input.to_vec();
    };
    let payload = &input[HEADER_LEN..];
    match header.codec {
        Codec::None => payload.to_vec(),
        _ => inflate(payload, header.original_size as usize),
    }
}

/// Running compression ratio/savings, exposed for observability (spec §10
/// "Compression statistics", grounded in the original's
/// `Persister::CompressionStats`).
#[derive(Default)]
pub struct CompressionStats {
    total_original_bytes: u64,
    total_compressed_bytes: u64,
    compression_count: u64,
}

impl CompressionStats {
    pub fn record(&mut self, original_len: usize, compressed_len: usize) {
        self.total_original_bytes += original_len as u64;
        self.total_compressed_bytes += compressed_len as u64;
        self.compression_count += 1;
    }

    pub fn ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            1.0
        } else {
            self.total_original_bytes as f64 / self.total_compressed_bytes as f64
        }
    }

    pub fn saved_bytes(&self) -> u64 {
        self.total_original_bytes
            .saturating_sub(self.total_compressed_bytes)
    }

    pub fn count(&self) -> u64 {
        self.compression_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_input_as_raw() {
        let input = b"hello world".to_vec();
        let compressed = adaptive_compress(&input, Codec::Fast);
        assert_eq!(adaptive_decompress(&compressed), input);
    }

    #[test]
    fn round_trips_compressible_input() {
        let input = "the quick brown fox jumps over the lazy dog. ".repeat(100);
        let compressed = adaptive_compress(input.as_bytes(), Codec::Fast);
        assert!(compressed.len() < input.len());
        assert_eq!(adaptive_decompress(&compressed), input.as_bytes());
    }

    #[test]
    fn high_ratio_codec_round_trips() {
        let input = "abcdabcdabcdabcdabcdabcd".repeat(200);
        let compressed = adaptive_compress(input.as_bytes(), Codec::HighRatio);
        assert_eq!(adaptive_decompress(&compressed), input.as_bytes());
    }

    #[test]
    fn legacy_raw_input_without_header_round_trips() {
        let legacy = b"raw bytes with no header at all, just written directly to disk".to_vec();
        assert_eq!(adaptive_decompress(&legacy), legacy);
    }

    #[test]
    fn pseudo_random_input_round_trips_regardless_of_compressibility() {
        // Whether or not this clears MIN_RATIO and gets stored compressed,
        // the round trip must be lossless either way.
        let input: Vec<u8> = (0..2000).map(|i| ((i * 2654435761u32) >> 24) as u8).collect();
        let compressed = adaptive_compress(&input, Codec::HighRatio);
        assert_eq!(adaptive_decompress(&compressed), input);
    }

    #[test]
    fn compression_stats_track_ratio_and_savings() {
        let mut stats = CompressionStats::default();
        stats.record(1000, 400);
        stats.record(2000, 800);
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.ratio(), 2.5);
        assert_eq!(stats.saved_bytes(), 1800);
    }
}
