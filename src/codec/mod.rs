//! Composable bytes-to-bytes transforms applied to snapshot bodies.
//!
//! A [`Pipeline`] runs its stages in order when encoding and in reverse when
//! decoding, so `[zlib, xor]` means "compress, then scramble" on the way out.

use std::io::{self, Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Failure inside one pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{stage} encode failed")]
    Encode {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{stage} decode failed")]
    Decode {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

/// A single transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    Zlib,
    Gzip,
    Zstd,
    Snappy,
    /// XOR with a keystream from a seeded PRNG. Obfuscation only; both ends
    /// must share the seed.
    Xor { seed: u64 },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
            Self::Xor { .. } => "xor",
        }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let stage = self.name();
        let wrap = |source| CodecError::Encode { stage, source };
        match self {
            Self::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(wrap)?;
                encoder.finish().map_err(wrap)
            }
            Self::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(wrap)?;
                encoder.finish().map_err(wrap)
            }
            Self::Zstd => zstd::encode_all(data, 0).map_err(wrap),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| wrap(io::Error::other(e))),
            Self::Xor { seed } => Ok(xor_keystream(*seed, data)),
        }
    }

    /// Reverses [`Transform::encode`]. Output larger than `limit` bytes is
    /// rejected without being fully inflated.
    pub fn decode(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let stage = self.name();
        let wrap = |source| CodecError::Decode { stage, source };
        let out = match self {
            Self::Zlib => read_capped(flate2::read::ZlibDecoder::new(data), limit).map_err(wrap)?,
            Self::Gzip => read_capped(flate2::read::GzDecoder::new(data), limit).map_err(wrap)?,
            Self::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(data).map_err(wrap)?;
                read_capped(decoder, limit).map_err(wrap)?
            }
            Self::Snappy => {
                let len = snap::raw::decompress_len(data).map_err(|e| wrap(io::Error::other(e)))?;
                if len > limit {
                    return Err(wrap(too_large(limit)));
                }
                snap::raw::Decoder::new()
                    .decompress_vec(data)
                    .map_err(|e| wrap(io::Error::other(e)))?
            }
            Self::Xor { seed } => xor_keystream(*seed, data),
        };

        if out.len() > limit {
            return Err(wrap(too_large(limit)));
        }
        Ok(out)
    }
}

/// Reads at most `limit + 1` bytes so an oversized stream is detected
/// without inflating the rest of it.
fn read_capped(reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(too_large(limit));
    }
    Ok(out)
}

fn too_large(limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("decoded body exceeds {limit} bytes"),
    )
}

fn xor_keystream(seed: u64, data: &[u8]) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    data.iter().map(|b| b ^ rng.gen::<u8>()).collect()
}

/// Ordered list of transforms. Empty means identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Transform>,
    max_decoded: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Transform>) -> Self {
        Self {
            stages,
            max_decoded: usize::MAX,
        }
    }

    /// Caps the size of every intermediate and final decoded buffer.
    pub fn with_max_decoded(mut self, limit: usize) -> Self {
        self.max_decoded = limit;
        self
    }

    pub fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut buf = data.to_vec();
        for stage in &self.stages {
            buf = stage.encode(&buf)?;
        }
        Ok(buf)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if self.stages.is_empty() && data.len() > self.max_decoded {
            return Err(CodecError::Decode {
                stage: "none",
                source: too_large(self.max_decoded),
            });
        }

        let mut buf = data.to_vec();
        for stage in self.stages.iter().rev() {
            buf = stage.decode(&buf, self.max_decoded)?;
        }
        Ok(buf)
    }

    /// Stage names joined for logging, e.g. `zlib+xor`.
    pub fn describe(&self) -> String {
        if self.stages.is_empty() {
            return "none".to_string();
        }
        self.stages
            .iter()
            .map(Transform::name)
            .collect::<Vec<_>>()
            .join("+")
    }
}
