//! Gzip inflate/deflate with decompression bomb defenses.
//!
//! Inflation enforces three layers: a 10 MiB absolute cap on decompressed
//! size, a 100:1 ratio cap against the compressed input, and both checks
//! re-run on every read iteration so a bomb is cut off mid-stream rather
//! than after allocation.

use std::io::Read;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use thiserror::Error;

/// Absolute cap on decompressed output.
pub const MAX_DECOMPRESS_SIZE: usize = 10 * 1024 * 1024;

/// Maximum decompressed:compressed ratio.
pub const MAX_DECOMPRESS_RATIO: usize = 100;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum GzipError {
    #[error("decompression bomb: {0}")]
    Bomb(&'static str),
    #[error("gzip stream error: {0}")]
    Corrupt(#[from] std::io::Error),
}

impl GzipError {
    pub fn is_bomb(&self) -> bool {
        matches!(self, GzipError::Bomb(_))
    }
}

/// Inflate a gzip body, aborting on bomb heuristics.
pub fn inflate_guarded(input: &[u8]) -> Result<Vec<u8>, GzipError> {
    let mut decoder = GzDecoder::new(input);

    // 4x initial estimate, never reserving past the cap.
    let mut out = Vec::with_capacity((input.len() * 4).clamp(4096, MAX_DECOMPRESS_SIZE));
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = decoder.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);

        if out.len() > MAX_DECOMPRESS_SIZE {
            return Err(GzipError::Bomb("absolute size cap exceeded"));
        }
        if !input.is_empty() && out.len() / input.len() > MAX_DECOMPRESS_RATIO {
            return Err(GzipError::Bomb("compression ratio cap exceeded"));
        }
    }

    Ok(out)
}

/// Deflate a plain body back to gzip at the default level.
pub fn deflate(input: &[u8]) -> Result<Vec<u8>, GzipError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2 + 64), Compression::default());
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

// ── Tests ───────────────────────────────────────────────────────
