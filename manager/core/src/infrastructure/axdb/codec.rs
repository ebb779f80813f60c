// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Payload compression for oversized column values.
//!
//! Values are gzip-compressed and base64-encoded behind a `gz:` prefix so a
//! reader can tell a compressed value from a plain one.

use crate::domain::error::{codes, AxError, AxResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const COMPRESSED_PREFIX: &str = "gz:";

/// Values at or above this size are stored compressed.
pub const COMPRESSION_THRESHOLD: usize = 32 * 1024;

pub fn compress(data: &[u8]) -> AxResult<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "compression failed"))?;
    let bytes = encoder
        .finish()
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "compression failed"))?;
    Ok(format!("{}{}", COMPRESSED_PREFIX, STANDARD.encode(bytes)))
}

pub fn decompress(encoded: &str) -> AxResult<Vec<u8>> {
    let Some(body) = encoded.strip_prefix(COMPRESSED_PREFIX) else {
        return Err(AxError::new(codes::ERR_INTERNAL, "value is not compressed"));
    };
    let bytes = STANDARD
        .decode(body)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "invalid base64 in compressed value"))?;
    let mut out = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_end(&mut out)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "decompression failed"))?;
    Ok(out)
}

pub fn is_compressed(value: &str) -> bool {
    value.starts_with(COMPRESSED_PREFIX)
}

/// Compress `text` only when it crosses [`COMPRESSION_THRESHOLD`].
pub fn maybe_compress(text: String) -> AxResult<String> {
    if text.len() >= COMPRESSION_THRESHOLD {
        compress(text.as_bytes())
    } else {
        Ok(text)
    }
}

/// Inverse of [`maybe_compress`].
pub fn maybe_decompress(text: &str) -> AxResult<String> {
    if !is_compressed(text) {
        return Ok(text.to_string());
    }
    let bytes = decompress(text)?;
    String::from_utf8(bytes)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "decompressed value is not UTF-8"))
}
