// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::io::Write;

use derive_more::Display;
use zstd::stream::write::Encoder;

use crate::datum::FileFormat;
use crate::errors::{DecodeError, EncodeError};
use crate::format::VERSION_KEY;

pub const COMPRESSION_KEY: &str = "compression";

/// Compression applied to a marshalled batch before it leaves the serializer.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum Compression {
    #[default]
    #[display("snappy")]
    Snappy,
    #[display("zstd")]
    Zstd,
}

impl Compression {
    /// Batches written without a `compression` key are snappy.
    pub fn from_meta(meta: &HashMap<String, String>) -> Result<Self, DecodeError> {
        match meta.get(COMPRESSION_KEY).map(String::as_str) {
            None | Some("") => Ok(Compression::Snappy),
            Some(value) => [Compression::Snappy, Compression::Zstd]
                .into_iter()
                .find(|c| c.to_string() == value)
                .ok_or_else(|| DecodeError::UnknownCompression(value.to_string())),
        }
    }

    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, EncodeError> {
        match self {
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(raw)
                .map_err(|e| EncodeError::Compress(e.to_string())),
            Compression::Zstd => {
                let mut encoder =
                    Encoder::new(Vec::new(), 0).map_err(|e| EncodeError::Compress(e.to_string()))?;
                encoder
                    .write_all(raw)
                    .map_err(|e| EncodeError::Compress(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| EncodeError::Compress(e.to_string()))
            }
        }
    }

    pub fn decompress(&self, buf: &[u8]) -> Result<Vec<u8>, DecodeError> {
        match self {
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(buf)
                .map_err(|e| DecodeError::Decompress(e.to_string())),
            Compression::Zstd => {
                zstd::stream::decode_all(buf).map_err(|e| DecodeError::Decompress(e.to_string()))
            }
        }
    }
}

/// A compressed batch travelling from the serializer to the network client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    pub meta: HashMap<String, String>,
    pub buf: Vec<u8>,
}

impl EncodedBatch {
    /// Compresses a marshalled buffer and records the compression in `meta`.
    pub fn encode(
        mut meta: HashMap<String, String>,
        raw: &[u8],
        compression: Compression,
    ) -> Result<Self, EncodeError> {
        let buf = compression.compress(raw)?;
        meta.insert(COMPRESSION_KEY.to_string(), compression.to_string());
        Ok(Self { meta, buf })
    }

    /// Checks the version tag and returns the decompressed record stream.
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        match self.meta.get(VERSION_KEY) {
            Some(v) if FileFormat::parse(v) == Some(FileFormat::V2) => {}
            Some(v) => return Err(DecodeError::UnsupportedVersion(v.clone())),
            None => return Err(DecodeError::UnsupportedVersion(String::new())),
        }
        Compression::from_meta(&self.meta)?.decompress(&self.buf)
    }
}
