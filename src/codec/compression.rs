// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Optional at-rest compression of packed blobs

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::Result;

/// Compression level (0-4)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Fastest = 0,
    Fast = 1,
    #[default]
    Default = 2,
    Slow = 3,
    Slowest = 4,
}

impl CompressionLevel {
    pub fn to_zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 10,
            CompressionLevel::Slowest => 19,
        }
    }

    pub fn to_lz4_level(self) -> u32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 9,
            CompressionLevel::Slowest => 12,
        }
    }
}

/// Compression type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zstd,
}

/// Compresses blobs before they hit the backend and restores them on read
///
/// The blob size limit applies to the uncompressed payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobCompressor {
    compression_type: CompressionType,
    compression_level: CompressionLevel,
}

impl BlobCompressor {
    pub fn new(compression_type: CompressionType, compression_level: CompressionLevel) -> Self {
        Self {
            compression_type,
            compression_level,
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Lz4 => {
                let mut encoder = lz4::EncoderBuilder::new()
                    .level(self.compression_level.to_lz4_level())
                    .build(Vec::new())?;
                encoder.write_all(data)?;
                let (compressed, result) = encoder.finish();
                result?;
                Ok(compressed)
            }
            CompressionType::Zstd => Ok(zstd::encode_all(
                data,
                self.compression_level.to_zstd_level(),
            )?),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Lz4 => {
                let mut decoder = lz4::Decoder::new(data)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionType::Zstd => Ok(zstd::decode_all(data)?),
        }
    }
}
