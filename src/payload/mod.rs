// Copyright 2022 CoreOS, Inc.
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

//! Binary payload container.  Framing is big-endian:
//!
//! ```text
//! char     magic[4] = "CrAU";
//! uint64   major_version;
//! uint64   manifest_size;
//! uint32   metadata_signature_size;   // major version >= 2 only
//! char     manifest[manifest_size];
//! char     metadata_signature[metadata_signature_size];
//! char     blobs[];                   // operation data, then signature trailer
//! ```
//!
//! The manifest itself is a bincode-serialized record (varint,
//! little-endian, same options as [`crate::io::bincoder`]).  That encoding
//! is stable across versions; changes bump the manifest minor version.

use bincode::Options;
use log::error;
use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::io::{bincoder, Extent, Sha256Digest};

pub mod signature;

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

pub const MAJOR_VERSION_V1: u64 = 1;
pub const MAJOR_VERSION_V2: u64 = 2;

/// Minor version declared by full payloads (no source slot consulted).
pub const FULL_PAYLOAD_MINOR_VERSION: u64 = 0;
/// Minor version for delta payloads using the opcode subset we implement.
pub const DELTA_PAYLOAD_MINOR_VERSION: u64 = 2;

pub const SUPPORTED_MINOR_VERSIONS: &[u64] =
    &[FULL_PAYLOAD_MINOR_VERSION, DELTA_PAYLOAD_MINOR_VERSION];

/// Largest manifest we'll buffer before giving up on a response as garbage.
pub const MAX_MANIFEST_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub major_version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
    /// Framing bytes before the manifest.
    pub header_size: usize,
}

impl PayloadHeader {
    /// Bytes needed before [`parse_header`] can run, by framing version.
    pub const V1_SIZE: usize = 20;
    pub const V2_SIZE: usize = 24;

    /// Everything up to and including the manifest: the region covered by
    /// the metadata signature.
    pub fn metadata_size(&self) -> u64 {
        self.header_size as u64 + self.manifest_size
    }

    /// Offset of the first blob byte.
    pub fn blobs_offset(&self) -> u64 {
        self.metadata_size() + self.metadata_signature_size as u64
    }
}

fn be_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().unwrap())
}

/// Parse the container framing.  `bytes` must hold at least
/// [`PayloadHeader::V2_SIZE`] bytes (v1 payloads ignore the trailing word).
pub fn parse_header(bytes: &[u8]) -> Result<PayloadHeader, ErrorCode> {
    if bytes.len() < PayloadHeader::V1_SIZE {
        return Err(ErrorCode::DownloadInvalidMetadataSize);
    }
    if &bytes[..4] != PAYLOAD_MAGIC {
        return Err(ErrorCode::DownloadInvalidMetadataMagicString);
    }
    let major_version = be_u64(&bytes[4..]);
    let manifest_size = be_u64(&bytes[12..]);
    if manifest_size == 0 || manifest_size > MAX_MANIFEST_SIZE {
        return Err(ErrorCode::DownloadInvalidMetadataSize);
    }
    match major_version {
        MAJOR_VERSION_V1 => Ok(PayloadHeader {
            major_version,
            manifest_size,
            metadata_signature_size: 0,
            header_size: PayloadHeader::V1_SIZE,
        }),
        MAJOR_VERSION_V2 => {
            if bytes.len() < PayloadHeader::V2_SIZE {
                return Err(ErrorCode::DownloadInvalidMetadataSize);
            }
            Ok(PayloadHeader {
                major_version,
                manifest_size,
                metadata_signature_size: be_u32(&bytes[20..]),
                header_size: PayloadHeader::V2_SIZE,
            })
        }
        other => {
            error!("unsupported payload major version {other}");
            Err(ErrorCode::UnsupportedMajorPayloadVersion)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Replace,
    ReplaceBz,
    ReplaceXz,
    Move,
    Bsdiff,
    Puffdiff,
    BrotliBsdiff,
    Zero,
    Discard,
}

impl OperationType {
    /// Whether the operation carries bytes in the blob stream.
    pub fn has_data(self) -> bool {
        !matches!(self, OperationType::Move | OperationType::Zero | OperationType::Discard)
    }

    /// Whether the operation reads the source slot.
    pub fn reads_source(self) -> bool {
        matches!(
            self,
            OperationType::Move
                | OperationType::Bsdiff
                | OperationType::Puffdiff
                | OperationType::BrotliBsdiff
        )
    }

    fn supported(self) -> bool {
        !matches!(self, OperationType::Puffdiff | OperationType::BrotliBsdiff)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallOperation {
    pub op_type: OperationType,
    /// Position of this operation's bytes in the blob stream, relative to
    /// the start of the blobs.
    pub data_offset: u64,
    pub data_length: u64,
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    /// SHA-256 of the `data_length` blob bytes.
    pub data_sha256: Option<Sha256Digest>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub size: u64,
    pub hash: Sha256Digest,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionUpdate {
    pub partition_name: String,
    pub run_postinstall: bool,
    /// Path of the post-install binary, relative to the partition root.
    pub postinstall_path: Option<String>,
    /// Build timestamp carried for downgrade protection; decimal string.
    pub version: Option<String>,
    /// Pre-image state; present for delta payloads.
    pub old_partition_info: Option<PartitionInfo>,
    pub new_partition_info: PartitionInfo,
    pub operations: Vec<InstallOperation>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub minor_version: u64,
    pub block_size: u64,
    pub partitions: Vec<PartitionUpdate>,
    /// Payload-signature trailer position in the blob stream.
    pub signatures_offset: Option<u64>,
    pub signatures_size: Option<u64>,
    /// Maximum build timestamp this payload may be applied over.
    pub max_timestamp: i64,
}

pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest, ErrorCode> {
    bincoder().deserialize(bytes).map_err(|e| {
        error!("manifest deserialization failed: {e}");
        ErrorCode::DownloadManifestParseError
    })
}

pub fn serialize_manifest(manifest: &Manifest) -> Vec<u8> {
    bincoder()
        .serialize(manifest)
        .expect("manifest serialization is infallible")
}

impl Manifest {
    /// Reject payloads we can't apply before any blob is streamed: unknown
    /// minor versions, opcodes we don't implement, delta operations in a
    /// full payload, and geometry that would overflow byte offsets.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if !SUPPORTED_MINOR_VERSIONS.contains(&self.minor_version) {
            error!("unsupported manifest minor version {}", self.minor_version);
            return Err(ErrorCode::UnsupportedMinorPayloadVersion);
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ErrorCode::DownloadManifestParseError);
        }
        for partition in &self.partitions {
            // block arithmetic must stay within 63 bits
            if partition.new_partition_info.size > i64::MAX as u64 {
                return Err(ErrorCode::DownloadOperationExecutionError);
            }
            if partition.new_partition_info.size == 0 {
                return Err(ErrorCode::DownloadNewPartitionInfoError);
            }
            for op in &partition.operations {
                if !op.op_type.supported() {
                    error!(
                        "operation {:?} not supported in this build",
                        op.op_type
                    );
                    return Err(ErrorCode::UnsupportedMinorPayloadVersion);
                }
                if op.op_type.reads_source()
                    && self.minor_version == FULL_PAYLOAD_MINOR_VERSION
                {
                    return Err(ErrorCode::UnsupportedMinorPayloadVersion);
                }
                if op.op_type.has_data() && op.data_length == 0 {
                    return Err(ErrorCode::DownloadManifestParseError);
                }
                if !op.op_type.has_data() && op.data_length != 0 {
                    return Err(ErrorCode::DownloadManifestParseError);
                }
                if op.dst_extents.is_empty() {
                    return Err(ErrorCode::DownloadManifestParseError);
                }
            }
        }
        Ok(())
    }

    /// Operation blob cursors must be laid out back to back; the performer
    /// depends on it for resumption bookkeeping.
    pub fn validate_blob_layout(&self) -> Result<(), ErrorCode> {
        let mut cursor = 0u64;
        for partition in &self.partitions {
            for op in &partition.operations {
                if !op.op_type.has_data() {
                    continue;
                }
                if op.data_offset != cursor {
                    error!(
                        "operation data at {} but cursor at {cursor}",
                        op.data_offset
                    );
                    return Err(ErrorCode::DownloadManifestParseError);
                }
                cursor = cursor
                    .checked_add(op.data_length)
                    .ok_or(ErrorCode::DownloadManifestParseError)?;
            }
        }
        if let Some(offset) = self.signatures_offset {
            if offset != cursor {
                return Err(ErrorCode::DownloadManifestParseError);
            }
        }
        Ok(())
    }
}
