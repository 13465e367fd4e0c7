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

//! Whole-partition verification: after the payload is applied, every target
//! partition is re-read from its block device and compared against the
//! post-image hash the manifest declared.

use std::fs::OpenOptions;

use log::{error, info};

use crate::boot_control::BootControl;
use crate::download::CancelToken;
use crate::errors::ErrorCode;
use crate::io::{digest_of_prefix, Sha256Digest};
use crate::payload::Manifest;

/// Hashes of the verified partitions, for consumers past the verify stage.
pub type VerifiedHashes = Vec<(String, Sha256Digest)>;

fn verification_error(name: &str) -> ErrorCode {
    if name.contains("kernel") || name.contains("boot") {
        ErrorCode::NewKernelVerificationError
    } else {
        ErrorCode::NewRootfsVerificationError
    }
}

/// Stream each target partition read-only and compare its digest to the
/// declared post-image hash.
pub fn verify_target_partitions(
    manifest: &Manifest,
    boot_control: &dyn BootControl,
    target_slot: u8,
    cancel: &CancelToken,
) -> Result<VerifiedHashes, ErrorCode> {
    let mut hashes = Vec::new();
    for partition in &manifest.partitions {
        if cancel.get() {
            return Err(ErrorCode::UserCanceled);
        }
        let name = &partition.partition_name;
        let device = boot_control
            .get_partition_device(name, target_slot)
            .map_err(|_| ErrorCode::FilesystemVerifierError)?;
        let mut f = OpenOptions::new().read(true).open(&device).map_err(|e| {
            error!("opening {} read-only: {e}", device.display());
            ErrorCode::FilesystemVerifierError
        })?;
        let digest = digest_of_prefix(&mut f, partition.new_partition_info.size).map_err(|e| {
            error!("hashing {}: {e:#}", device.display());
            ErrorCode::FilesystemVerifierError
        })?;
        if digest != partition.new_partition_info.hash {
            error!(
                "partition {name} on slot {target_slot} hashes to {digest}, expected {}",
                partition.new_partition_info.hash
            );
            return Err(verification_error(name));
        }
        info!("partition {name} verified on slot {target_slot}");
        hashes.push((name.clone(), digest));
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_control::fake::FakeBootControl;
    use crate::payload::{PartitionInfo, PartitionUpdate};
    use tempfile::TempDir;

    fn manifest_for(parts: Vec<(&str, Vec<u8>)>) -> (Manifest, FakeBootControl, TempDir) {
        let dir = TempDir::new().unwrap();
        let boot = FakeBootControl::new(0);
        let mut partitions = Vec::new();
        for (name, contents) in parts {
            let path = dir.path().join(format!("{name}_b"));
            std::fs::write(&path, &contents).unwrap();
            boot.set_partition_device(name, 1, path);
            partitions.push(PartitionUpdate {
                partition_name: name.to_string(),
                run_postinstall: false,
                postinstall_path: None,
                version: None,
                old_partition_info: None,
                new_partition_info: PartitionInfo {
                    size: contents.len() as u64,
                    hash: Sha256Digest::of_bytes(&contents).unwrap(),
                },
                operations: vec![],
            });
        }
        (
            Manifest {
                minor_version: 0,
                block_size: 4096,
                partitions,
                signatures_offset: None,
                signatures_size: None,
                max_timestamp: 0,
            },
            boot,
            dir,
        )
    }

    #[test]
    fn test_matching_partitions_verify() {
        let (manifest, boot, _dir) =
            manifest_for(vec![("boot", vec![1u8; 8192]), ("system", vec![2u8; 4096])]);
        let hashes =
            verify_target_partitions(&manifest, &boot, 1, &CancelToken::default()).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].0, "boot");
    }

    #[test]
    fn test_mismatch_maps_to_partition_error() {
        let (mut manifest, boot, _dir) = manifest_for(vec![("boot", vec![1u8; 4096])]);
        manifest.partitions[0].new_partition_info.hash = Sha256Digest::default();
        assert_eq!(
            verify_target_partitions(&manifest, &boot, 1, &CancelToken::default()).unwrap_err(),
            ErrorCode::NewKernelVerificationError
        );

        let (mut manifest, boot, _dir) = manifest_for(vec![("system", vec![1u8; 4096])]);
        manifest.partitions[0].new_partition_info.hash = Sha256Digest::default();
        assert_eq!(
            verify_target_partitions(&manifest, &boot, 1, &CancelToken::default()).unwrap_err(),
            ErrorCode::NewRootfsVerificationError
        );
    }

    #[test]
    fn test_missing_device_fails() {
        let (manifest, boot, _dir) = manifest_for(vec![("boot", vec![1u8; 4096])]);
        assert_eq!(
            verify_target_partitions(&manifest, &boot, 0, &CancelToken::default()).unwrap_err(),
            ErrorCode::FilesystemVerifierError
        );
    }

    #[test]
    fn test_cancel() {
        let (manifest, boot, _dir) = manifest_for(vec![("boot", vec![1u8; 4096])]);
        let cancel = CancelToken::default();
        cancel.set(true);
        assert_eq!(
            verify_target_partitions(&manifest, &boot, 1, &cancel).unwrap_err(),
            ErrorCode::UserCanceled
        );
    }
}
