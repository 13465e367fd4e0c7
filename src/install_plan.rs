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

//! Turning a parsed update response into the typed plan every downstream
//! stage consumes: URLs, payload descriptors, slots, and the rollback and
//! powerwash policy decisions.

use log::{info, warn};

use crate::boot_control::BootControl;
use crate::delta;
use crate::errors::ErrorCode;
use crate::hardware::{Hardware, ROLLFORWARD_INFINITY};
use crate::io::Sha256Digest;
use crate::omaha::{KeyVersion, OmahaRequestParams, OmahaResponse};
use crate::prefs::{Prefs, PrefsStorage, PREF_CHANNEL_ON_SLOT_PREFIX, PREF_UPDATE_CHECK_RESPONSE_HASH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Full,
    Delta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    pub payload_urls: Vec<String>,
    pub size: u64,
    pub metadata_size: u64,
    /// Base64 signature blob over the payload metadata.
    pub metadata_signature: String,
    pub hash: Sha256Digest,
    pub payload_type: PayloadType,
    pub fingerprint: String,
    pub app_id: String,
    pub can_exclude: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub version: String,
    pub download_url: String,
    pub payloads: Vec<PayloadInfo>,
    pub source_slot: u8,
    pub target_slot: u8,
    pub hash_checks_mandatory: bool,
    pub is_resume: bool,
    pub is_rollback: bool,
    pub powerwash_required: bool,
    pub rollback_data_save_requested: bool,
    /// Base64 DER/PEM, from the response.
    pub public_key_rsa: Option<String>,
    /// Local peer serving the same payload, if one was discovered.
    pub peer_url: Option<String>,
}

fn pack_key_version(v: Option<KeyVersion>) -> u32 {
    match v {
        Some(v) => ((v.key as u32) << 16) | (v.version as u32 & 0xffff),
        None => u32::MAX,
    }
}

/// Hash checks are mandatory on official URLs of official builds.  Dev and
/// test configurations are waived, except that a public key attached to the
/// response re-mandates checking.
fn hash_checks_mandatory(
    response: &OmahaResponse,
    params: &OmahaRequestParams,
    hardware: &dyn Hardware,
) -> bool {
    if !params.is_update_url_official() || !hardware.is_official_build() {
        if !response.public_key_rsa.is_empty() {
            info!("mandating payload hash checks: response carries a public key");
            return true;
        }
        warn!("waiving payload hash checks for unofficial update source");
        return false;
    }
    true
}

fn check_rollback_possible(
    response: &OmahaResponse,
    params: &OmahaRequestParams,
    hardware: &dyn Hardware,
) -> Result<(), ErrorCode> {
    if !params.rollback_allowed {
        warn!("response requests rollback but policy forbids it");
        return Err(ErrorCode::RollbackNotPossible);
    }
    let kernel = pack_key_version(response.rollback_kernel);
    let firmware = pack_key_version(response.rollback_firmware);
    if kernel == u32::MAX || firmware == u32::MAX {
        warn!("rollback response carries no key version information");
        return Err(ErrorCode::RollbackNotPossible);
    }
    let min_kernel = hardware.get_min_kernel_key_version();
    let min_firmware = hardware.get_min_firmware_key_version();
    if min_kernel >= 0 && kernel < min_kernel as u32 {
        warn!("rollback kernel key version {kernel:#x} below device minimum {min_kernel:#x}");
        return Err(ErrorCode::RollbackNotPossible);
    }
    if min_firmware >= 0 && firmware < min_firmware as u32 {
        warn!(
            "rollback firmware key version {firmware:#x} below device minimum {min_firmware:#x}"
        );
        return Err(ErrorCode::RollbackNotPossible);
    }
    Ok(())
}

/// Build the install plan for an update response.  `current_url` is the URL
/// the payload state selected; `peer_url` substitutes for it when P2P is in
/// play.
pub fn build_install_plan<S: PrefsStorage>(
    response: &OmahaResponse,
    params: &OmahaRequestParams,
    prefs: &mut Prefs<S>,
    hardware: &dyn Hardware,
    boot_control: &dyn BootControl,
    current_url: &str,
    peer_url: Option<&str>,
) -> Result<InstallPlan, ErrorCode> {
    if !response.update_exists {
        info!("there are no updates; aborting");
        return Err(ErrorCode::NoUpdate);
    }
    if current_url.is_empty() {
        return Err(ErrorCode::OmahaResponseInvalid);
    }

    let mut download_url = current_url.to_string();
    if let Some(peer) = peer_url {
        info!("replacing URL {download_url} with local peer URL {peer}");
        download_url = peer.to_string();
    }

    let mut payloads = Vec::new();
    let mut response_hash = String::new();
    for package in &response.packages {
        let hash = Sha256Digest::from_hex(&package.hash_sha256).map_err(|_| {
            warn!("package hash is not valid hex: {:?}", package.hash_sha256);
            ErrorCode::OmahaResponseInvalid
        })?;
        payloads.push(PayloadInfo {
            payload_urls: response
                .payload_urls
                .iter()
                .map(|base| format!("{base}{}", package.name))
                .collect(),
            size: package.size,
            metadata_size: package.metadata_size,
            metadata_signature: package.metadata_signature.clone(),
            hash,
            payload_type: if package.is_delta {
                PayloadType::Delta
            } else {
                PayloadType::Full
            },
            fingerprint: package.fp.clone(),
            app_id: response.app_id.clone(),
            can_exclude: package.can_exclude,
        });
        response_hash.push_str(&package.hash_sha256);
        response_hash.push(':');
    }

    let source_slot = boot_control.get_current_slot();
    let target_slot = 1 - source_slot;

    let mut plan = InstallPlan {
        version: response.version.clone(),
        download_url,
        payloads,
        source_slot,
        target_slot,
        hash_checks_mandatory: hash_checks_mandatory(response, params, hardware),
        is_resume: false,
        is_rollback: false,
        powerwash_required: response.powerwash_required,
        rollback_data_save_requested: false,
        public_key_rsa: if response.public_key_rsa.is_empty() {
            None
        } else {
            Some(response.public_key_rsa.clone())
        },
        peer_url: peer_url.map(str::to_string),
    };

    if response.is_rollback {
        check_rollback_possible(response, params, hardware)?;
        plan.is_rollback = true;
        plan.powerwash_required = true;
        plan.rollback_data_save_requested = true;
    }

    // Resume against the previous response iff its signature hash matches;
    // otherwise wipe progress and anchor the new hash.
    plan.is_resume = delta::can_resume_update(prefs, &response_hash);
    if plan.is_resume {
        info!("resuming interrupted download of {}", plan.version);
    } else {
        if let Err(e) = delta::reset_update_progress(prefs) {
            warn!("unable to reset update progress: {e:#}");
        }
        if let Err(e) = prefs.set_string(PREF_UPDATE_CHECK_RESPONSE_HASH, &response_hash) {
            warn!("unable to save the update check response hash: {e:#}");
        }
    }

    // Tag the target slot with the channel it was downloaded from, for the
    // next boot.
    let channel_key = format!("{PREF_CHANNEL_ON_SLOT_PREFIX}-{target_slot}");
    if let Err(e) = prefs.set_string(&channel_key, &params.target_channel) {
        warn!("unable to record channel for slot {target_slot}: {e:#}");
    }

    Ok(plan)
}

/// Clamp the verified-boot roll-forward limit after a successful response:
/// with rollback enabled the device's current minimum kernel key version is
/// frozen, otherwise the limit opens to infinity.  The response never feeds
/// the clamp; the floor must come from the device itself.
pub fn clamp_kernel_rollforward(rollback_allowed: bool, hardware: &dyn Hardware) {
    let value = if rollback_allowed {
        let min_kernel = hardware.get_min_kernel_key_version();
        if min_kernel < 0 {
            warn!("device minimum kernel key version unavailable; leaving roll-forward limit unchanged");
            return;
        }
        min_kernel
    } else {
        ROLLFORWARD_INFINITY
    };
    if let Err(e) = hardware.set_max_kernel_key_rollforward(value) {
        warn!("setting kernel max rollforward: {e:#}");
    }
}
