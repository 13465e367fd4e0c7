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

//! RSA signature handling for payload metadata and the payload trailer.
//! A signature blob is a bincode-serialized [`Signatures`] record; each
//! entry is an RSA signature (PKCS1-v1_5 or PSS) over the SHA-256 of the
//! signed region.

use anyhow::{Context, Result};
use bincode::Options;
use log::{error, warn};
use openssl::md::Md;
use openssl::pkey::{PKey, Public};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Padding;
use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::io::{bincoder, Sha256Digest};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Signatures {
    pub sigs: Vec<Vec<u8>>,
}

pub fn decode_signatures(blob: &[u8]) -> Result<Signatures> {
    bincoder()
        .deserialize(blob)
        .context("deserializing signature blob")
}

pub fn encode_signatures(sigs: &Signatures) -> Vec<u8> {
    bincoder()
        .serialize(sigs)
        .expect("signature serialization is infallible")
}

/// Accepts a PEM or DER encoded RSA public key.
pub fn load_public_key(bytes: &[u8]) -> Result<PKey<Public>> {
    PKey::public_key_from_pem(bytes)
        .or_else(|_| PKey::public_key_from_der(bytes))
        .context("parsing RSA public key")
}

/// Key material as carried in the update response: base64 of PEM or DER.
pub fn load_public_key_base64(encoded: &str) -> Result<PKey<Public>> {
    let der = base64::decode(encoded.trim()).context("base64-decoding public key")?;
    load_public_key(&der)
}

fn verify_one(
    digest: &Sha256Digest,
    sig: &[u8],
    key: &PKey<Public>,
    padding: Padding,
) -> Result<bool> {
    let mut ctx = PkeyCtx::new(key).context("creating verify context")?;
    ctx.verify_init().context("initializing verify")?;
    ctx.set_rsa_padding(padding).context("setting padding")?;
    ctx.set_signature_md(Md::sha256())
        .context("setting signature digest")?;
    Ok(ctx.verify(&digest.0, sig).unwrap_or(false))
}

/// True if any signature in the blob verifies against `digest` with either
/// accepted padding scheme.
pub fn verify_signature_blob(
    blob: &[u8],
    digest: &Sha256Digest,
    key: &PKey<Public>,
) -> Result<bool> {
    let signatures = decode_signatures(blob)?;
    if signatures.sigs.is_empty() {
        warn!("signature blob contains no signatures");
        return Ok(false);
    }
    for sig in &signatures.sigs {
        for padding in [Padding::PKCS1, Padding::PKCS1_PSS] {
            if verify_one(digest, sig, key, padding)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Check the signature over the metadata region (header + manifest).
pub fn verify_metadata_signature(
    metadata: &[u8],
    sig_blob: &[u8],
    key: &PKey<Public>,
) -> Result<(), ErrorCode> {
    let digest = Sha256Digest::of_bytes(metadata).map_err(|e| {
        error!("hashing metadata: {e:#}");
        ErrorCode::DownloadMetadataSignatureError
    })?;
    match verify_signature_blob(sig_blob, &digest, key) {
        Ok(true) => Ok(()),
        Ok(false) => {
            error!("metadata signature does not verify");
            Err(ErrorCode::DownloadMetadataSignatureMismatch)
        }
        Err(e) => {
            error!("metadata signature malformed: {e:#}");
            Err(ErrorCode::DownloadMetadataSignatureError)
        }
    }
}

/// Check the payload-trailer signature against the digest of the whole
/// stream minus the trailer.
pub fn verify_payload_signature(
    sig_blob: &[u8],
    payload_digest: &Sha256Digest,
    key: &PKey<Public>,
) -> Result<(), ErrorCode> {
    match verify_signature_blob(sig_blob, payload_digest, key) {
        Ok(true) => Ok(()),
        _ => {
            error!("payload signature does not verify");
            Err(ErrorCode::DownloadPayloadPubKeyVerificationError)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_metadata_signature_verifies() {
        let key = generate_key();
        let metadata = b"header and manifest bytes";
        let digest = Sha256Digest::of_bytes(metadata).unwrap();
        let blob = sign_digest(&digest, &key.private);

        verify_metadata_signature(metadata, &blob, &key.public).unwrap();

        // tampered metadata
        assert_eq!(
            verify_metadata_signature(b"header and manifest bytez", &blob, &key.public)
                .unwrap_err(),
            ErrorCode::DownloadMetadataSignatureMismatch
        );

        // wrong key
        let other = generate_key();
        assert_eq!(
            verify_metadata_signature(metadata, &blob, &other.public).unwrap_err(),
            ErrorCode::DownloadMetadataSignatureMismatch
        );

        // garbage blob
        assert_eq!(
            verify_metadata_signature(metadata, b"junk", &key.public).unwrap_err(),
            ErrorCode::DownloadMetadataSignatureError
        );
    }

    #[test]
    fn test_payload_signature() {
        let key = generate_key();
        let digest = Sha256Digest::of_bytes(b"payload minus trailer").unwrap();
        let blob = sign_digest(&digest, &key.private);
        verify_payload_signature(&blob, &digest, &key.public).unwrap();

        let wrong = Sha256Digest::of_bytes(b"other payload").unwrap();
        assert_eq!(
            verify_payload_signature(&blob, &wrong, &key.public).unwrap_err(),
            ErrorCode::DownloadPayloadPubKeyVerificationError
        );
    }

    #[test]
    fn test_key_loading() {
        let key = generate_key();
        load_public_key(&key.public_pem).unwrap();
        let b64 = base64::encode(&key.public_pem);
        load_public_key_base64(&b64).unwrap();
        load_public_key(b"not a key").unwrap_err();
    }
}
