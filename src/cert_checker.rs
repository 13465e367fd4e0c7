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

//! Certificate-change detection.  Rotation is an expected event; observing
//! it is a metric, never a handshake failure.

use anyhow::{Context, Result};
use log::{info, warn};
use openssl::hash::MessageDigest;
use openssl::x509::X509;

use crate::metrics::MetricsReporter;
use crate::prefs::{Prefs, PrefsStorage, PREF_CERTIFICATE_PREFIX};

/// Which TLS server a certificate was presented by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerToCheck {
    Update,
    Download,
}

impl ServerToCheck {
    fn pref_name(self) -> &'static str {
        match self {
            ServerToCheck::Update => "update",
            ServerToCheck::Download => "download",
        }
    }
}

/// Outcome of one certificate observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertObservation {
    FirstSeen,
    Unchanged,
    Changed,
}

pub struct CertificateChecker;

impl CertificateChecker {
    /// Record the certificate presented at `depth` in the chain.  The first
    /// observation is stored silently; later changes are persisted and
    /// reported, but never rejected.
    pub fn observe<S: PrefsStorage>(
        prefs: &mut Prefs<S>,
        metrics: &dyn MetricsReporter,
        server: ServerToCheck,
        depth: u32,
        cert_der: &[u8],
    ) -> Result<CertObservation> {
        let cert = X509::from_der(cert_der).context("parsing presented certificate")?;
        let digest = cert
            .digest(MessageDigest::sha256())
            .context("hashing certificate")?;
        let digest = hex::encode(digest.as_ref());

        let key = format!("{PREF_CERTIFICATE_PREFIX}-{}-{depth}", server.pref_name());
        let stored = prefs.get_string(&key).unwrap_or(None);
        let observation = match stored.as_deref() {
            None => CertObservation::FirstSeen,
            Some(old) if old == digest => CertObservation::Unchanged,
            Some(_) => CertObservation::Changed,
        };
        match observation {
            CertObservation::Unchanged => (),
            CertObservation::FirstSeen => {
                prefs
                    .set_string(&key, &digest)
                    .context("storing certificate digest")?;
            }
            CertObservation::Changed => {
                info!(
                    "certificate changed for {:?} server at depth {depth}",
                    server
                );
                metrics.report_certificate_changed(server.pref_name(), depth);
                if let Err(e) = prefs.set_string(&key, &digest) {
                    warn!("storing rotated certificate digest: {e:#}");
                }
            }
        }
        Ok(observation)
    }
}
