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

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct Sha256Digest(pub [u8; 32]);

impl TryFrom<Hasher> for Sha256Digest {
    type Error = anyhow::Error;

    fn try_from(mut hasher: Hasher) -> Result<Self> {
        let digest = hasher.finish().context("finishing hash")?;
        Ok(Sha256Digest(
            digest.as_ref().try_into().context("converting to SHA256")?,
        ))
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", hex::encode(self.0))
    }
}

impl Sha256Digest {
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim()).context("decoding hex digest")?;
        Ok(Sha256Digest(
            bytes
                .as_slice()
                .try_into()
                .context("digest is not 32 bytes")?,
        ))
    }

    pub fn of_bytes(data: &[u8]) -> Result<Self> {
        let mut hasher = Sha256Hasher::new()?;
        hasher.write_all(data)?;
        hasher.digest()
    }
}

/// Streaming SHA-256 with a `Write` face, so hashing composes with the
/// copy helpers and `io::copy`.
pub struct Sha256Hasher {
    hasher: Hasher,
    count: u64,
}

impl Sha256Hasher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hasher: Hasher::new(MessageDigest::sha256()).context("creating SHA256 hasher")?,
            count: 0,
        })
    }

    /// Bytes hashed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn digest(self) -> Result<Sha256Digest> {
        self.hasher.try_into()
    }
}

impl Write for Sha256Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher
            .update(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hash the first `limit` bytes of `f` from its current position.
pub fn digest_of_prefix(f: &mut File, limit: u64) -> Result<Sha256Digest> {
    let mut hasher = Sha256Hasher::new()?;
    let mut buf = [0u8; 64 * 1024];
    super::copy_exactly_n(&mut f.take(limit), &mut hasher, limit, &mut buf)?;
    hasher.digest()
}
