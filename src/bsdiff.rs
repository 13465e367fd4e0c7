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

//! bspatch: reconstruct new partition bytes from source bytes plus a
//! BSDIFF40 patch.  The patch is a 32-byte header followed by three bzip2
//! streams (control tuples, diff block, extra block).  Control tuples
//! interleave diff-adds against the source with literal copies.

use std::io::Read;

use anyhow::{bail, Context, Result};
use bzip2::read::BzDecoder;

const MAGIC: &[u8; 8] = b"BSDIFF40";
const HEADER_SIZE: usize = 32;

// Sign-magnitude 64-bit little-endian, as written by bsdiff's offtout().
fn offtin(buf: &[u8; 8]) -> i64 {
    let mut value = (buf[7] & 0x7f) as i64;
    for b in buf[..7].iter().rev() {
        value = (value << 8) | *b as i64;
    }
    if buf[7] & 0x80 != 0 {
        -value
    } else {
        value
    }
}

fn read_tuple(ctrl: &mut impl Read) -> Result<Option<(i64, i64, i64)>> {
    let mut buf = [0u8; 8];
    match ctrl.read_exact(&mut buf) {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("reading control stream"),
    }
    let x = offtin(&buf);
    ctrl.read_exact(&mut buf).context("reading control stream")?;
    let y = offtin(&buf);
    ctrl.read_exact(&mut buf).context("reading control stream")?;
    let z = offtin(&buf);
    Ok(Some((x, y, z)))
}

/// Apply `patch` to `old`, producing the new bytes.
pub fn bspatch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    if patch.len() < HEADER_SIZE {
        bail!("patch shorter than header");
    }
    if &patch[..8] != MAGIC {
        bail!("bad patch magic");
    }
    let ctrl_len = offtin(patch[8..16].try_into().unwrap());
    let diff_len = offtin(patch[16..24].try_into().unwrap());
    let new_size = offtin(patch[24..32].try_into().unwrap());
    if ctrl_len < 0 || diff_len < 0 || new_size < 0 {
        bail!("negative length in patch header");
    }
    let ctrl_end = HEADER_SIZE
        .checked_add(ctrl_len as usize)
        .filter(|e| *e <= patch.len())
        .context("control block extends past patch")?;
    let diff_end = ctrl_end
        .checked_add(diff_len as usize)
        .filter(|e| *e <= patch.len())
        .context("diff block extends past patch")?;

    let mut ctrl = BzDecoder::new(&patch[HEADER_SIZE..ctrl_end]);
    let mut diff = BzDecoder::new(&patch[ctrl_end..diff_end]);
    let mut extra = BzDecoder::new(&patch[diff_end..]);

    let mut new = vec![0u8; new_size as usize];
    let mut newpos = 0usize;
    let mut oldpos = 0i64;
    while newpos < new.len() {
        let (add_len, copy_len, seek) = read_tuple(&mut ctrl)?
            .context("control stream ended before output was complete")?;
        if add_len < 0 || copy_len < 0 {
            bail!("negative run length in control tuple");
        }
        let add_len = add_len as usize;
        let copy_len = copy_len as usize;

        if newpos + add_len > new.len() {
            bail!("diff run overflows output");
        }
        diff.read_exact(&mut new[newpos..newpos + add_len])
            .context("reading diff block")?;
        for i in 0..add_len {
            let old_index = oldpos + i as i64;
            if old_index >= 0 && (old_index as usize) < old.len() {
                new[newpos + i] = new[newpos + i].wrapping_add(old[old_index as usize]);
            }
        }
        newpos += add_len;
        oldpos += add_len as i64;

        if newpos + copy_len > new.len() {
            bail!("extra run overflows output");
        }
        extra
            .read_exact(&mut new[newpos..newpos + copy_len])
            .context("reading extra block")?;
        newpos += copy_len;
        oldpos += seek;
    }
    Ok(new)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;

    fn offtout(value: i64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        let magnitude = value.unsigned_abs();
        for (i, b) in buf.iter_mut().enumerate().take(8) {
            *b = (magnitude >> (8 * i)) as u8;
        }
        buf[7] &= 0x7f;
        debug_assert!(magnitude >> 55 == 0, "magnitude too large for offtout");
        if value < 0 {
            buf[7] |= 0x80;
        }
        buf
    }

    fn bz(data: &[u8]) -> Vec<u8> {
        let mut enc = BzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Produce a valid patch from explicit control tuples and streams, for
    /// driving the patcher in tests.
    pub fn build_patch(
        tuples: &[(i64, i64, i64)],
        diff: &[u8],
        extra: &[u8],
        new_size: usize,
    ) -> Vec<u8> {
        let mut ctrl = Vec::new();
        for (x, y, z) in tuples {
            ctrl.extend_from_slice(&offtout(*x));
            ctrl.extend_from_slice(&offtout(*y));
            ctrl.extend_from_slice(&offtout(*z));
        }
        let ctrl = bz(&ctrl);
        let diff = bz(diff);
        let extra = bz(extra);

        let mut patch = Vec::new();
        patch.extend_from_slice(MAGIC);
        patch.extend_from_slice(&offtout(ctrl.len() as i64));
        patch.extend_from_slice(&offtout(diff.len() as i64));
        patch.extend_from_slice(&offtout(new_size as i64));
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);
        patch
    }

    /// Trivial patch emitting `new` as one literal run.
    pub fn literal_patch(new: &[u8]) -> Vec<u8> {
        build_patch(&[(0, new.len() as i64, 0)], &[], new, new.len())
    }
}
