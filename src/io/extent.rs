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

use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

/// A run of blocks on a partition's block device.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

/// Marker start block for a hole.  Only valid in source extent lists; reads
/// produce zeroes.
pub const SPARSE_HOLE: u64 = u64::MAX;

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block,
            num_blocks,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.start_block == SPARSE_HOLE
    }
}

/// Total byte length of an extent list.
pub fn extents_size(extents: &[Extent], block_size: u64) -> u64 {
    extents
        .iter()
        .map(|e| e.num_blocks.saturating_mul(block_size))
        .sum()
}

/// Writes a byte stream across an ordered extent list, seeking the
/// destination device at each extent boundary.  Bytes fill extents in
/// declared order; writing past the last extent is an error.
pub struct ExtentWriter<'a, D: Write + Seek> {
    dev: &'a mut D,
    block_size: u64,
    extents: &'a [Extent],
    index: usize,
    offset_in_extent: u64,
}

impl<'a, D: Write + Seek> ExtentWriter<'a, D> {
    pub fn new(dev: &'a mut D, extents: &'a [Extent], block_size: u64) -> Self {
        Self {
            dev,
            block_size,
            extents,
            index: 0,
            offset_in_extent: 0,
        }
    }

    fn current_remaining(&self) -> Option<u64> {
        let extent = self.extents.get(self.index)?;
        Some(extent.num_blocks * self.block_size - self.offset_in_extent)
    }
}

impl<D: Write + Seek> Write for ExtentWriter<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let remaining = match self.current_remaining() {
                Some(n) => n,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "write past the last destination extent",
                    ))
                }
            };
            if remaining == 0 {
                self.index += 1;
                self.offset_in_extent = 0;
                continue;
            }
            let extent = &self.extents[self.index];
            if extent.is_sparse() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "sparse extent in destination list",
                ));
            }
            if self.offset_in_extent == 0 {
                self.dev.seek(SeekFrom::Start(extent.start_block * self.block_size))?;
            }
            let count = remaining.min(buf.len() as u64) as usize;
            let written = self.dev.write(&buf[..count])?;
            self.offset_in_extent += written as u64;
            return Ok(written);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dev.flush()
    }
}

/// Reads the bytes covered by an ordered extent list.  Sparse extents yield
/// zeroes without touching the device.
pub struct ExtentReader<'a, D: Read + Seek> {
    dev: &'a mut D,
    block_size: u64,
    extents: &'a [Extent],
    index: usize,
    offset_in_extent: u64,
}

impl<'a, D: Read + Seek> ExtentReader<'a, D> {
    pub fn new(dev: &'a mut D, extents: &'a [Extent], block_size: u64) -> Self {
        Self {
            dev,
            block_size,
            extents,
            index: 0,
            offset_in_extent: 0,
        }
    }
}

impl<D: Read + Seek> Read for ExtentReader<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let extent = match self.extents.get(self.index) {
                Some(e) => e,
                None => return Ok(0),
            };
            let remaining = extent.num_blocks * self.block_size - self.offset_in_extent;
            if remaining == 0 {
                self.index += 1;
                self.offset_in_extent = 0;
                continue;
            }
            let count = remaining.min(buf.len() as u64) as usize;
            if extent.is_sparse() {
                buf[..count].fill(0);
                self.offset_in_extent += count as u64;
                return Ok(count);
            }
            if self.offset_in_extent == 0 {
                self.dev.seek(SeekFrom::Start(extent.start_block * self.block_size))?;
            }
            let read = self.dev.read(&mut buf[..count])?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device ended inside a source extent",
                ));
            }
            self.offset_in_extent += read as u64;
            return Ok(read);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BLOCK: u64 = 4;

    #[test]
    fn test_extent_writer_ordering() {
        let mut dev = Cursor::new(vec![0u8; 40]);
        let extents = [Extent::new(5, 1), Extent::new(1, 2)];
        let mut writer = ExtentWriter::new(&mut dev, &extents, BLOCK);
        writer.write_all(&[1u8; 4]).unwrap();
        writer.write_all(&[2u8; 8]).unwrap();
        // all extents consumed
        writer.write_all(&[3u8; 1]).unwrap_err();

        let disk = dev.into_inner();
        assert_eq!(&disk[20..24], &[1u8; 4][..]);
        assert_eq!(&disk[4..12], &[2u8; 8][..]);
        assert_eq!(&disk[0..4], &[0u8; 4][..]);
    }

    #[test]
    fn test_extent_writer_split_writes() {
        let mut dev = Cursor::new(vec![0u8; 32]);
        let extents = [Extent::new(0, 1), Extent::new(4, 1)];
        let mut writer = ExtentWriter::new(&mut dev, &extents, BLOCK);
        // single write spanning both extents
        let data: Vec<u8> = (0..8).collect();
        writer.write_all(&data).unwrap();
        let disk = dev.into_inner();
        assert_eq!(&disk[0..4], &data[0..4]);
        assert_eq!(&disk[16..20], &data[4..8]);
    }

    #[test]
    fn test_extent_reader() {
        let mut disk = vec![0u8; 32];
        disk[8..12].copy_from_slice(&[7u8; 4]);
        disk[0..4].copy_from_slice(&[9u8; 4]);
        let mut dev = Cursor::new(disk);
        let extents = [
            Extent::new(2, 1),
            Extent::new(SPARSE_HOLE, 1),
            Extent::new(0, 1),
        ];
        let mut reader = ExtentReader::new(&mut dev, &extents, BLOCK);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(&out[0..4], &[7u8; 4][..]);
        assert_eq!(&out[4..8], &[0u8; 4][..]);
        assert_eq!(&out[8..12], &[9u8; 4][..]);
    }

    #[test]
    fn test_extents_size() {
        let extents = [Extent::new(0, 2), Extent::new(10, 3)];
        assert_eq!(extents_size(&extents, 4096), 5 * 4096);
    }
}
