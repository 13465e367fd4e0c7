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

//! Bootloader slot control.  The control block lives in a fixed region of
//! the misc partition; the write path must be atomic with respect to the
//! bootloader (old state or new state, never partial).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::io::Sha256Digest;

pub const NUM_SLOTS: u8 = 2;
/// Boot attempts granted to a freshly written slot before the bootloader
/// falls back.
pub const DEFAULT_BOOT_TRIES: u8 = 6;

const CONTROL_MAGIC: [u8; 4] = *b"ABcb";
const CONTROL_VERSION: u8 = 1;
const CONTROL_BLOCK_LEN: usize = 16;

const SLOT_FLAG_BOOTABLE: u8 = 1 << 0;
const SLOT_FLAG_SUCCESSFUL: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotMetadata {
    pub bootable: bool,
    pub successful_boot: bool,
    pub tries_remaining: u8,
}

/// In-memory image of the misc-partition control block.  The on-disk layout
/// is 16 bytes: magic, version, active slot, per-slot (flags, tries), pad,
/// then the first four bytes of the SHA-256 of everything before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub active_slot: u8,
    pub slots: [SlotMetadata; NUM_SLOTS as usize],
}

impl Default for ControlBlock {
    fn default() -> Self {
        // fresh device: slot 0 running and known good
        Self {
            active_slot: 0,
            slots: [
                SlotMetadata {
                    bootable: true,
                    successful_boot: true,
                    tries_remaining: 0,
                },
                SlotMetadata::default(),
            ],
        }
    }
}

impl ControlBlock {
    pub fn encode(&self) -> Result<[u8; CONTROL_BLOCK_LEN]> {
        let mut buf = [0u8; CONTROL_BLOCK_LEN];
        buf[0..4].copy_from_slice(&CONTROL_MAGIC);
        buf[4] = CONTROL_VERSION;
        buf[5] = self.active_slot;
        for (i, slot) in self.slots.iter().enumerate() {
            let mut flags = 0u8;
            if slot.bootable {
                flags |= SLOT_FLAG_BOOTABLE;
            }
            if slot.successful_boot {
                flags |= SLOT_FLAG_SUCCESSFUL;
            }
            buf[6 + i * 2] = flags;
            buf[7 + i * 2] = slot.tries_remaining;
        }
        let digest = Sha256Digest::of_bytes(&buf[..CONTROL_BLOCK_LEN - 4])?;
        buf[CONTROL_BLOCK_LEN - 4..].copy_from_slice(&digest.0[..4]);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTROL_BLOCK_LEN {
            bail!("control block truncated: {} bytes", buf.len());
        }
        if buf[0..4] != CONTROL_MAGIC {
            bail!("bad control block magic");
        }
        if buf[4] != CONTROL_VERSION {
            bail!("unsupported control block version {}", buf[4]);
        }
        let digest = Sha256Digest::of_bytes(&buf[..CONTROL_BLOCK_LEN - 4])?;
        if buf[CONTROL_BLOCK_LEN - 4..CONTROL_BLOCK_LEN] != digest.0[..4] {
            bail!("control block checksum mismatch");
        }
        let active_slot = buf[5];
        if active_slot >= NUM_SLOTS {
            bail!("active slot {active_slot} out of range");
        }
        let mut slots = [SlotMetadata::default(); NUM_SLOTS as usize];
        for (i, slot) in slots.iter_mut().enumerate() {
            let flags = buf[6 + i * 2];
            slot.bootable = flags & SLOT_FLAG_BOOTABLE != 0;
            slot.successful_boot = flags & SLOT_FLAG_SUCCESSFUL != 0;
            slot.tries_remaining = buf[7 + i * 2];
        }
        Ok(Self { active_slot, slots })
    }
}

pub trait BootControl {
    fn get_current_slot(&self) -> u8;
    /// Block device for `name` on `slot`, e.g. ("system", 1) → `system_b`.
    fn get_partition_device(&self, name: &str, slot: u8) -> Result<PathBuf>;
    fn set_active_boot_slot(&self, slot: u8) -> Result<()>;
    fn mark_slot_unbootable(&self, slot: u8) -> Result<()>;
    fn mark_boot_successful(&self) -> Result<()>;
}

pub struct MiscBootControl {
    misc_path: PathBuf,
    device_dir: PathBuf,
    current_slot: u8,
}

fn slot_suffix(slot: u8) -> &'static str {
    if slot == 0 {
        "a"
    } else {
        "b"
    }
}

impl MiscBootControl {
    pub fn new(misc_path: impl Into<PathBuf>, device_dir: impl Into<PathBuf>, current_slot: u8) -> Result<Self> {
        if current_slot >= NUM_SLOTS {
            bail!("current slot {current_slot} out of range");
        }
        Ok(Self {
            misc_path: misc_path.into(),
            device_dir: device_dir.into(),
            current_slot,
        })
    }

    pub fn read_control_block(&self) -> ControlBlock {
        match self.try_read_control_block() {
            Ok(block) => block,
            Err(e) => {
                warn!("reading control block: {e:#}; assuming defaults");
                ControlBlock::default()
            }
        }
    }

    fn try_read_control_block(&self) -> Result<ControlBlock> {
        let mut f = OpenOptions::new()
            .read(true)
            .open(&self.misc_path)
            .with_context(|| format!("opening {}", self.misc_path.display()))?;
        let mut buf = [0u8; CONTROL_BLOCK_LEN];
        f.read_exact(&mut buf).context("reading control block")?;
        ControlBlock::decode(&buf)
    }

    // The block fits in one sector, so the device sees either the old or
    // the new contents.  fdatasync before reporting success.
    fn write_control_block(&self, block: &ControlBlock) -> Result<()> {
        let buf = block.encode()?;
        let mut f = OpenOptions::new()
            .write(true)
            .open(&self.misc_path)
            .with_context(|| format!("opening {}", self.misc_path.display()))?;
        f.seek(SeekFrom::Start(0)).context("seeking misc device")?;
        f.write_all(&buf).context("writing control block")?;
        nix::unistd::fdatasync(f.as_raw_fd()).context("syncing control block")?;
        Ok(())
    }
}

impl BootControl for MiscBootControl {
    fn get_current_slot(&self) -> u8 {
        self.current_slot
    }

    fn get_partition_device(&self, name: &str, slot: u8) -> Result<PathBuf> {
        if slot >= NUM_SLOTS {
            bail!("slot {slot} out of range");
        }
        Ok(self
            .device_dir
            .join(format!("{name}_{}", slot_suffix(slot))))
    }

    fn set_active_boot_slot(&self, slot: u8) -> Result<()> {
        if slot >= NUM_SLOTS {
            bail!("slot {slot} out of range");
        }
        let mut block = self.read_control_block();
        block.active_slot = slot;
        block.slots[slot as usize] = SlotMetadata {
            bootable: true,
            successful_boot: false,
            tries_remaining: DEFAULT_BOOT_TRIES,
        };
        self.write_control_block(&block)?;
        info!("active boot slot set to {slot}");
        Ok(())
    }

    fn mark_slot_unbootable(&self, slot: u8) -> Result<()> {
        if slot == self.current_slot {
            bail!("refusing to mark the running slot unbootable");
        }
        let mut block = self.read_control_block();
        block.slots[slot as usize] = SlotMetadata::default();
        self.write_control_block(&block)
    }

    fn mark_boot_successful(&self) -> Result<()> {
        let mut block = self.read_control_block();
        let slot = &mut block.slots[self.current_slot as usize];
        slot.successful_boot = true;
        slot.tries_remaining = 0;
        self.write_control_block(&block)
    }
}

/// Parse the running slot from a kernel command line (`androidboot.slot_suffix=_a`
/// or `update_agent.slot=0` forms).
pub fn current_slot_from_cmdline(cmdline: &str) -> Option<u8> {
    for token in cmdline.split_ascii_whitespace() {
        if let Some(suffix) = token.strip_prefix("androidboot.slot_suffix=") {
            return match suffix {
                "_a" => Some(0),
                "_b" => Some(1),
                _ => None,
            };
        }
        if let Some(slot) = token.strip_prefix("update_agent.slot=") {
            return slot.parse::<u8>().ok().filter(|s| *s < NUM_SLOTS);
        }
    }
    None
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    pub struct FakeBootControl {
        pub current_slot: u8,
        pub block: RefCell<ControlBlock>,
        pub devices: RefCell<HashMap<(String, u8), PathBuf>>,
        pub fail_writes: std::cell::Cell<bool>,
    }

    impl FakeBootControl {
        pub fn new(current_slot: u8) -> Self {
            Self {
                current_slot,
                block: RefCell::new(ControlBlock::default()),
                devices: RefCell::new(HashMap::new()),
                fail_writes: std::cell::Cell::new(false),
            }
        }

        pub fn set_partition_device(&self, name: &str, slot: u8, path: impl Into<PathBuf>) {
            self.devices
                .borrow_mut()
                .insert((name.to_string(), slot), path.into());
        }
    }

    impl BootControl for FakeBootControl {
        fn get_current_slot(&self) -> u8 {
            self.current_slot
        }

        fn get_partition_device(&self, name: &str, slot: u8) -> Result<PathBuf> {
            self.devices
                .borrow()
                .get(&(name.to_string(), slot))
                .cloned()
                .with_context(|| format!("no device for {name} slot {slot}"))
        }

        fn set_active_boot_slot(&self, slot: u8) -> Result<()> {
            if self.fail_writes.get() {
                bail!("injected control block write failure");
            }
            let mut block = self.block.borrow_mut();
            block.active_slot = slot;
            block.slots[slot as usize] = SlotMetadata {
                bootable: true,
                successful_boot: false,
                tries_remaining: DEFAULT_BOOT_TRIES,
            };
            Ok(())
        }

        fn mark_slot_unbootable(&self, slot: u8) -> Result<()> {
            self.block.borrow_mut().slots[slot as usize] = SlotMetadata::default();
            Ok(())
        }

        fn mark_boot_successful(&self) -> Result<()> {
            let mut block = self.block.borrow_mut();
            let slot = &mut block.slots[self.current_slot as usize];
            slot.successful_boot = true;
            slot.tries_remaining = 0;
            Ok(())
        }
    }
}

/// Create an empty misc image suitable for [`MiscBootControl`].
pub fn format_misc_device(path: &Path) -> Result<()> {
    let buf = ControlBlock::default().encode()?;
    std::fs::write(path, buf).with_context(|| format!("formatting {}", path.display()))
}
