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

//! Platform hardware abstraction consumed by the pipeline.  The real
//! implementation reads marker files and firmware-exported state from a
//! configurable root so tests can point it at a tempdir.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::errors::ErrorCode;

/// Sentinel accepted by the bootloader meaning "no roll-forward limit".
pub const ROLLFORWARD_INFINITY: i32 = 0xfffffffe_u32 as i32;

/// Contents understood by the recovery when it finds the powerwash marker.
pub const POWERWASH_COMMAND: &str = "safe fast keepimg reason=update-agent\n";
/// Marker requesting preservation of rollback data during the wipe.
pub const ROLLBACK_SAVE_COMMAND: &str = "save_rollback_data\n";

const POWERWASH_MARKER_FILE: &str = "factory_install_reset";
const ROLLBACK_SAVE_MARKER_FILE: &str = ".save_rollback_data";
const HWID_OVERRIDE_FILE: &str = "hwid_override";

pub trait Hardware {
    fn is_official_build(&self) -> bool;
    fn is_normal_boot_mode(&self) -> bool;
    fn is_oobe_enabled(&self) -> bool;
    /// Whether the out-of-box setup flow finished, and when.
    fn is_oobe_complete(&self) -> (bool, Option<SystemTime>);
    fn get_hardware_class(&self) -> String;
    /// -1 means unavailable.
    fn get_min_kernel_key_version(&self) -> i32;
    fn get_min_firmware_key_version(&self) -> i32;
    fn get_max_kernel_key_rollforward(&self) -> i32;
    fn set_max_kernel_key_rollforward(&self, version: i32) -> Result<()>;
    /// -1 means unknown.
    fn get_powerwash_count(&self) -> i32;
    fn schedule_powerwash(&self, save_rollback_data: bool) -> Result<()>;
    fn cancel_powerwash(&self) -> Result<()>;
    /// 0 means unknown.
    fn get_build_timestamp(&self) -> i64;
    fn get_version_for_logging(&self, partition_name: &str) -> String;
    /// Downgrade protection per partition: rejects payloads older than the
    /// running build.
    fn is_partition_update_valid(&self, partition_name: &str, new_version: &str) -> ErrorCode;
}

/// File-backed hardware state rooted at a stateful directory.
pub struct RealHardware {
    stateful_dir: PathBuf,
    official_build: bool,
    normal_boot_mode: bool,
    oobe_enabled: bool,
    hardware_class: String,
    build_timestamp: i64,
}

impl RealHardware {
    pub fn new(
        stateful_dir: impl Into<PathBuf>,
        official_build: bool,
        hardware_class: String,
        build_timestamp: i64,
    ) -> Self {
        Self {
            stateful_dir: stateful_dir.into(),
            official_build,
            normal_boot_mode: true,
            oobe_enabled: true,
            hardware_class,
            build_timestamp,
        }
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.stateful_dir.join(name)
    }

    fn read_i32(&self, name: &str, default: i32) -> i32 {
        match fs::read_to_string(self.marker(name)) {
            Ok(s) => s.trim().parse().unwrap_or(default),
            Err(_) => default,
        }
    }
}

impl Hardware for RealHardware {
    fn is_official_build(&self) -> bool {
        self.official_build
    }

    fn is_normal_boot_mode(&self) -> bool {
        self.normal_boot_mode
    }

    fn is_oobe_enabled(&self) -> bool {
        self.oobe_enabled
    }

    fn is_oobe_complete(&self) -> (bool, Option<SystemTime>) {
        match fs::metadata(self.marker(".oobe_completed")) {
            Ok(meta) => (true, meta.modified().ok()),
            Err(_) => (false, None),
        }
    }

    fn get_hardware_class(&self) -> String {
        // a sideloaded override beats the factory-provisioned class
        match fs::read_to_string(self.marker(HWID_OVERRIDE_FILE)) {
            Ok(hwid) => hwid.trim().to_string(),
            Err(_) => self.hardware_class.clone(),
        }
    }

    fn get_min_kernel_key_version(&self) -> i32 {
        self.read_i32("kernel_key_version", -1)
    }

    fn get_min_firmware_key_version(&self) -> i32 {
        self.read_i32("firmware_key_version", -1)
    }

    fn get_max_kernel_key_rollforward(&self) -> i32 {
        self.read_i32("kernel_max_rollforward", ROLLFORWARD_INFINITY)
    }

    fn set_max_kernel_key_rollforward(&self, version: i32) -> Result<()> {
        fs::write(self.marker("kernel_max_rollforward"), version.to_string())
            .context("writing kernel_max_rollforward")
    }

    fn get_powerwash_count(&self) -> i32 {
        self.read_i32("powerwash_count", -1)
    }

    fn schedule_powerwash(&self, save_rollback_data: bool) -> Result<()> {
        fs::write(self.marker(POWERWASH_MARKER_FILE), POWERWASH_COMMAND)
            .context("creating powerwash marker")?;
        info!("powerwash scheduled for next reboot");
        if save_rollback_data {
            fs::write(self.marker(ROLLBACK_SAVE_MARKER_FILE), ROLLBACK_SAVE_COMMAND)
                .context("creating rollback-data-save marker")?;
        }
        Ok(())
    }

    fn cancel_powerwash(&self) -> Result<()> {
        for name in [POWERWASH_MARKER_FILE, ROLLBACK_SAVE_MARKER_FILE] {
            match fs::remove_file(self.marker(name)) {
                Ok(()) => info!("removed {name}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e).with_context(|| format!("removing {name}")),
            }
        }
        Ok(())
    }

    fn get_build_timestamp(&self) -> i64 {
        self.build_timestamp
    }

    fn get_version_for_logging(&self, partition_name: &str) -> String {
        let path = self
            .stateful_dir
            .join(format!("version_{partition_name}"));
        fs::read_to_string(path).unwrap_or_default().trim().to_string()
    }

    fn is_partition_update_valid(&self, partition_name: &str, new_version: &str) -> ErrorCode {
        let current = self.get_version_for_logging(partition_name);
        let current: i64 = current.parse().unwrap_or(0);
        let new: i64 = match new_version.parse() {
            Ok(v) => v,
            Err(_) => return ErrorCode::PayloadTimestampError,
        };
        if current == 0 {
            // unknown local build timestamp: nothing to enforce against
            warn!("no build timestamp recorded for {partition_name}; accepting payload");
            return ErrorCode::Success;
        }
        if new == 0 || new < current {
            return ErrorCode::PayloadTimestampError;
        }
        ErrorCode::Success
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::Cell;
    use std::cell::RefCell;

    /// Settable hardware state for tests.
    pub struct FakeHardware {
        pub official_build: Cell<bool>,
        pub normal_boot_mode: Cell<bool>,
        pub oobe_enabled: Cell<bool>,
        pub oobe_complete: Cell<bool>,
        pub hardware_class: RefCell<String>,
        pub min_kernel_key_version: Cell<i32>,
        pub min_firmware_key_version: Cell<i32>,
        pub max_kernel_key_rollforward: Cell<i32>,
        pub powerwash_count: Cell<i32>,
        pub powerwash_scheduled: Cell<bool>,
        pub rollback_save_scheduled: Cell<bool>,
        pub build_timestamp: Cell<i64>,
        pub partition_timestamps: RefCell<std::collections::HashMap<String, i64>>,
    }

    impl FakeHardware {
        pub fn new() -> Self {
            Self {
                official_build: Cell::new(true),
                normal_boot_mode: Cell::new(true),
                oobe_enabled: Cell::new(true),
                oobe_complete: Cell::new(true),
                hardware_class: RefCell::new("FAKE-HWID A1B-C2D".to_string()),
                min_kernel_key_version: Cell::new(-1),
                min_firmware_key_version: Cell::new(-1),
                max_kernel_key_rollforward: Cell::new(ROLLFORWARD_INFINITY),
                powerwash_count: Cell::new(-1),
                powerwash_scheduled: Cell::new(false),
                rollback_save_scheduled: Cell::new(false),
                build_timestamp: Cell::new(0),
                partition_timestamps: RefCell::new(Default::default()),
            }
        }
    }

    impl Hardware for FakeHardware {
        fn is_official_build(&self) -> bool {
            self.official_build.get()
        }
        fn is_normal_boot_mode(&self) -> bool {
            self.normal_boot_mode.get()
        }
        fn is_oobe_enabled(&self) -> bool {
            self.oobe_enabled.get()
        }
        fn is_oobe_complete(&self) -> (bool, Option<SystemTime>) {
            (self.oobe_complete.get(), None)
        }
        fn get_hardware_class(&self) -> String {
            self.hardware_class.borrow().clone()
        }
        fn get_min_kernel_key_version(&self) -> i32 {
            self.min_kernel_key_version.get()
        }
        fn get_min_firmware_key_version(&self) -> i32 {
            self.min_firmware_key_version.get()
        }
        fn get_max_kernel_key_rollforward(&self) -> i32 {
            self.max_kernel_key_rollforward.get()
        }
        fn set_max_kernel_key_rollforward(&self, version: i32) -> Result<()> {
            self.max_kernel_key_rollforward.set(version);
            Ok(())
        }
        fn get_powerwash_count(&self) -> i32 {
            self.powerwash_count.get()
        }
        fn schedule_powerwash(&self, save_rollback_data: bool) -> Result<()> {
            self.powerwash_scheduled.set(true);
            self.rollback_save_scheduled.set(save_rollback_data);
            Ok(())
        }
        fn cancel_powerwash(&self) -> Result<()> {
            self.powerwash_scheduled.set(false);
            self.rollback_save_scheduled.set(false);
            Ok(())
        }
        fn get_build_timestamp(&self) -> i64 {
            self.build_timestamp.get()
        }
        fn get_version_for_logging(&self, partition_name: &str) -> String {
            self.partition_timestamps
                .borrow()
                .get(partition_name)
                .map(|t| t.to_string())
                .unwrap_or_default()
        }
        fn is_partition_update_valid(&self, partition_name: &str, new_version: &str) -> ErrorCode {
            let current = self
                .partition_timestamps
                .borrow()
                .get(partition_name)
                .copied()
                .unwrap_or(0);
            let new: i64 = match new_version.parse() {
                Ok(v) => v,
                Err(_) => return ErrorCode::PayloadTimestampError,
            };
            if current == 0 {
                return ErrorCode::Success;
            }
            if new == 0 || new < current {
                return ErrorCode::PayloadTimestampError;
            }
            ErrorCode::Success
        }
    }
}

/// Validate `path` as a stateful root, creating it if missing.
pub fn ensure_stateful_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}
