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

//! Post-install: mount each freshly written partition read-only and run the
//! binary the manifest names, handing it the partition's block device.

use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::boot_control::BootControl;
use crate::download::CancelToken;
use crate::errors::ErrorCode;
use crate::payload::Manifest;

/// Time between SIGTERM and SIGKILL when a canceled script won't exit.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Mounting is delegated so tests can populate the mount point themselves.
pub trait Mounter {
    fn mount(&self, device: &Path, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Read-only loopback/bind mount with no-exec hardening left to the mount
/// options of the surrounding filesystem.
pub struct RealMounter;

impl Mounter for RealMounter {
    fn mount(&self, device: &Path, target: &Path) -> Result<()> {
        use nix::mount::MsFlags;
        nix::mount::mount(
            Some(device),
            target,
            Some("ext4"),
            MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            None::<&str>,
        )
        .with_context(|| format!("mounting {} at {}", device.display(), target.display()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        nix::mount::umount(target).with_context(|| format!("unmounting {}", target.display()))
    }
}

// Unmounts on every exit path; failure to unmount is logged, not fatal.
struct ScopedMount<'a> {
    mounter: &'a dyn Mounter,
    target: PathBuf,
}

impl<'a> ScopedMount<'a> {
    fn new(mounter: &'a dyn Mounter, device: &Path, target: &Path) -> Result<Self> {
        std::fs::create_dir_all(target)
            .with_context(|| format!("creating {}", target.display()))?;
        mounter.mount(device, target)?;
        Ok(Self {
            mounter,
            target: target.to_path_buf(),
        })
    }
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mounter.unmount(&self.target) {
            warn!("leaving {} mounted: {e:#}", self.target.display());
        }
    }
}

/// A post-install path must stay inside the mounted partition.
fn validate_postinstall_path(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if p.is_absolute() {
        bail!("post-install path {path:?} is absolute");
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("post-install path {path:?} escapes the partition");
    }
    Ok(p)
}

// Run to completion, honoring cancellation with SIGTERM then SIGKILL.
fn run_with_grace(cmd: &mut Command, cancel: &CancelToken) -> Result<std::process::ExitStatus> {
    let mut child = cmd.spawn().with_context(|| format!("spawning {cmd:?}"))?;
    let pid = Pid::from_raw(child.id() as i32);
    let mut term_sent_at: Option<Instant> = None;
    loop {
        if let Some(status) = child.try_wait().context("waiting for child")? {
            return Ok(status);
        }
        match term_sent_at {
            None if cancel.get() => {
                info!("canceling post-install script (SIGTERM)");
                let _ = kill(pid, Signal::SIGTERM);
                term_sent_at = Some(Instant::now());
            }
            Some(sent) if sent.elapsed() >= KILL_GRACE_PERIOD => {
                warn!("post-install script ignored SIGTERM; killing");
                let _ = kill(pid, Signal::SIGKILL);
                let status = child.wait().context("reaping child")?;
                return Ok(status);
            }
            _ => (),
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn map_exit_status(status: std::process::ExitStatus) -> Result<(), ErrorCode> {
    match status.code() {
        Some(0) => Ok(()),
        Some(3) => Err(ErrorCode::PostinstallBootedFromFirmwareB),
        Some(4) => Err(ErrorCode::PostinstallFirmwareRONotUpdatable),
        other => {
            error!("post-install script exited with {other:?}");
            Err(ErrorCode::PostinstallRunnerError)
        }
    }
}

/// Run every partition's post-install step in manifest order.
pub fn run_postinstall(
    manifest: &Manifest,
    boot_control: &dyn BootControl,
    target_slot: u8,
    mounter: &dyn Mounter,
    fs_mount_dir: &Path,
    cancel: &CancelToken,
) -> Result<(), ErrorCode> {
    for partition in &manifest.partitions {
        if !partition.run_postinstall {
            continue;
        }
        if cancel.get() {
            return Err(ErrorCode::UserCanceled);
        }
        let name = &partition.partition_name;
        let rel_path = partition
            .postinstall_path
            .as_deref()
            .unwrap_or("postinst");
        let rel_path = validate_postinstall_path(rel_path).map_err(|e| {
            error!("{e:#}");
            ErrorCode::PostinstallRunnerError
        })?;
        let device = boot_control
            .get_partition_device(name, target_slot)
            .map_err(|_| ErrorCode::PostinstallRunnerError)?;
        let mount_point = fs_mount_dir.join(format!("{name}_{target_slot}"));

        info!("running post-install for {name} from {}", device.display());
        let mount = ScopedMount::new(mounter, &device, &mount_point).map_err(|e| {
            error!("mounting {name} for post-install: {e:#}");
            ErrorCode::PostinstallRunnerError
        })?;

        let mut cmd = Command::new(mount_point.join(rel_path));
        cmd.arg(&device);
        let status = run_with_grace(&mut cmd, cancel).map_err(|e| {
            error!("running post-install for {name}: {e:#}");
            ErrorCode::PostinstallRunnerError
        })?;
        drop(mount);
        map_exit_status(status)?;
        info!("post-install for {name} succeeded");
    }
    // leave nothing behind in the mount dir
    if let Err(e) = std::fs::remove_dir_all(fs_mount_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("cleaning {}: {e}", fs_mount_dir.display());
        }
    }
    Ok(())
}
