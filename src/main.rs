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

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use libupdate::attempter::{
    acquire_daemon_lock, ReqwestServiceTransport, UpdateAttempter, UpdatePolicy,
};
use libupdate::boot_control::{current_slot_from_cmdline, MiscBootControl};
use libupdate::clock::SystemClock;
use libupdate::connection::RouteConnectionManager;
use libupdate::context::SystemContext;
use libupdate::download::ReqwestFetcher;
use libupdate::errors::ErrorCode;
use libupdate::hardware::{ensure_stateful_dir, Hardware, RealHardware};
use libupdate::metrics::LogMetricsReporter;
use libupdate::omaha::{OmahaRequestParams, DEFAULT_UPDATE_URL};
use libupdate::postinstall::RealMounter;
use libupdate::prefs::{FilePrefs, FileStorage};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[derive(Parser)]
#[clap(name = "update-agent", version, about = "A/B over-the-air update daemon")]
struct Args {
    /// Don't detach from the controlling terminal
    #[clap(long)]
    foreground: bool,
    /// Log to stderr instead of stdout
    #[clap(long)]
    logtostderr: bool,
    /// Disable structured (timestamped) log formatting
    #[clap(long)]
    logtoplaintext: bool,
    /// Perform one on-demand update check and exit
    #[clap(long)]
    check_now: bool,
    /// Durable state directory
    #[clap(long, default_value = "/var/lib/update-agent")]
    data_dir: PathBuf,
    /// Stateful partition root (powerwash markers, firmware state)
    #[clap(long, default_value = "/mnt/stateful_partition")]
    stateful_dir: PathBuf,
    /// Update service endpoint
    #[clap(long, default_value_t = DEFAULT_UPDATE_URL.to_string())]
    omaha_url: String,
    /// Bootloader control block device
    #[clap(long, default_value = "/dev/disk/by-partlabel/misc")]
    misc_device: PathBuf,
    /// Directory holding per-slot partition devices
    #[clap(long, default_value = "/dev/disk/by-partlabel")]
    device_dir: PathBuf,
    /// Application identity reported to the update service
    #[clap(long, default_value = "{87efface-864d-49a5-9bb3-4b050a7c227a}")]
    app_id: String,
    /// Version of the running image
    #[clap(long, default_value = "0.0.0.0")]
    app_version: String,
    /// Release channel to request
    #[clap(long, default_value = "stable-channel")]
    channel: String,
    /// Board name reported to the update service
    #[clap(long, default_value = "")]
    board: String,
    /// Build timestamp of the running image (0 = unknown)
    #[clap(long, default_value_t = 0)]
    build_timestamp: i64,
    /// Treat this image as unofficial (waives hash-check policy)
    #[clap(long)]
    unofficial_build: bool,
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    builder.target(if args.logtostderr {
        env_logger::Target::Stderr
    } else {
        env_logger::Target::Stdout
    });
    if args.logtoplaintext {
        builder.format_timestamp(None);
        builder.format_module_path(false);
    }
    builder.init();
}

fn current_slot() -> u8 {
    std::fs::read_to_string("/proc/cmdline")
        .ok()
        .and_then(|cmdline| current_slot_from_cmdline(&cmdline))
        .unwrap_or(0)
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if !args.foreground {
        nix::unistd::daemon(false, args.logtostderr || args.logtoplaintext)
            .context("detaching from terminal")?;
    }
    for signal in [nix::sys::signal::Signal::SIGTERM, nix::sys::signal::Signal::SIGINT] {
        unsafe {
            nix::sys::signal::signal(
                signal,
                nix::sys::signal::SigHandler::Handler(handle_signal),
            )
        }
        .with_context(|| format!("installing {signal} handler"))?;
    }

    ensure_stateful_dir(&args.stateful_dir)?;
    let _lock = acquire_daemon_lock(&args.data_dir)?;

    let slot = current_slot();
    info!(
        "update-agent {} starting on slot {slot}",
        clap::crate_version!()
    );

    let hardware = RealHardware::new(
        &args.stateful_dir,
        !args.unofficial_build,
        String::new(),
        args.build_timestamp,
    );
    let boot_control = MiscBootControl::new(&args.misc_device, &args.device_dir, slot)?;
    let prefs = FilePrefs::new(FileStorage::new(args.data_dir.join("prefs")));

    let ctx = SystemContext {
        prefs: Rc::new(RefCell::new(prefs)),
        clock: Rc::new(SystemClock::new()),
        hardware: Rc::new(hardware),
        boot_control: Rc::new(boot_control),
        connection: Rc::new(RouteConnectionManager::new()),
        metrics: Rc::new(LogMetricsReporter),
        mounter: Rc::new(RealMounter),
        spool_dir: args.data_dir.join("payloads"),
        mount_dir: args.data_dir.join("mnt"),
    };

    let hwid = ctx.hardware.get_hardware_class();
    let params = OmahaRequestParams {
        os_platform: "CoreOS".into(),
        os_version: args.app_version.clone(),
        os_sp: format!("{}_{}", args.app_version, std::env::consts::ARCH),
        app_id: args.app_id.clone(),
        app_version: args.app_version.clone(),
        app_lang: "en-US".into(),
        board: args.board.clone(),
        hwid,
        current_channel: args.channel.clone(),
        target_channel: args.channel.clone(),
        fingerprint: String::new(),
        delta_okay: true,
        interactive: false,
        update_url: args.omaha_url.clone(),
        target_version_prefix: String::new(),
        rollback_allowed: false,
        scheduled_autotest: false,
    };

    let mut attempter = UpdateAttempter::new(
        ctx,
        params,
        UpdatePolicy::default(),
        Box::new(ReqwestServiceTransport),
        Box::new(ReqwestFetcher),
    );
    attempter.update_boot_flags();
    attempter.report_boot_event();

    if args.check_now {
        let code = attempter.check_for_update(true);
        info!("update check finished: {code} (status {})", attempter.status());
        match code {
            ErrorCode::Success | ErrorCode::NoUpdate => return Ok(()),
            other => anyhow::bail!("update check failed: {other}"),
        }
    }

    attempter.run_loop(&|| SHUTDOWN.load(Ordering::SeqCst));
    info!("shutting down");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
