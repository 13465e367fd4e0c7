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

//! The update attempter: the top-level state machine driving one check
//! through request, plan, download, verify, post-install, and slot switch.
//! Policy gates (connection type, OOBE, scattering, backoff) run before any
//! byte is downloaded.

use std::fmt;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use log::{error, info, warn};
use uuid::Uuid;

use crate::boot_control::BootControl;
use crate::clock::{wall_secs, Clock};
use crate::connection::{is_update_allowed_over, ConnectionManager, ConnectionType, Tethering};
use crate::context::SystemContext;
use crate::hardware::Hardware;
use crate::metrics::MetricsReporter;
use crate::delta::{reset_update_progress, DeltaPerformer};
use crate::download::{spool_path, CancelToken, DownloadAction, HttpFetcher};
use crate::errors::{
    ErrorCode, FLAG_DEV_MODE, FLAG_RESUMED, FLAG_TEST_IMAGE, FLAG_TEST_OMAHA_URL,
};
use crate::install_plan::{build_install_plan, clamp_kernel_rollforward, InstallPlan};
use crate::omaha::{
    calculate_ping_days, get_install_date, parse_response, persist_install_date_from_elapsed_days,
    persist_ping_anchors, request_headers, EventResult, EventType, OmahaEvent,
    OmahaRequestBuilder, OmahaRequestParams, OmahaResponse,
};
use crate::payload_state::PayloadState;
use crate::postinstall::run_postinstall;
use crate::prefs::{
    PrefsStorage, PREF_PREVIOUS_VERSION, PREF_UPDATE_CHECK_COUNT, PREF_UPDATE_FIRST_SEEN_AT,
    PREF_UPDATE_SCATTER_WAIT,
};
use crate::verifier::verify_target_partitions;

/// Base polling cadence, fuzzed by ±[`CHECK_FUZZ`].
pub const CHECK_INTERVAL: Duration = Duration::from_secs(45 * 60);
pub const CHECK_FUZZ: Duration = Duration::from_secs(15 * 60);

/// Countdown window for the update-check-count gate.
const MAX_UPDATE_CHECKS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateStatus {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading(f64),
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
    NeedPermissionToUpdate,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStatus::Idle => write!(f, "idle"),
            UpdateStatus::CheckingForUpdate => write!(f, "checking-for-update"),
            UpdateStatus::UpdateAvailable => write!(f, "update-available"),
            UpdateStatus::Downloading(p) => write!(f, "downloading ({:.0}%)", p * 100.0),
            UpdateStatus::Verifying => write!(f, "verifying"),
            UpdateStatus::Finalizing => write!(f, "finalizing"),
            UpdateStatus::UpdatedNeedReboot => write!(f, "updated-need-reboot"),
            UpdateStatus::ReportingErrorEvent => write!(f, "reporting-error-event"),
            UpdateStatus::AttemptingRollback => write!(f, "attempting-rollback"),
            UpdateStatus::NeedPermissionToUpdate => write!(f, "need-permission-to-update"),
        }
    }
}

/// Device policy knobs consulted before each transition.
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub update_disabled: bool,
    pub target_version_prefix: String,
    pub rollback_allowed: bool,
    /// Device policy for cellular updates; None falls back to the user pref.
    pub allow_cellular: Option<bool>,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            update_disabled: false,
            target_version_prefix: String::new(),
            rollback_allowed: false,
            allow_cellular: None,
        }
    }
}

/// POST transport to the update service, separate from the payload fetcher
/// so each can be faked independently.
pub trait ServiceTransport {
    fn post_request(
        &self,
        url: &str,
        body: &str,
        headers: &[(&'static str, String)],
    ) -> Result<(u16, String)>;
}

pub struct ReqwestServiceTransport;

impl ServiceTransport for ReqwestServiceTransport {
    fn post_request(
        &self,
        url: &str,
        body: &str,
        headers: &[(&'static str, String)],
    ) -> Result<(u16, String)> {
        let client = reqwest::blocking::ClientBuilder::new()
            .connect_timeout(crate::download::ORIGIN_CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(3 * 60))
            .build()
            .context("building HTTP client")?;
        let mut request = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let resp = request.send().with_context(|| format!("posting to '{url}'"))?;
        let status = resp.status().as_u16();
        let text = resp.text().context("reading response body")?;
        Ok((status, text))
    }
}

// Exclusive claim on the target slot while it is being written.  A second
// agent instance fails instead of interleaving writes.
struct SlotLock {
    _file: std::fs::File,
}

impl SlotLock {
    fn acquire(ctx_spool_dir: &std::path::Path, target_slot: u8) -> Result<Self> {
        std::fs::create_dir_all(ctx_spool_dir)
            .with_context(|| format!("creating {}", ctx_spool_dir.display()))?;
        let path = ctx_spool_dir.join(format!(".slot-{target_slot}.lock"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        nix::fcntl::flock(
            file.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusiveNonblock,
        )
        .context("target slot is locked by another writer")?;
        Ok(Self { _file: file })
    }
}

pub struct UpdateAttempter<S: PrefsStorage> {
    pub ctx: SystemContext<S>,
    params: OmahaRequestParams,
    policy: UpdatePolicy,
    transport: Box<dyn ServiceTransport>,
    fetcher: Box<dyn HttpFetcher>,
    payload_state: PayloadState,
    status: UpdateStatus,
    session_id: Uuid,
    cancel: CancelToken,
    current_plan: Option<InstallPlan>,
    last_error: Option<ErrorCode>,
}

impl<S: PrefsStorage> UpdateAttempter<S> {
    pub fn new(
        ctx: SystemContext<S>,
        params: OmahaRequestParams,
        policy: UpdatePolicy,
        transport: Box<dyn ServiceTransport>,
        fetcher: Box<dyn HttpFetcher>,
    ) -> Self {
        let payload_state = PayloadState::load(&ctx.prefs.borrow());
        Self {
            ctx,
            params,
            policy,
            transport,
            fetcher,
            payload_state,
            status: UpdateStatus::Idle,
            session_id: Uuid::new_v4(),
            cancel: CancelToken::default(),
            current_plan: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Tell the bootloader the running slot booted all the way up.
    pub fn update_boot_flags(&self) {
        if let Err(e) = self.ctx.boot_control.mark_boot_successful() {
            warn!("marking boot successful: {e:#}");
        }
    }

    /// If the previous boot ran a different version, report the completed
    /// update to the service and roll the previous-version memo.
    pub fn report_boot_event(&mut self) {
        let previous = self
            .ctx
            .prefs
            .borrow()
            .get_string(PREF_PREVIOUS_VERSION)
            .unwrap_or(None);
        match previous.as_deref() {
            Some(version) if version != self.params.app_version => {
                info!("rebooted into {} from {version}", self.params.app_version);
                self.send_event(OmahaEvent {
                    event_type: EventType::RebootedAfterUpdate,
                    result: EventResult::Success,
                    error_code: 0,
                });
            }
            _ => return,
        }
        let mut prefs = self.ctx.prefs.borrow_mut();
        let version = self.params.app_version.clone();
        if let Err(e) = prefs.set_string(PREF_PREVIOUS_VERSION, &version) {
            warn!("updating previous-version: {e:#}");
        }
    }

    /// One full update check, driving the pipeline to a terminal state.
    pub fn check_for_update(&mut self, interactive: bool) -> ErrorCode {
        if self.status == UpdateStatus::UpdatedNeedReboot {
            info!("already updated; waiting for reboot");
            return ErrorCode::UpdatedButNotActive;
        }
        self.status = UpdateStatus::CheckingForUpdate;
        self.last_error = None;
        let started = self.ctx.clock.monotonic();
        let code = match self.try_update(interactive) {
            Ok(()) => {
                self.status = UpdateStatus::UpdatedNeedReboot;
                ErrorCode::Success
            }
            Err(ErrorCode::NoUpdate) => {
                self.status = UpdateStatus::Idle;
                ErrorCode::NoUpdate
            }
            Err(ErrorCode::OmahaUpdateIgnoredOverCellular) => {
                self.status = UpdateStatus::NeedPermissionToUpdate;
                ErrorCode::OmahaUpdateIgnoredOverCellular
            }
            Err(code) if code.is_policy_defer() => {
                info!("update deferred: {code}");
                self.status = UpdateStatus::Idle;
                code
            }
            Err(code) => {
                error!("update attempt failed: {code}");
                self.report_error_event(code);
                self.status = UpdateStatus::Idle;
                code
            }
        };
        if code != ErrorCode::Success && code != ErrorCode::NoUpdate {
            self.last_error = Some(code);
        }
        self.ctx
            .metrics
            .report_attempt(code, self.ctx.clock.monotonic().saturating_sub(started));
        code
    }

    fn try_update(&mut self, interactive: bool) -> Result<(), ErrorCode> {
        self.params.interactive = interactive;
        self.params.rollback_allowed = self.policy.rollback_allowed;
        self.params.target_version_prefix = self.policy.target_version_prefix.clone();

        let response = self.do_update_check()?;
        self.ctx.metrics.report_update_check(if response.update_exists {
            ErrorCode::Success
        } else {
            ErrorCode::NoUpdate
        });
        clamp_kernel_rollforward(self.policy.rollback_allowed, self.ctx.hardware.as_ref());
        if !response.update_exists {
            return Err(ErrorCode::NoUpdate);
        }

        // deadline-carrying (critical) updates bypass most gating
        let critical = !response.deadline.is_empty();
        if self.policy.update_disabled && !critical {
            return Err(ErrorCode::OmahaUpdateIgnoredPerPolicy);
        }
        let (oobe_complete, _) = self.ctx.hardware.is_oobe_complete();
        if self.ctx.hardware.is_oobe_enabled() && !oobe_complete && !critical {
            info!("deferring non-critical update until OOBE completes");
            return Err(ErrorCode::NonCriticalUpdateInOOBE);
        }
        self.check_connection()?;
        if !interactive {
            self.check_scattering(&response)?;
        }

        {
            let prefs = &self.ctx.prefs;
            self.payload_state
                .set_response(&response, &mut prefs.borrow_mut(), self.ctx.clock.as_ref());
        }
        if self
            .payload_state
            .should_backoff_download(self.ctx.clock.as_ref())
            && !interactive
        {
            info!(
                "download backoff in effect until {}",
                self.payload_state.backoff_expiry()
            );
            return Err(ErrorCode::OmahaUpdateDeferredForBackoff);
        }

        let current_url = self.payload_state.current_url().unwrap_or("").to_string();
        let peer_url = self.peer_url(&response);
        let plan = build_install_plan(
            &response,
            &self.params,
            &mut self.ctx.prefs.borrow_mut(),
            self.ctx.hardware.as_ref(),
            self.ctx.boot_control.as_ref(),
            &current_url,
            peer_url.as_deref(),
        )?;
        self.status = UpdateStatus::UpdateAvailable;
        info!(
            "update available: {} -> {} (slot {} -> {})",
            self.params.app_version, plan.version, plan.source_slot, plan.target_slot
        );
        {
            let prefs = &self.ctx.prefs;
            if plan.is_resume {
                self.payload_state
                    .update_resumed(&mut prefs.borrow_mut(), self.ctx.clock.as_ref());
            } else {
                self.payload_state
                    .update_restarted(&mut prefs.borrow_mut(), self.ctx.clock.as_ref());
            }
        }
        self.current_plan = Some(plan.clone());

        // download-stage failures already updated the payload state's
        // counters; nothing more to record here
        self.run_install(&plan)
    }

    fn peer_url(&self, response: &OmahaResponse) -> Option<String> {
        if response.disable_p2p_for_downloading || !self.payload_state.p2p_enabled() {
            return None;
        }
        let url = self.payload_state.p2p_url();
        if url.is_empty() {
            None
        } else {
            Some(url.to_string())
        }
    }

    fn do_update_check(&mut self) -> Result<OmahaResponse, ErrorCode> {
        let ping = calculate_ping_days(&self.ctx.prefs.borrow(), self.ctx.clock.as_ref());
        let oobe_time = self.ctx.hardware.is_oobe_complete().1;
        let install_date = get_install_date(&mut self.ctx.prefs.borrow_mut(), oobe_time);

        let body = {
            let prefs = self.ctx.prefs.borrow();
            let mut builder = OmahaRequestBuilder::new(&self.params, &prefs, self.session_id);
            builder.ping = ping;
            builder.install_date_days = install_date;
            builder.build()
        };
        let headers = request_headers(&self.params);
        info!("checking {} for an update", self.params.update_url);
        let (status, text) = self
            .transport
            .post_request(&self.params.update_url, &body, &headers)
            .map_err(|e| {
                warn!("update check failed: {e:#}");
                ErrorCode::OmahaRequestError
            })?;
        if !(200..300).contains(&status) {
            warn!("update service returned HTTP {status}");
            return Err(ErrorCode::OmahaRequestHttpResponse(status));
        }
        let response = parse_response(&text)?;

        let mut prefs = self.ctx.prefs.borrow_mut();
        if let Err(e) = persist_ping_anchors(&mut prefs, ping, self.ctx.clock.as_ref()) {
            warn!("persisting ping anchors: {e:#}");
        }
        for (key, value) in [
            (crate::prefs::PREF_OMAHA_COHORT, &response.cohort),
            (crate::prefs::PREF_OMAHA_COHORT_HINT, &response.cohort_hint),
            (crate::prefs::PREF_OMAHA_COHORT_NAME, &response.cohort_name),
        ] {
            if let Some(value) = value {
                if let Err(e) = prefs.set_string(key, value) {
                    warn!("persisting {key}: {e:#}");
                }
            }
        }
        if install_date.is_none() {
            if let Some(days) = response.elapsed_days {
                let _ = persist_install_date_from_elapsed_days(&mut prefs, days);
            }
        }
        Ok(response)
    }

    fn check_connection(&self) -> Result<(), ErrorCode> {
        let (connection, tethering) = self
            .ctx
            .connection
            .get_connection_properties()
            .unwrap_or((ConnectionType::Unknown, Tethering::Unknown));
        let prefs = self.ctx.prefs.borrow();
        if !is_update_allowed_over(connection, tethering, self.policy.allow_cellular, &prefs) {
            info!("updates not allowed over {connection:?} (tethering {tethering:?})");
            return Err(ErrorCode::OmahaUpdateIgnoredOverCellular);
        }
        Ok(())
    }

    // Scattering spreads a fleet-wide update over the response's scatter
    // window: a persisted wall-clock wait first, then a persisted check
    // countdown.
    fn check_scattering(&mut self, response: &OmahaResponse) -> Result<(), ErrorCode> {
        let mut prefs = self.ctx.prefs.borrow_mut();
        if response.max_days_to_scatter <= 0 || !response.deadline.is_empty() {
            let _ = prefs.delete(PREF_UPDATE_FIRST_SEEN_AT);
            let _ = prefs.delete(PREF_UPDATE_SCATTER_WAIT);
            let _ = prefs.delete(PREF_UPDATE_CHECK_COUNT);
            return Ok(());
        }
        let now = wall_secs(self.ctx.clock.wall_time());
        let first_seen = match prefs.get_int64(PREF_UPDATE_FIRST_SEEN_AT) {
            Ok(Some(t)) if t <= now => t,
            _ => {
                let _ = prefs.set_int64(PREF_UPDATE_FIRST_SEEN_AT, now);
                now
            }
        };
        let window = response.max_days_to_scatter * 24 * 60 * 60;
        let wait = match prefs.get_int64(PREF_UPDATE_SCATTER_WAIT) {
            Ok(Some(w)) if (0..window).contains(&w) => w,
            _ => {
                let seed =
                    u64::from_le_bytes(Uuid::new_v4().as_bytes()[..8].try_into().unwrap());
                let wait = (seed % window as u64) as i64;
                let _ = prefs.set_int64(PREF_UPDATE_SCATTER_WAIT, wait);
                wait
            }
        };
        if now < first_seen + wait {
            info!(
                "scattering: deferring update for another {}s",
                first_seen + wait - now
            );
            return Err(ErrorCode::OmahaUpdateDeferredPerPolicy);
        }
        // wall-clock wait passed; burn down the check counter
        let count = match prefs.get_int64(PREF_UPDATE_CHECK_COUNT) {
            Ok(Some(count)) if (0..=MAX_UPDATE_CHECKS).contains(&count) => count,
            Ok(Some(_)) | Err(_) => 0,
            Ok(None) => {
                let seed =
                    u64::from_le_bytes(Uuid::new_v4().as_bytes()[..8].try_into().unwrap());
                (seed % MAX_UPDATE_CHECKS as u64) as i64
            }
        };
        if count > 0 {
            let _ = prefs.set_int64(PREF_UPDATE_CHECK_COUNT, count - 1);
            info!("scattering: {count} update checks remaining");
            return Err(ErrorCode::OmahaUpdateDeferredPerPolicy);
        }
        let _ = prefs.delete(PREF_UPDATE_CHECK_COUNT);
        Ok(())
    }

    fn run_install(&mut self, plan: &InstallPlan) -> Result<(), ErrorCode> {
        self.status = UpdateStatus::Downloading(0.0);
        let _lock = SlotLock::acquire(&self.ctx.spool_dir, plan.target_slot).map_err(|e| {
            error!("{e:#}");
            ErrorCode::DownloadStateInitializationError
        })?;

        // the slot is about to hold a half-written image; the bootloader
        // must not try it until the switch at the end
        if let Err(e) = self.ctx.boot_control.mark_slot_unbootable(plan.target_slot) {
            warn!("marking slot {} unbootable: {e:#}", plan.target_slot);
        }

        let spool = spool_path(&self.ctx.spool_dir, plan, 0);
        let mut performer = DeltaPerformer::new(
            plan,
            0,
            self.ctx.boot_control.as_ref(),
            self.ctx.hardware.as_ref(),
            self.ctx.prefs.clone(),
            &spool,
        )?;
        performer.prepare()?;

        let mut action = DownloadAction::new(plan, 0, &self.ctx.spool_dir, self.cancel.clone());
        action.run(
            self.fetcher.as_ref(),
            &mut performer,
            &mut self.payload_state,
            &self.ctx.prefs,
            self.ctx.clock.as_ref(),
        )?;
        performer.finish()?;
        let manifest = performer
            .manifest()
            .cloned()
            .ok_or(ErrorCode::DownloadStateInitializationError)?;
        drop(performer);
        self.status = UpdateStatus::Downloading(1.0);

        self.status = UpdateStatus::Verifying;
        verify_target_partitions(
            &manifest,
            self.ctx.boot_control.as_ref(),
            plan.target_slot,
            &self.cancel,
        )?;

        self.status = UpdateStatus::Finalizing;
        run_postinstall(
            &manifest,
            self.ctx.boot_control.as_ref(),
            plan.target_slot,
            self.ctx.mounter.as_ref(),
            &self.ctx.mount_dir,
            &self.cancel,
        )
        .map_err(|code| {
            // the marker is only written after the slot switch, so this is
            // a defensive cleanup
            let _ = self.ctx.hardware.cancel_powerwash();
            code
        })?;

        self.ctx
            .boot_control
            .set_active_boot_slot(plan.target_slot)
            .map_err(|e| {
                error!("switching active slot: {e:#}");
                ErrorCode::PostinstallRunnerError
            })?;
        if plan.powerwash_required {
            self.ctx
                .hardware
                .schedule_powerwash(plan.rollback_data_save_requested)
                .map_err(|e| {
                    error!("scheduling powerwash: {e:#}");
                    ErrorCode::PostinstallPowerwashError
                })?;
        }

        // final bookkeeping: this response is done
        {
            let mut prefs = self.ctx.prefs.borrow_mut();
            if let Err(e) = reset_update_progress(&mut prefs) {
                warn!("clearing resume state: {e:#}");
            }
            let _ = prefs.delete(crate::prefs::PREF_UPDATE_CHECK_RESPONSE_HASH);
            let _ = prefs.delete(PREF_UPDATE_FIRST_SEEN_AT);
            let _ = prefs.delete(PREF_UPDATE_SCATTER_WAIT);
            let _ = prefs.delete(PREF_UPDATE_CHECK_COUNT);
            let version = self.params.app_version.clone();
            let _ = prefs.set_string(PREF_PREVIOUS_VERSION, &version);
        }
        let attempts = self.payload_state.payload_attempt_number() as u32;
        let bytes = self.payload_state.total_bytes_by_source();
        {
            let prefs = &self.ctx.prefs;
            self.payload_state
                .update_succeeded(&mut prefs.borrow_mut(), self.ctx.clock.as_ref());
        }
        self.ctx.metrics.report_successful_update(attempts, &bytes);
        info!(
            "update to {} applied; slot {} active on next boot",
            plan.version, plan.target_slot
        );
        Ok(())
    }

    /// Switch back to the other slot without downloading anything.
    pub fn attempt_rollback(&mut self, powerwash: bool) -> Result<(), ErrorCode> {
        self.status = UpdateStatus::AttemptingRollback;
        let target = 1 - self.ctx.boot_control.get_current_slot();
        info!("attempting rollback to slot {target}");
        self.ctx
            .boot_control
            .set_active_boot_slot(target)
            .map_err(|e| {
                error!("rollback slot switch failed: {e:#}");
                self.ctx.metrics.report_rollback(false);
                self.status = UpdateStatus::Idle;
                ErrorCode::RollbackNotPossible
            })?;
        {
            let prefs = &self.ctx.prefs;
            let version = self.params.app_version.clone();
            self.payload_state
                .set_rollback_version(&mut prefs.borrow_mut(), &version);
        }
        if powerwash {
            self.ctx
                .hardware
                .schedule_powerwash(true)
                .map_err(|e| {
                    error!("scheduling rollback powerwash: {e:#}");
                    ErrorCode::PostinstallPowerwashError
                })?;
        }
        self.ctx.metrics.report_rollback(true);
        self.status = UpdateStatus::UpdatedNeedReboot;
        Ok(())
    }

    fn error_flags(&self) -> u32 {
        let mut flags = 0;
        if !self.ctx.hardware.is_normal_boot_mode() {
            flags |= FLAG_DEV_MODE;
        }
        if !self.ctx.hardware.is_official_build() {
            flags |= FLAG_TEST_IMAGE;
        }
        if !self.params.is_update_url_official() {
            flags |= FLAG_TEST_OMAHA_URL;
        }
        if self
            .current_plan
            .as_ref()
            .map(|p| p.is_resume)
            .unwrap_or(false)
        {
            flags |= FLAG_RESUMED;
        }
        flags
    }

    fn report_error_event(&mut self, code: ErrorCode) {
        self.status = UpdateStatus::ReportingErrorEvent;
        let wire = code.to_wire(self.error_flags());
        self.send_event(OmahaEvent {
            event_type: EventType::UpdateComplete,
            result: EventResult::Error,
            error_code: wire,
        });
    }

    fn send_event(&mut self, event: OmahaEvent) {
        let body = {
            let prefs = self.ctx.prefs.borrow();
            let mut builder = OmahaRequestBuilder::new(&self.params, &prefs, self.session_id);
            builder.event = Some(event);
            builder.build()
        };
        let headers = request_headers(&self.params);
        match self
            .transport
            .post_request(&self.params.update_url, &body, &headers)
        {
            Ok((status, _)) if (200..300).contains(&status) => (),
            Ok((status, _)) => warn!("event post returned HTTP {status}"),
            Err(e) => warn!("posting event: {e:#}"),
        }
    }

    /// Delay before the next periodic check: the base interval with fuzz.
    pub fn next_check_delay(&self) -> Duration {
        let seed = u64::from_le_bytes(Uuid::new_v4().as_bytes()[..8].try_into().unwrap());
        let window = 2 * CHECK_FUZZ.as_secs();
        let offset = (seed % window) as i64 - CHECK_FUZZ.as_secs() as i64;
        let secs = CHECK_INTERVAL.as_secs() as i64 + offset;
        Duration::from_secs(secs.max(60) as u64)
    }

    /// Blocking poll loop; returns when `shutdown` reports true or a
    /// reboot is pending.
    pub fn run_loop(&mut self, shutdown: &dyn Fn() -> bool) {
        loop {
            let delay = self.next_check_delay();
            info!("next update check in {}s", delay.as_secs());
            let mut remaining = delay;
            while remaining > Duration::ZERO {
                if shutdown() {
                    return;
                }
                let step = remaining.min(Duration::from_secs(1));
                std::thread::sleep(step);
                remaining -= step;
            }
            let code = self.check_for_update(false);
            if code == ErrorCode::Success {
                info!("update applied; awaiting reboot");
                return;
            }
        }
    }
}

/// Guard against multiple agents: not a method so the daemon can hold it
/// for its whole lifetime.
pub fn acquire_daemon_lock(dir: &std::path::Path) -> Result<std::fs::File> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(".update-agent.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    if nix::fcntl::flock(
        file.as_raw_fd(),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    )
    .is_err()
    {
        bail!("another update agent is already running");
    }
    Ok(file)
}
