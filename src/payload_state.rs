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

//! Cross-attempt bookkeeping for one logical update: URL rotation, per-URL
//! failure counts, exponential backoff, durations, and bytes downloaded.
//! Every field is persisted on change and cached in memory, so progress is
//! kept across process restarts even if a later read fails.

use std::fmt::Write as _;
use std::time::Duration;

use log::{info, warn};

use crate::clock::{wall_secs, Clock};
use crate::errors::ErrorCode;
use crate::omaha::OmahaResponse;
use crate::prefs::*;

/// Per-URL failure budget before rotating to the next URL.
pub const MAX_URL_FAILURE_COUNT: i64 = 10;

/// Backoff grows as `2^(attempt-1)` days, capped here.
const MAX_BACKOFF_DAYS: i64 = 16;
/// Fuzz applied to the backoff expiry, ± half of this window.
const BACKOFF_FUZZ_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadSource {
    HttpsOrigin,
    HttpOrigin,
    HttpPeer,
}

pub const ALL_DOWNLOAD_SOURCES: [DownloadSource; 3] = [
    DownloadSource::HttpsOrigin,
    DownloadSource::HttpOrigin,
    DownloadSource::HttpPeer,
];

impl DownloadSource {
    fn pref_suffix(self) -> &'static str {
        match self {
            DownloadSource::HttpsOrigin => "https-origin",
            DownloadSource::HttpOrigin => "http-origin",
            DownloadSource::HttpPeer => "http-peer",
        }
    }

    fn index(self) -> usize {
        match self {
            DownloadSource::HttpsOrigin => 0,
            DownloadSource::HttpOrigin => 1,
            DownloadSource::HttpPeer => 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct PayloadState {
    // routing fields mirrored from the current response
    payload_urls: Vec<String>,
    disable_backoff: bool,
    response_signature: String,

    payload_attempt_number: i64,
    url_index: i64,
    url_failure_count: i64,
    url_switch_count: i64,
    /// Wall-clock seconds; 0 means no backoff in effect.
    backoff_expiry: i64,
    update_timestamp_start: i64,
    update_duration_uptime: Duration,
    uptime_anchor: Option<Duration>,
    current_bytes: [u64; 3],
    total_bytes: [u64; 3],
    num_reboots: i64,
    p2p_enabled: bool,
    p2p_url: String,
    rollback_version: String,
}

fn load_i64<S: PrefsStorage>(prefs: &Prefs<S>, key: &str) -> i64 {
    prefs.get_int64(key).unwrap_or(None).unwrap_or(0)
}

impl PayloadState {
    /// Load the persisted state.  Read errors fall back to safe defaults:
    /// zero counters, no backoff.
    pub fn load<S: PrefsStorage>(prefs: &Prefs<S>) -> Self {
        let mut state = Self {
            response_signature: prefs
                .get_string(PREF_CURRENT_RESPONSE_SIGNATURE)
                .unwrap_or(None)
                .unwrap_or_default(),
            payload_attempt_number: load_i64(prefs, PREF_PAYLOAD_ATTEMPT_NUMBER),
            url_index: load_i64(prefs, PREF_CURRENT_URL_INDEX),
            url_failure_count: load_i64(prefs, PREF_CURRENT_URL_FAILURE_COUNT),
            url_switch_count: load_i64(prefs, PREF_URL_SWITCH_COUNT),
            backoff_expiry: load_i64(prefs, PREF_BACKOFF_EXPIRY_TIME),
            update_timestamp_start: load_i64(prefs, PREF_UPDATE_TIMESTAMP_START),
            update_duration_uptime: Duration::from_secs(
                load_i64(prefs, PREF_UPDATE_DURATION_UPTIME).max(0) as u64,
            ),
            num_reboots: load_i64(prefs, PREF_NUM_REBOOTS),
            p2p_enabled: prefs
                .get_bool(PREF_P2P_ENABLED)
                .unwrap_or(None)
                .unwrap_or(false),
            p2p_url: prefs
                .get_string(PREF_P2P_URL)
                .unwrap_or(None)
                .unwrap_or_default(),
            rollback_version: prefs
                .get_string(PREF_ROLLBACK_VERSION)
                .unwrap_or(None)
                .unwrap_or_default(),
            ..Default::default()
        };
        for source in ALL_DOWNLOAD_SOURCES {
            state.current_bytes[source.index()] = load_i64(
                prefs,
                &format!("{PREF_CURRENT_BYTES_DOWNLOADED}-from-{}", source.pref_suffix()),
            )
            .max(0) as u64;
            state.total_bytes[source.index()] = load_i64(
                prefs,
                &format!("{PREF_TOTAL_BYTES_DOWNLOADED}-from-{}", source.pref_suffix()),
            )
            .max(0) as u64;
        }
        state
    }

    /// Stable encoding of the response fields that affect download routing.
    /// If it matches the persisted one, counters carry over.
    fn calculate_response_signature(response: &OmahaResponse) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "NumURLs = {}", response.payload_urls.len());
        for (i, url) in response.payload_urls.iter().enumerate() {
            let _ = writeln!(s, "Url{i} = {url}");
        }
        for package in &response.packages {
            let _ = writeln!(
                s,
                "Payload Name = {}\nPayload Size = {}\nPayload Sha256 Hash = {}\nMetadata Size = {}\nMetadata Signature = {}\nIs Delta = {}",
                package.name,
                package.size,
                package.hash_sha256,
                package.metadata_size,
                package.metadata_signature,
                package.is_delta,
            );
        }
        let _ = writeln!(
            s,
            "Max Failure Count Per Url = {MAX_URL_FAILURE_COUNT}\nDisable Payload Backoff = {}",
            response.disable_payload_backoff,
        );
        s
    }

    pub fn set_response<S: PrefsStorage>(
        &mut self,
        response: &OmahaResponse,
        prefs: &mut Prefs<S>,
        clock: &dyn Clock,
    ) {
        self.payload_urls = response.payload_urls.clone();
        self.disable_backoff = response.disable_payload_backoff;
        let signature = Self::calculate_response_signature(response);
        if signature == self.response_signature {
            info!("response signature unchanged; keeping download state");
            return;
        }
        info!("new response detected; resetting download state");
        self.reset_persisted_state(prefs);
        self.response_signature = signature;
        self.persist_string(prefs, PREF_CURRENT_RESPONSE_SIGNATURE, &self.response_signature.clone());
        self.update_timestamp_start = wall_secs(clock.wall_time());
        self.persist(prefs, PREF_UPDATE_TIMESTAMP_START, self.update_timestamp_start);
        self.uptime_anchor = Some(clock.monotonic());
    }

    pub fn download_progress<S: PrefsStorage>(
        &mut self,
        count: u64,
        source: DownloadSource,
        prefs: &mut Prefs<S>,
        clock: &dyn Clock,
    ) {
        if count == 0 {
            return;
        }
        self.current_bytes[source.index()] += count;
        self.total_bytes[source.index()] += count;
        self.persist(
            prefs,
            &format!("{PREF_CURRENT_BYTES_DOWNLOADED}-from-{}", source.pref_suffix()),
            self.current_bytes[source.index()] as i64,
        );
        self.persist(
            prefs,
            &format!("{PREF_TOTAL_BYTES_DOWNLOADED}-from-{}", source.pref_suffix()),
            self.total_bytes[source.index()] as i64,
        );
        self.accumulate_uptime(prefs, clock);
        // receiving bytes proves the URL works; don't hold old failures
        // against it
        if self.url_failure_count != 0 {
            self.url_failure_count = 0;
            self.persist(prefs, PREF_CURRENT_URL_FAILURE_COUNT, 0);
        }
    }

    /// A full payload was downloaded; the next download (if any) starts a
    /// fresh attempt.
    pub fn download_complete<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>) {
        self.set_payload_attempt_number(prefs, self.payload_attempt_number + 1);
    }

    pub fn update_succeeded<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        self.accumulate_uptime(prefs, clock);
        info!(
            "update succeeded: attempts={} url_switches={} duration={}s",
            self.payload_attempt_number,
            self.url_switch_count,
            (wall_secs(clock.wall_time()) - self.update_timestamp_start).max(0),
        );
        self.reset_persisted_state(prefs);
        self.response_signature.clear();
        self.persist_string(prefs, PREF_CURRENT_RESPONSE_SIGNATURE, "");
    }

    pub fn update_failed<S: PrefsStorage>(
        &mut self,
        error: ErrorCode,
        prefs: &mut Prefs<S>,
        clock: &dyn Clock,
    ) {
        if self.payload_urls.is_empty() {
            warn!("update failed before any response was set; ignoring");
            return;
        }
        if error.is_policy_defer() {
            return;
        }
        if error.is_transient_download() {
            self.increment_failure_count(prefs, clock);
        } else if error.is_payload_corruption() {
            self.increment_url_index(prefs, clock);
        }
        // everything else is not URL-specific; the attempter reports it
    }

    pub fn should_backoff_download(&self, clock: &dyn Clock) -> bool {
        if self.disable_backoff {
            return false;
        }
        wall_secs(clock.wall_time()) < self.backoff_expiry
    }

    /// The interrupted download is being picked up again, typically after a
    /// process restart or reboot.
    pub fn update_resumed<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        self.num_reboots += 1;
        self.persist(prefs, PREF_NUM_REBOOTS, self.num_reboots);
        self.uptime_anchor = Some(clock.monotonic());
    }

    /// A new update is starting from scratch.
    pub fn update_restarted<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        self.num_reboots = 0;
        self.persist(prefs, PREF_NUM_REBOOTS, 0);
        self.uptime_anchor = Some(clock.monotonic());
    }

    pub fn set_p2p<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, enabled: bool, url: &str) {
        self.p2p_enabled = enabled;
        self.p2p_url = url.to_string();
        if let Err(e) = prefs.set_bool(PREF_P2P_ENABLED, enabled) {
            warn!("persisting p2p-enabled: {e:#}");
        }
        self.persist_string(prefs, PREF_P2P_URL, url);
    }

    pub fn set_rollback_version<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, version: &str) {
        self.rollback_version = version.to_string();
        self.persist_string(prefs, PREF_ROLLBACK_VERSION, version);
    }

    // accessors

    pub fn current_url(&self) -> Option<&str> {
        self.payload_urls
            .get(self.url_index as usize)
            .map(String::as_str)
    }

    pub fn payload_attempt_number(&self) -> i64 {
        self.payload_attempt_number
    }

    pub fn url_index(&self) -> i64 {
        self.url_index
    }

    pub fn url_failure_count(&self) -> i64 {
        self.url_failure_count
    }

    pub fn url_switch_count(&self) -> i64 {
        self.url_switch_count
    }

    pub fn backoff_expiry(&self) -> i64 {
        self.backoff_expiry
    }

    pub fn num_reboots(&self) -> i64 {
        self.num_reboots
    }

    pub fn p2p_enabled(&self) -> bool {
        self.p2p_enabled
    }

    pub fn p2p_url(&self) -> &str {
        &self.p2p_url
    }

    pub fn rollback_version(&self) -> &str {
        &self.rollback_version
    }

    /// Wall-clock duration of the update so far.
    pub fn update_duration(&self, clock: &dyn Clock) -> Duration {
        let secs = wall_secs(clock.wall_time()) - self.update_timestamp_start;
        Duration::from_secs(secs.max(0) as u64)
    }

    /// Monotonic time actually spent updating, accumulated across process
    /// lifetimes.
    pub fn update_duration_uptime(&self) -> Duration {
        self.update_duration_uptime
    }

    pub fn bytes_downloaded(&self, source: DownloadSource) -> u64 {
        self.current_bytes[source.index()]
    }

    pub fn total_bytes_by_source(&self) -> Vec<(DownloadSource, u64)> {
        ALL_DOWNLOAD_SOURCES
            .iter()
            .map(|s| (*s, self.total_bytes[s.index()]))
            .collect()
    }

    // internals

    fn num_urls(&self) -> i64 {
        self.payload_urls.len() as i64
    }

    fn increment_failure_count<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        self.url_failure_count += 1;
        if self.url_failure_count >= MAX_URL_FAILURE_COUNT {
            self.increment_url_index(prefs, clock);
        } else {
            self.persist(prefs, PREF_CURRENT_URL_FAILURE_COUNT, self.url_failure_count);
        }
    }

    fn increment_url_index<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        let next = self.url_index + 1;
        if next < self.num_urls() {
            self.url_index = next;
        } else {
            self.url_index = 0;
            // exhausted every URL: a new attempt begins, with backoff
            self.set_payload_attempt_number(prefs, self.payload_attempt_number + 1);
            self.update_backoff_expiry(prefs, clock);
        }
        self.url_switch_count += 1;
        self.url_failure_count = 0;
        self.persist(prefs, PREF_CURRENT_URL_INDEX, self.url_index);
        self.persist(prefs, PREF_URL_SWITCH_COUNT, self.url_switch_count);
        self.persist(prefs, PREF_CURRENT_URL_FAILURE_COUNT, 0);
        info!("switched to URL index {}", self.url_index);
    }

    fn set_payload_attempt_number<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, value: i64) {
        self.payload_attempt_number = value;
        self.persist(prefs, PREF_PAYLOAD_ATTEMPT_NUMBER, value);
    }

    fn update_backoff_expiry<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        if self.disable_backoff || self.payload_attempt_number == 0 {
            self.backoff_expiry = 0;
        } else {
            let days = (1i64 << (self.payload_attempt_number - 1).clamp(0, 62))
                .min(MAX_BACKOFF_DAYS);
            // ± half the fuzz window, so fleet retries spread out
            let fuzz_seed = u64::from_le_bytes(
                uuid::Uuid::new_v4().as_bytes()[..8].try_into().unwrap(),
            );
            let fuzz = (fuzz_seed % BACKOFF_FUZZ_SECS as u64) as i64 - BACKOFF_FUZZ_SECS / 2;
            self.backoff_expiry =
                (wall_secs(clock.wall_time()) + days * 24 * 60 * 60 + fuzz).max(0);
        }
        self.persist(prefs, PREF_BACKOFF_EXPIRY_TIME, self.backoff_expiry);
        info!(
            "backoff expiry set to {} (attempt {})",
            self.backoff_expiry, self.payload_attempt_number
        );
    }

    fn accumulate_uptime<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>, clock: &dyn Clock) {
        let now = clock.monotonic();
        if let Some(anchor) = self.uptime_anchor {
            self.update_duration_uptime += now.saturating_sub(anchor);
            self.persist(
                prefs,
                PREF_UPDATE_DURATION_UPTIME,
                self.update_duration_uptime.as_secs() as i64,
            );
        }
        self.uptime_anchor = Some(now);
    }

    fn reset_persisted_state<S: PrefsStorage>(&mut self, prefs: &mut Prefs<S>) {
        self.payload_attempt_number = 0;
        self.url_index = 0;
        self.url_failure_count = 0;
        self.url_switch_count = 0;
        self.backoff_expiry = 0;
        self.update_timestamp_start = 0;
        self.update_duration_uptime = Duration::ZERO;
        self.uptime_anchor = None;
        self.current_bytes = [0; 3];
        self.num_reboots = 0;
        for (key, value) in [
            (PREF_PAYLOAD_ATTEMPT_NUMBER, 0),
            (PREF_CURRENT_URL_INDEX, 0),
            (PREF_CURRENT_URL_FAILURE_COUNT, 0),
            (PREF_URL_SWITCH_COUNT, 0),
            (PREF_BACKOFF_EXPIRY_TIME, 0),
            (PREF_UPDATE_TIMESTAMP_START, 0),
            (PREF_UPDATE_DURATION_UPTIME, 0),
            (PREF_NUM_REBOOTS, 0),
        ] {
            self.persist(prefs, key, value);
        }
        for source in ALL_DOWNLOAD_SOURCES {
            self.persist(
                prefs,
                &format!("{PREF_CURRENT_BYTES_DOWNLOADED}-from-{}", source.pref_suffix()),
                0,
            );
        }
    }

    fn persist<S: PrefsStorage>(&self, prefs: &mut Prefs<S>, key: &str, value: i64) {
        if let Err(e) = prefs.set_int64(key, value) {
            warn!("persisting {key}: {e:#}");
        }
    }

    fn persist_string<S: PrefsStorage>(&self, prefs: &mut Prefs<S>, key: &str, value: &str) {
        if let Err(e) = prefs.set_string(key, value) {
            warn!("persisting {key}: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::omaha::{parse_response, sample_update_response};
    use crate::prefs::{MemoryPrefs, MemoryStorage};
    use std::time::{Duration, UNIX_EPOCH};

    fn setup() -> (PayloadState, MemoryPrefs, FakeClock, OmahaResponse) {
        let prefs = MemoryPrefs::new(MemoryStorage::new());
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let response = parse_response(&sample_update_response()).unwrap();
        let mut state = PayloadState::load(&prefs);
        let mut prefs = prefs;
        state.set_response(&response, &mut prefs, &clock);
        (state, prefs, clock, response)
    }

    #[test]
    fn test_same_response_keeps_counters() {
        let (mut state, mut prefs, clock, response) = setup();
        state.update_failed(ErrorCode::DownloadTransferError, &mut prefs, &clock);
        assert_eq!(state.url_failure_count(), 1);

        state.set_response(&response, &mut prefs, &clock);
        assert_eq!(state.url_failure_count(), 1);

        let mut changed = response.clone();
        changed.packages[0].size += 1;
        state.set_response(&changed, &mut prefs, &clock);
        assert_eq!(state.url_failure_count(), 0);
    }

    #[test]
    fn test_url_rotation_after_failure_cap() {
        let (mut state, mut prefs, clock, _) = setup();
        assert_eq!(state.url_index(), 0);
        // transient failures advance the URL only at the cap
        for i in 1..MAX_URL_FAILURE_COUNT {
            state.update_failed(ErrorCode::DownloadTransferError, &mut prefs, &clock);
            assert_eq!(state.url_failure_count(), i);
            assert_eq!(state.url_index(), 0);
        }
        state.update_failed(ErrorCode::DownloadTransferError, &mut prefs, &clock);
        assert_eq!(state.url_index(), 1);
        assert_eq!(state.url_failure_count(), 0);
        assert_eq!(state.url_switch_count(), 1);
        assert_eq!(state.payload_attempt_number(), 0);
    }

    #[test]
    fn test_corruption_rotates_immediately_and_wraps() {
        let (mut state, mut prefs, clock, _) = setup();
        state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
        assert_eq!(state.url_index(), 1);
        assert_eq!(state.payload_attempt_number(), 0);
        assert!(!state.should_backoff_download(&clock));

        // wrap-around: attempt number bumps, backoff kicks in
        state.update_failed(ErrorCode::DownloadOperationHashMismatch, &mut prefs, &clock);
        assert_eq!(state.url_index(), 0);
        assert_eq!(state.payload_attempt_number(), 1);
        assert!(state.should_backoff_download(&clock));
        assert!(state.backoff_expiry() > wall_secs(clock.wall_time()));
    }

    #[test]
    fn test_policy_defer_changes_nothing() {
        let (mut state, mut prefs, clock, _) = setup();
        state.update_failed(ErrorCode::OmahaUpdateDeferredPerPolicy, &mut prefs, &clock);
        assert_eq!(state.url_index(), 0);
        assert_eq!(state.url_failure_count(), 0);
        assert_eq!(state.payload_attempt_number(), 0);
    }

    #[test]
    fn test_backoff_monotone_until_cap() {
        let (mut state, mut prefs, clock, _) = setup();
        let mut last_delay = 0i64;
        for attempt in 1..=8 {
            // exhaust both URLs to wrap
            state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
            state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
            assert_eq!(state.payload_attempt_number(), attempt);
            let delay = state.backoff_expiry() - wall_secs(clock.wall_time());
            // monotone non-decreasing modulo fuzz, capped at the policy max
            assert!(delay >= last_delay - BACKOFF_FUZZ_SECS, "attempt {attempt}");
            assert!(delay <= MAX_BACKOFF_DAYS * 86400 + BACKOFF_FUZZ_SECS);
            last_delay = delay;
        }
    }

    #[test]
    fn test_backoff_expires_and_can_be_disabled() {
        let (mut state, mut prefs, clock, response) = setup();
        state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
        state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
        assert!(state.should_backoff_download(&clock));
        clock.advance(Duration::from_secs(20 * 86400));
        assert!(!state.should_backoff_download(&clock));

        let mut no_backoff = response;
        no_backoff.disable_payload_backoff = true;
        state.set_response(&no_backoff, &mut prefs, &clock);
        state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
        state.update_failed(ErrorCode::PayloadHashMismatchError, &mut prefs, &clock);
        assert!(!state.should_backoff_download(&clock));
    }

    #[test]
    fn test_progress_resets_failures_and_persists() {
        let (mut state, mut prefs, clock, _) = setup();
        state.update_failed(ErrorCode::DownloadTransferError, &mut prefs, &clock);
        state.download_progress(1000, DownloadSource::HttpsOrigin, &mut prefs, &clock);
        assert_eq!(state.url_failure_count(), 0);
        assert_eq!(state.bytes_downloaded(DownloadSource::HttpsOrigin), 1000);
        state.download_progress(24, DownloadSource::HttpPeer, &mut prefs, &clock);

        // state survives a reload
        let reloaded = PayloadState::load(&prefs);
        assert_eq!(reloaded.bytes_downloaded(DownloadSource::HttpsOrigin), 1000);
        assert_eq!(reloaded.bytes_downloaded(DownloadSource::HttpPeer), 24);
    }

    #[test]
    fn test_uptime_accumulates_across_restarts() {
        let (mut state, mut prefs, clock, response) = setup();
        clock.advance(Duration::from_secs(10));
        state.download_progress(1, DownloadSource::HttpsOrigin, &mut prefs, &clock);
        assert_eq!(state.update_duration_uptime(), Duration::from_secs(10));

        // a new process resumes; time passed while down doesn't count
        let mut resumed = PayloadState::load(&prefs);
        resumed.set_response(&response, &mut prefs, &clock);
        resumed.update_resumed(&mut prefs, &clock);
        clock.advance(Duration::from_secs(5));
        resumed.download_progress(1, DownloadSource::HttpsOrigin, &mut prefs, &clock);
        assert_eq!(resumed.update_duration_uptime(), Duration::from_secs(15));
        assert_eq!(resumed.num_reboots(), 1);
    }

    #[test]
    fn test_p2p_memo_survives_reload() {
        let (mut state, mut prefs, _clock, _) = setup();
        assert!(!state.p2p_enabled());
        state.set_p2p(&mut prefs, true, "http://192.168.1.17:16725/payload");
        let reloaded = PayloadState::load(&prefs);
        assert!(reloaded.p2p_enabled());
        assert_eq!(reloaded.p2p_url(), "http://192.168.1.17:16725/payload");
    }

    #[test]
    fn test_success_resets_state() {
        let (mut state, mut prefs, clock, _) = setup();
        state.download_progress(500, DownloadSource::HttpsOrigin, &mut prefs, &clock);
        state.download_complete(&mut prefs);
        assert_eq!(state.payload_attempt_number(), 1);
        state.update_succeeded(&mut prefs, &clock);
        assert_eq!(state.payload_attempt_number(), 0);
        assert_eq!(state.bytes_downloaded(DownloadSource::HttpsOrigin), 0);
        assert_eq!(
            prefs
                .get_string(PREF_CURRENT_RESPONSE_SIGNATURE)
                .unwrap()
                .as_deref(),
            Some("")
        );
    }
}
