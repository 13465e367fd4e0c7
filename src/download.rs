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

//! Resumable payload download.  Bytes stream into a writer (the delta
//! performer); a spool copy is kept on disk so the running payload hash can
//! be reconstructed after a process restart, and so peers can fetch the
//! payload from us once it validates.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use reqwest::blocking;

use crate::clock::Clock;
use crate::errors::ErrorCode;
use crate::install_plan::InstallPlan;
use crate::io::{Sha256Hasher, BUFFER_SIZE};
use crate::payload_state::{DownloadSource, PayloadState};
use crate::prefs::{PrefsStorage, SharedPrefs};

/// Connection timeout against the origin servers.
pub const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Peers answer on the LAN or not at all.
pub const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Abort a transfer averaging below this over the low-speed window.
pub const LOW_SPEED_LIMIT_BPS: u64 = 1024;
pub const LOW_SPEED_WINDOW: Duration = Duration::from_secs(90);

/// xattr naming the expected final size of a spool file, so peers know when
/// the copy is complete.
const SPOOL_SIZE_XATTR: &str = "user.update-agent.expected-size";

/// One fetched transfer: a byte stream and the offset it actually starts at
/// (servers may ignore range requests).
pub struct FetchResponse {
    pub reader: Box<dyn Read>,
    pub offset: u64,
}

pub trait HttpFetcher {
    fn fetch(&self, url: &str, offset: u64, connect_timeout: Duration) -> Result<FetchResponse>;
}

/// Blocking reqwest transport.
pub struct ReqwestFetcher;

impl HttpFetcher for ReqwestFetcher {
    fn fetch(&self, url: &str, offset: u64, connect_timeout: Duration) -> Result<FetchResponse> {
        let client = blocking::ClientBuilder::new()
            .connect_timeout(connect_timeout)
            // per-request inactivity bound; the low-speed check handles
            // slow but live transfers
            .timeout(LOW_SPEED_WINDOW)
            .build()
            .context("building HTTP client")?;
        let mut request = client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let resp = request.send().with_context(|| format!("fetching '{url}'"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("fetching '{url}': HTTP {status}");
        }
        let got_offset = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        Ok(FetchResponse {
            reader: Box::new(resp),
            offset: got_offset,
        })
    }
}

/// Sink for downloaded bytes.  Implemented by the delta performer; errors
/// carry the pipeline error code and abort the transfer as-is.
pub trait DownloadWriter {
    /// Absolute payload offset the next write continues at.
    fn next_offset(&self) -> u64;
    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), ErrorCode>;
    /// Drop all progress and prepare to consume the payload from offset 0.
    fn reset(&mut self) -> Result<(), ErrorCode>;
    /// Whether the payload manifest has been parsed and verified yet; gates
    /// publishing the spool to peers.
    fn manifest_validated(&self) -> bool;
}

/// Shared cancellation flag, observed between chunks.
pub type CancelToken = Rc<Cell<bool>>;

/// On-disk location of a payload's spool copy.  The delta performer reads
/// the same file to rebuild state on resume.
pub fn spool_path(spool_dir: &Path, plan: &InstallPlan, payload_index: usize) -> PathBuf {
    let fp = &plan.payloads[payload_index].fingerprint;
    let name = if fp.is_empty() { "payload" } else { fp.as_str() };
    spool_dir.join(format!("{name}.payload"))
}

pub struct DownloadAction<'a> {
    plan: &'a InstallPlan,
    payload_index: usize,
    spool_dir: PathBuf,
    cancel: CancelToken,
}

struct Transfer {
    hasher: Sha256Hasher,
    bytes_received: u64,
    spool: File,
    published: bool,
}

impl<'a> DownloadAction<'a> {
    pub fn new(
        plan: &'a InstallPlan,
        payload_index: usize,
        spool_dir: impl Into<PathBuf>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            plan,
            payload_index,
            spool_dir: spool_dir.into(),
            cancel,
        }
    }

    fn spool_path(&self) -> PathBuf {
        spool_path(&self.spool_dir, self.plan, self.payload_index)
    }

    // Reopen the spool and rebuild hashing state for a resume at `offset`.
    // Returns the offset actually usable: 0 if the spool can't cover the
    // prefix.
    fn open_spool(&self, offset: u64) -> Result<(Transfer, u64)> {
        let path = self.spool_path();
        let mut spool = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening spool {}", path.display()))?;
        let expected = self.plan.payloads[self.payload_index].size;
        set_expected_size_xattr(&path, expected);

        let spool_len = spool.seek(SeekFrom::End(0)).context("sizing spool")?;
        if offset > 0 && spool_len >= offset {
            spool.rewind().context("rewinding spool")?;
            let mut hasher = Sha256Hasher::new()?;
            let mut buf = vec![0u8; BUFFER_SIZE];
            let mut remaining = offset;
            while remaining > 0 {
                let n = buf.len().min(remaining as usize);
                spool.read_exact(&mut buf[..n]).context("reading spool")?;
                hasher.write_all(&buf[..n])?;
                remaining -= n as u64;
            }
            spool
                .seek(SeekFrom::Start(offset))
                .context("seeking spool")?;
            return Ok((
                Transfer {
                    hasher,
                    bytes_received: offset,
                    spool,
                    published: false,
                },
                offset,
            ));
        }
        // fresh start
        spool.set_len(0).context("truncating spool")?;
        spool.rewind().context("rewinding spool")?;
        Ok((
            Transfer {
                hasher: Sha256Hasher::new()?,
                bytes_received: 0,
                spool,
                published: false,
            },
            0,
        ))
    }

    fn source_for_url(&self, url: &str) -> DownloadSource {
        if Some(url) == self.plan.peer_url.as_deref() {
            DownloadSource::HttpPeer
        } else if url.starts_with("http:") {
            DownloadSource::HttpOrigin
        } else {
            DownloadSource::HttpsOrigin
        }
    }

    /// Run the transfer to completion, rotating URLs on transient errors.
    /// Returns once the payload is fully written and verified against its
    /// expected size and hash, or with the first non-recoverable code.
    pub fn run<S: PrefsStorage>(
        &mut self,
        fetcher: &dyn HttpFetcher,
        writer: &mut dyn DownloadWriter,
        payload_state: &mut PayloadState,
        prefs: &SharedPrefs<S>,
        clock: &dyn Clock,
    ) -> Result<(), ErrorCode> {
        let payload = &self.plan.payloads[self.payload_index];
        // bounded by the failure budget of every URL in the plan
        let max_transfers =
            (payload.payload_urls.len() as i64 * crate::payload_state::MAX_URL_FAILURE_COUNT) + 2;
        let mut transfers = 0;
        loop {
            transfers += 1;
            if transfers > max_transfers {
                return Err(ErrorCode::DownloadTransferError);
            }
            if payload_state.should_backoff_download(clock) {
                return Err(ErrorCode::OmahaUpdateDeferredForBackoff);
            }

            let (url, source, timeout) = self.pick_url(payload_state)?;
            let offset = writer.next_offset();
            let (mut transfer, actual_offset) = match self.open_spool(offset) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("opening spool: {e:#}");
                    return Err(ErrorCode::DownloadStateInitializationError);
                }
            };
            let offset = if actual_offset != offset {
                info!("spool can't cover resume at {offset}; restarting payload");
                writer.reset()?;
                actual_offset
            } else {
                offset
            };

            info!("downloading {url} from offset {offset}");
            let resp = match fetcher.fetch(&url, offset, timeout) {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("transfer failed: {e:#}");
                    payload_state.update_failed(ErrorCode::DownloadTransferError, &mut prefs.borrow_mut(), clock);
                    continue;
                }
            };
            let resp = if resp.offset != offset {
                // server ignored the range request: restart from scratch
                info!("server restarted transfer at {}; resetting", resp.offset);
                writer.reset()?;
                let (t, _) = self
                    .open_spool(0)
                    .map_err(|_| ErrorCode::DownloadStateInitializationError)?;
                transfer = t;
                resp
            } else {
                resp
            };

            match self.stream(resp, &mut transfer, writer, payload_state, prefs, clock, source) {
                Ok(()) => {
                    // transfer complete: check size, then hash
                    if transfer.bytes_received != payload.size {
                        warn!(
                            "downloaded {} bytes but expected {}",
                            transfer.bytes_received, payload.size
                        );
                        payload_state.update_failed(
                            ErrorCode::PayloadSizeMismatchError,
                            &mut prefs.borrow_mut(),
                            clock,
                        );
                        return Err(ErrorCode::PayloadSizeMismatchError);
                    }
                    let digest = transfer
                        .hasher
                        .digest()
                        .map_err(|_| ErrorCode::DownloadStateInitializationError)?;
                    if digest != payload.hash {
                        warn!("payload hash mismatch: got {digest}");
                        payload_state.update_failed(
                            ErrorCode::PayloadHashMismatchError,
                            &mut prefs.borrow_mut(),
                            clock,
                        );
                        return Err(ErrorCode::PayloadHashMismatchError);
                    }
                    payload_state.download_complete(&mut prefs.borrow_mut());
                    info!("payload download complete and verified");
                    return Ok(());
                }
                Err(code) if code.is_transient_download() => {
                    payload_state.update_failed(code, &mut prefs.borrow_mut(), clock);
                    continue;
                }
                Err(code) => {
                    payload_state.update_failed(code, &mut prefs.borrow_mut(), clock);
                    if code.is_payload_corruption() {
                        // this payload is abandoned; don't resume into it
                        let _ = writer.reset();
                    }
                    return Err(code);
                }
            }
        }
    }

    fn pick_url(
        &self,
        payload_state: &PayloadState,
    ) -> Result<(String, DownloadSource, Duration), ErrorCode> {
        // try the peer first, but never after we started rotating origins
        if let Some(peer) = self.plan.peer_url.as_deref() {
            if payload_state.p2p_enabled() && payload_state.url_switch_count() == 0 {
                return Ok((
                    peer.to_string(),
                    DownloadSource::HttpPeer,
                    PEER_CONNECT_TIMEOUT,
                ));
            }
        }
        // the payload state's URL index parallels the per-payload URL list
        let urls = &self.plan.payloads[self.payload_index].payload_urls;
        let url = urls
            .get(payload_state.url_index() as usize)
            .or_else(|| urls.first())
            .ok_or(ErrorCode::OmahaResponseInvalid)?;
        Ok((
            url.to_string(),
            self.source_for_url(url),
            ORIGIN_CONNECT_TIMEOUT,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn stream<S: PrefsStorage>(
        &self,
        mut resp: FetchResponse,
        transfer: &mut Transfer,
        writer: &mut dyn DownloadWriter,
        payload_state: &mut PayloadState,
        prefs: &SharedPrefs<S>,
        clock: &dyn Clock,
        source: DownloadSource,
    ) -> Result<(), ErrorCode> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;
        loop {
            if self.cancel.get() {
                info!("transfer canceled");
                return Err(ErrorCode::UserCanceled);
            }
            let n = match resp.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read error mid-transfer: {e}");
                    return Err(ErrorCode::DownloadTransferError);
                }
            };
            let chunk = &buf[..n];

            // durable spool write precedes acknowledging the bytes
            transfer
                .spool
                .write_all(chunk)
                .map_err(|_| ErrorCode::DownloadWriteError)?;
            transfer
                .hasher
                .write_all(chunk)
                .map_err(|_| ErrorCode::DownloadStateInitializationError)?;
            transfer.bytes_received += n as u64;

            writer.write_bytes(chunk)?;
            payload_state.download_progress(n as u64, source, &mut prefs.borrow_mut(), clock);

            if !transfer.published && writer.manifest_validated() {
                transfer.published = true;
                let _ = transfer.spool.sync_data();
                info!("payload spool published for peers");
            }

            // low-speed abort
            window_bytes += n as u64;
            let elapsed = window_start.elapsed();
            if elapsed >= LOW_SPEED_WINDOW {
                if window_bytes < LOW_SPEED_LIMIT_BPS * elapsed.as_secs() {
                    warn!(
                        "transfer below {LOW_SPEED_LIMIT_BPS} B/s over {}s; aborting",
                        elapsed.as_secs()
                    );
                    return Err(ErrorCode::DownloadTransferError);
                }
                window_start = Instant::now();
                window_bytes = 0;
            }
        }
    }
}

fn set_expected_size_xattr(path: &Path, size: u64) {
    let value = size.to_string();
    let c_path = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return,
    };
    let c_name = std::ffi::CString::new(SPOOL_SIZE_XATTR).unwrap();
    // advisory only; filesystems without xattr support just skip it
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if rc != 0 {
        info!(
            "setting spool size xattr failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::install_plan::{PayloadInfo, PayloadType};
    use crate::io::Sha256Digest;
    use crate::omaha::{parse_response, sample_update_response};
    use crate::prefs::{MemoryPrefs, MemoryStorage};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn test_plan(data: &[u8], urls: Vec<String>) -> InstallPlan {
        InstallPlan {
            version: "1.2.4".into(),
            download_url: urls[0].clone(),
            payloads: vec![PayloadInfo {
                payload_urls: urls,
                size: data.len() as u64,
                metadata_size: 0,
                metadata_signature: String::new(),
                hash: Sha256Digest::of_bytes(data).unwrap(),
                payload_type: PayloadType::Full,
                fingerprint: "fp1".into(),
                app_id: "app".into(),
                can_exclude: false,
            }],
            source_slot: 0,
            target_slot: 1,
            hash_checks_mandatory: true,
            is_resume: false,
            is_rollback: false,
            powerwash_required: false,
            rollback_data_save_requested: false,
            public_key_rsa: None,
            peer_url: None,
        }
    }

    /// Writer capturing everything it is handed.
    #[derive(Default)]
    struct VecWriter {
        data: Vec<u8>,
        resets: u32,
    }

    impl DownloadWriter for VecWriter {
        fn next_offset(&self) -> u64 {
            self.data.len() as u64
        }
        fn write_bytes(&mut self, buf: &[u8]) -> Result<(), ErrorCode> {
            self.data.extend_from_slice(buf);
            Ok(())
        }
        fn reset(&mut self) -> Result<(), ErrorCode> {
            self.data.clear();
            self.resets += 1;
            Ok(())
        }
        fn manifest_validated(&self) -> bool {
            false
        }
    }

    /// Scripted fetcher: each call pops the next behavior.
    struct ScriptedFetcher {
        script: RefCell<Vec<ScriptStep>>,
        requests: RefCell<Vec<(String, u64)>>,
    }

    enum ScriptStep {
        Fail,
        Serve { data: Vec<u8>, honor_range: bool },
    }

    impl ScriptedFetcher {
        fn new(script: Vec<ScriptStep>) -> Self {
            Self {
                script: RefCell::new(script),
                requests: RefCell::new(Vec::new()),
            }
        }
    }

    impl HttpFetcher for ScriptedFetcher {
        fn fetch(&self, url: &str, offset: u64, _timeout: Duration) -> Result<FetchResponse> {
            self.requests.borrow_mut().push((url.to_string(), offset));
            let mut script = self.script.borrow_mut();
            if script.is_empty() {
                bail!("script exhausted");
            }
            match script.remove(0) {
                ScriptStep::Fail => bail!("HTTP 503 Service Unavailable"),
                ScriptStep::Serve { data, honor_range } => {
                    let start = if honor_range { offset as usize } else { 0 };
                    Ok(FetchResponse {
                        reader: Box::new(Cursor::new(data[start.min(data.len())..].to_vec())),
                        offset: if honor_range { offset } else { 0 },
                    })
                }
            }
        }
    }

    fn state_for(plan: &InstallPlan, prefs: &mut MemoryPrefs, clock: &FakeClock) -> PayloadState {
        let mut response = parse_response(&sample_update_response()).unwrap();
        response.payload_urls = plan.payloads[0].payload_urls.clone();
        let mut state = PayloadState::load(prefs);
        state.set_response(&response, prefs, clock);
        state
    }

    fn run_action(
        plan: &InstallPlan,
        fetcher: &ScriptedFetcher,
        writer: &mut VecWriter,
        spool: &TempDir,
    ) -> (Result<(), ErrorCode>, PayloadState) {
        let prefs = Rc::new(RefCell::new(MemoryPrefs::new(MemoryStorage::new())));
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mut state = state_for(plan, &mut prefs.borrow_mut(), &clock);
        let mut action = DownloadAction::new(plan, 0, spool.path(), CancelToken::default());
        let result = action.run(fetcher, writer, &mut state, &prefs, &clock);
        (result, state)
    }

    #[test]
    fn test_simple_download() {
        let data: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        let plan = test_plan(&data, vec!["https://u1/p".into()]);
        let fetcher = ScriptedFetcher::new(vec![ScriptStep::Serve {
            data: data.clone(),
            honor_range: true,
        }]);
        let spool = TempDir::new().unwrap();
        let mut writer = VecWriter::default();
        let (result, state) = run_action(&plan, &fetcher, &mut writer, &spool);
        result.unwrap();
        assert_eq!(writer.data, data);
        assert_eq!(state.payload_attempt_number(), 1);
        // spool holds the full payload for peers
        assert_eq!(std::fs::read(spool.path().join("fp1.payload")).unwrap(), data);
    }

    #[test]
    fn test_url_failover_on_transport_errors() {
        let data = vec![7u8; 4096];
        let plan = test_plan(&data, vec!["https://u1/p".into(), "https://u2/p".into()]);
        let mut script: Vec<ScriptStep> = (0..crate::payload_state::MAX_URL_FAILURE_COUNT)
            .map(|_| ScriptStep::Fail)
            .collect();
        script.push(ScriptStep::Serve {
            data: data.clone(),
            honor_range: true,
        });
        let fetcher = ScriptedFetcher::new(script);
        let spool = TempDir::new().unwrap();
        let mut writer = VecWriter::default();
        let (result, state) = run_action(&plan, &fetcher, &mut writer, &spool);
        result.unwrap();
        assert_eq!(writer.data, data);
        assert_eq!(state.url_index(), 1);
        assert_eq!(state.url_switch_count(), 1);
        // the successful fetch went to the second URL
        assert_eq!(fetcher.requests.borrow().last().unwrap().0, "https://u2/p");
    }

    #[test]
    fn test_resume_uses_range_and_rebuilds_hash() {
        let data: Vec<u8> = (0..100u8).cycle().take(50_000).collect();
        let plan = test_plan(&data, vec!["https://u1/p".into()]);
        let spool = TempDir::new().unwrap();

        // first transfer dies after 20k bytes
        struct DyingReader {
            data: Vec<u8>,
            served: bool,
        }
        impl Read for DyingReader {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.served {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "gone"));
                }
                self.served = true;
                let n = self.data.len().min(buf.len()).min(20_000);
                buf[..n].copy_from_slice(&self.data[..n]);
                Ok(n)
            }
        }
        struct OneShotFetcher {
            data: Vec<u8>,
            calls: RefCell<u32>,
        }
        impl HttpFetcher for OneShotFetcher {
            fn fetch(&self, _url: &str, offset: u64, _t: Duration) -> Result<FetchResponse> {
                *self.calls.borrow_mut() += 1;
                if *self.calls.borrow() == 1 {
                    Ok(FetchResponse {
                        reader: Box::new(DyingReader {
                            data: self.data.clone(),
                            served: false,
                        }),
                        offset,
                    })
                } else {
                    assert_eq!(offset, 20_000, "resume must use the persisted offset");
                    Ok(FetchResponse {
                        reader: Box::new(Cursor::new(self.data[offset as usize..].to_vec())),
                        offset,
                    })
                }
            }
        }

        let fetcher = OneShotFetcher {
            data: data.clone(),
            calls: RefCell::new(0),
        };
        let prefs = Rc::new(RefCell::new(MemoryPrefs::new(MemoryStorage::new())));
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mut state = state_for(&plan, &mut prefs.borrow_mut(), &clock);
        let mut writer = VecWriter::default();
        let mut action = DownloadAction::new(&plan, 0, spool.path(), CancelToken::default());
        action
            .run(&fetcher, &mut writer, &mut state, &prefs, &clock)
            .unwrap();
        assert_eq!(writer.data, data);
        assert_eq!(*fetcher.calls.borrow(), 2);
    }

    #[test]
    fn test_range_ignored_restarts_payload() {
        let data = vec![9u8; 30_000];
        let plan = test_plan(&data, vec!["https://u1/p".into()]);
        let spool = TempDir::new().unwrap();
        let prefs = Rc::new(RefCell::new(MemoryPrefs::new(MemoryStorage::new())));
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mut state = state_for(&plan, &mut prefs.borrow_mut(), &clock);

        // writer pretends it already consumed 10k; server ignores ranges
        let mut writer = VecWriter::default();
        writer.data = data[..10_000].to_vec();
        std::fs::write(spool.path().join("fp1.payload"), &data[..10_000]).unwrap();
        let fetcher = ScriptedFetcher::new(vec![ScriptStep::Serve {
            data: data.clone(),
            honor_range: false,
        }]);
        let mut action = DownloadAction::new(&plan, 0, spool.path(), CancelToken::default());
        action
            .run(&fetcher, &mut writer, &mut state, &prefs, &clock)
            .unwrap();
        assert_eq!(writer.resets, 1);
        assert_eq!(writer.data, data);
    }

    #[test]
    fn test_size_and_hash_mismatch() {
        let data = vec![1u8; 8192];
        let mut plan = test_plan(&data, vec!["https://u1/p".into()]);
        plan.payloads[0].size += 1;
        let fetcher = ScriptedFetcher::new(vec![ScriptStep::Serve {
            data: data.clone(),
            honor_range: true,
        }]);
        let spool = TempDir::new().unwrap();
        let mut writer = VecWriter::default();
        let (result, _) = run_action(&plan, &fetcher, &mut writer, &spool);
        assert_eq!(result.unwrap_err(), ErrorCode::PayloadSizeMismatchError);

        let mut plan = test_plan(&data, vec!["https://u1/p".into()]);
        plan.payloads[0].hash = Sha256Digest::default();
        let fetcher = ScriptedFetcher::new(vec![ScriptStep::Serve {
            data,
            honor_range: true,
        }]);
        let mut writer = VecWriter::default();
        let (result, _) = run_action(&plan, &fetcher, &mut writer, &spool);
        assert_eq!(result.unwrap_err(), ErrorCode::PayloadHashMismatchError);
    }

    #[test]
    fn test_writer_error_aborts_with_its_code() {
        struct BadWriter;
        impl DownloadWriter for BadWriter {
            fn next_offset(&self) -> u64 {
                0
            }
            fn write_bytes(&mut self, _buf: &[u8]) -> Result<(), ErrorCode> {
                Err(ErrorCode::DownloadOperationHashMismatch)
            }
            fn reset(&mut self) -> Result<(), ErrorCode> {
                Ok(())
            }
            fn manifest_validated(&self) -> bool {
                false
            }
        }
        let data = vec![1u8; 4096];
        let plan = test_plan(&data, vec!["https://u1/p".into()]);
        let fetcher = ScriptedFetcher::new(vec![ScriptStep::Serve {
            data,
            honor_range: true,
        }]);
        let spool = TempDir::new().unwrap();
        let prefs = Rc::new(RefCell::new(MemoryPrefs::new(MemoryStorage::new())));
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mut state = state_for(&plan, &mut prefs.borrow_mut(), &clock);
        let mut action = DownloadAction::new(&plan, 0, spool.path(), CancelToken::default());
        let result = action.run(&fetcher, &mut BadWriter, &mut state, &prefs, &clock);
        assert_eq!(result.unwrap_err(), ErrorCode::DownloadOperationHashMismatch);
    }

    #[test]
    fn test_cancel_stops_transfer() {
        let data = vec![1u8; 4096];
        let plan = test_plan(&data, vec!["https://u1/p".into()]);
        let fetcher = ScriptedFetcher::new(vec![ScriptStep::Serve {
            data,
            honor_range: true,
        }]);
        let spool = TempDir::new().unwrap();
        let cancel = CancelToken::default();
        cancel.set(true);
        let prefs = Rc::new(RefCell::new(MemoryPrefs::new(MemoryStorage::new())));
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mut state = state_for(&plan, &mut prefs.borrow_mut(), &clock);
        let mut writer = VecWriter::default();
        let mut action = DownloadAction::new(&plan, 0, spool.path(), cancel);
        let result = action.run(&fetcher, &mut writer, &mut state, &prefs, &clock);
        assert_eq!(result.unwrap_err(), ErrorCode::UserCanceled);
    }
}
