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

use std::fmt::Write as _;
use std::time::SystemTime;

use anyhow::{bail, Result};
use log::warn;
use uuid::Uuid;

use crate::clock::{wall_secs, Clock};
use crate::prefs::{
    Prefs, PrefsStorage, PREF_INSTALL_DATE_DAYS, PREF_LAST_ACTIVE_PING_DAY,
    PREF_LAST_ROLL_CALL_PING_DAY, PREF_OMAHA_COHORT, PREF_OMAHA_COHORT_HINT,
    PREF_OMAHA_COHORT_NAME,
};

pub const PROTOCOL_VERSION: &str = "3.0";
pub const UPDATER_ID: &str = "update-agent";

/// Production update service endpoint.
pub const DEFAULT_UPDATE_URL: &str = "https://update.example.com/service/update";

/// Ping counter value meaning "never pinged before".
pub const PING_NEVER_PINGED: i64 = -1;
/// Ping counter value sent when the wall clock went backward, so the server
/// refreshes the anchor without double-counting.
pub const PING_TIME_JUMP: i64 = -2;

/// Start of the update service's day-counting epoch: 2007-01-01 00:00 UTC.
const OMAHA_EPOCH_SECS: i64 = 1_167_609_600;
const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Escape a string for use in an XML attribute value.  Only ASCII-7 input
/// is representable; any byte with the high bit set fails.
pub fn xml_encode(input: &str) -> Result<String> {
    if input.bytes().any(|b| b & 0x80 != 0) {
        bail!("invalid ASCII-7 string passed to the XML encoder");
    }
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Escape, substituting `default` if the input is not encodable.
pub fn xml_encode_with_default(input: &str, default: &str) -> String {
    match xml_encode(input) {
        Ok(s) => s,
        Err(_) => {
            warn!("substituting default for non-ASCII attribute value");
            default.to_string()
        }
    }
}

/// Everything identifying this device and build in an update request.
#[derive(Debug, Clone)]
pub struct OmahaRequestParams {
    pub os_platform: String,
    pub os_version: String,
    pub os_sp: String,
    pub app_id: String,
    pub app_version: String,
    pub app_lang: String,
    pub board: String,
    pub hwid: String,
    pub current_channel: String,
    pub target_channel: String,
    pub fingerprint: String,
    pub delta_okay: bool,
    pub interactive: bool,
    pub update_url: String,
    pub target_version_prefix: String,
    pub rollback_allowed: bool,
    /// Scheduled autotest runs announce themselves so the service skips
    /// scattering for them.
    pub scheduled_autotest: bool,
}

impl OmahaRequestParams {
    /// True when talking to the production service; unofficial endpoints
    /// relax hash-check policy on non-official builds.
    pub fn is_update_url_official(&self) -> bool {
        self.update_url == DEFAULT_UPDATE_URL || self.scheduled_autotest
    }

    pub fn install_source(&self) -> &'static str {
        if self.interactive {
            "ondemandupdate"
        } else {
            "scheduler"
        }
    }
}

/// Outcome report for a previous attempt, sent as an `<event>` element
/// instead of an `<updatecheck/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmahaEvent {
    pub event_type: EventType,
    pub result: EventResult,
    /// Wire error code, flag bits included.
    pub error_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    InstallComplete,
    UpdateComplete,
    UpdateDownloadStarted,
    UpdateDownloadFinished,
    RebootedAfterUpdate,
}

impl EventType {
    fn code(self) -> u32 {
        match self {
            EventType::InstallComplete => 2,
            EventType::UpdateComplete => 3,
            EventType::UpdateDownloadStarted => 13,
            EventType::UpdateDownloadFinished => 14,
            EventType::RebootedAfterUpdate => 54,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Error,
    Success,
    UpdateDeferred,
}

impl EventResult {
    fn code(self) -> u32 {
        match self {
            EventResult::Error => 0,
            EventResult::Success => 1,
            EventResult::UpdateDeferred => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingDays {
    pub active: Option<i64>,
    pub roll_call: Option<i64>,
}

impl PingDays {
    fn should_send(&self) -> bool {
        self.active.is_some() || self.roll_call.is_some()
    }
}

fn ping_days_for_key<S: PrefsStorage>(
    prefs: &Prefs<S>,
    key: &str,
    now: SystemTime,
) -> Option<i64> {
    let last = match prefs.get_int64(key) {
        Ok(Some(v)) if v >= 0 => v,
        _ => return Some(PING_NEVER_PINGED),
    };
    let days = (wall_secs(now) - last) / SECS_PER_DAY;
    if days < 0 {
        // clock went backward since the last ping; make the server refresh
        // the anchor without counting activity twice
        warn!("system clock jumped back in time; resetting ping daystarts");
        return Some(PING_TIME_JUMP);
    }
    if days > 0 {
        Some(days)
    } else {
        None
    }
}

/// Compute the `a`/`r` ping counters from the persisted last-ping anchors.
pub fn calculate_ping_days<S: PrefsStorage>(prefs: &Prefs<S>, clock: &dyn Clock) -> PingDays {
    let now = clock.wall_time();
    PingDays {
        active: ping_days_for_key(prefs, PREF_LAST_ACTIVE_PING_DAY, now),
        roll_call: ping_days_for_key(prefs, PREF_LAST_ROLL_CALL_PING_DAY, now),
    }
}

/// Stamp the ping anchors after the service acknowledged a ping.
pub fn persist_ping_anchors<S: PrefsStorage>(
    prefs: &mut Prefs<S>,
    sent: PingDays,
    clock: &dyn Clock,
) -> Result<()> {
    let now = wall_secs(clock.wall_time());
    if sent.active.is_some() {
        prefs.set_int64(PREF_LAST_ACTIVE_PING_DAY, now)?;
    }
    if sent.roll_call.is_some() {
        prefs.set_int64(PREF_LAST_ROLL_CALL_PING_DAY, now)?;
    }
    Ok(())
}

/// Days between the update-service epoch and `t`, floored.
pub fn omaha_days_since_epoch(t: SystemTime) -> i64 {
    (wall_secs(t) - OMAHA_EPOCH_SECS).div_euclid(SECS_PER_DAY)
}

/// The persisted install date: a stable integer number of days, always a
/// multiple of 7 so the service can't fingerprint devices by install time.
/// Returns None until one can be computed (from the OOBE completion time,
/// or later from the response's daystart).
pub fn get_install_date<S: PrefsStorage>(
    prefs: &mut Prefs<S>,
    oobe_time: Option<SystemTime>,
) -> Option<i64> {
    match prefs.get_int64(PREF_INSTALL_DATE_DAYS) {
        Ok(Some(days)) if days >= 0 => return Some(days),
        Ok(Some(days)) => {
            warn!("persisted install date {days} looks suspicious; dropping");
            let _ = prefs.delete(PREF_INSTALL_DATE_DAYS);
        }
        _ => (),
    }
    let t = oobe_time?;
    let days = (omaha_days_since_epoch(t) / 7) * 7;
    if days < 0 {
        return None;
    }
    if let Err(e) = prefs.set_int64(PREF_INSTALL_DATE_DAYS, days) {
        warn!("persisting install date: {e:#}");
        return None;
    }
    Some(days)
}

/// Persist an install date learned from the response daystart.
pub fn persist_install_date_from_elapsed_days<S: PrefsStorage>(
    prefs: &mut Prefs<S>,
    elapsed_days: i64,
) -> Result<()> {
    prefs.set_int64(PREF_INSTALL_DATE_DAYS, (elapsed_days / 7) * 7)?;
    Ok(())
}

/// Assembles one request document.
pub struct OmahaRequestBuilder<'a> {
    pub params: &'a OmahaRequestParams,
    pub event: Option<OmahaEvent>,
    pub ping: PingDays,
    pub install_date_days: Option<i64>,
    pub cohort: Option<String>,
    pub cohort_hint: Option<String>,
    pub cohort_name: Option<String>,
    pub session_id: Uuid,
}

impl<'a> OmahaRequestBuilder<'a> {
    pub fn new<S: PrefsStorage>(
        params: &'a OmahaRequestParams,
        prefs: &Prefs<S>,
        session_id: Uuid,
    ) -> Self {
        let read = |key: &str| prefs.get_string(key).unwrap_or(None);
        Self {
            params,
            event: None,
            ping: PingDays::default(),
            install_date_days: None,
            cohort: read(PREF_OMAHA_COHORT),
            cohort_hint: read(PREF_OMAHA_COHORT_HINT),
            cohort_name: read(PREF_OMAHA_COHORT_NAME),
            session_id,
        }
    }

    fn ping_element(&self) -> String {
        if !self.ping.should_send() {
            return String::new();
        }
        let mut attrs = String::new();
        if let Some(a) = self.ping.active {
            let _ = write!(attrs, " a=\"{a}\"");
        }
        if let Some(r) = self.ping.roll_call {
            let _ = write!(attrs, " r=\"{r}\"");
        }
        format!("        <ping active=\"1\"{attrs}></ping>\n")
    }

    fn body_element(&self) -> String {
        match &self.event {
            Some(event) => format!(
                "        <event eventtype=\"{}\" eventresult=\"{}\" errorcode=\"{}\"></event>\n",
                event.event_type.code(),
                event.result.code(),
                event.error_code,
            ),
            None => {
                let mut attrs = String::new();
                if !self.params.target_version_prefix.is_empty() {
                    let _ = write!(
                        attrs,
                        " targetversionprefix=\"{}\"",
                        xml_encode_with_default(&self.params.target_version_prefix, "")
                    );
                }
                if self.params.rollback_allowed {
                    attrs.push_str(" rollback_allowed=\"true\"");
                }
                format!("        <updatecheck{attrs}></updatecheck>\n")
            }
        }
    }

    fn app_element(&self) -> String {
        let p = self.params;
        let mut attrs = format!(
            "appid=\"{}\" version=\"{}\" track=\"{}\" from_track=\"{}\" lang=\"{}\" board=\"{}\" hardware_class=\"{}\" fingerprint=\"{}\" delta_okay=\"{}\" installsource=\"{}\"",
            xml_encode_with_default(&p.app_id, ""),
            xml_encode_with_default(&p.app_version, "0.0.0.0"),
            xml_encode_with_default(&p.target_channel, ""),
            xml_encode_with_default(&p.current_channel, ""),
            xml_encode_with_default(&p.app_lang, "en-US"),
            xml_encode_with_default(&p.board, ""),
            xml_encode_with_default(&p.hwid, ""),
            xml_encode_with_default(&p.fingerprint, ""),
            if p.delta_okay { "true" } else { "false" },
            p.install_source(),
        );
        for (name, value) in [
            ("cohort", &self.cohort),
            ("cohorthint", &self.cohort_hint),
            ("cohortname", &self.cohort_name),
        ] {
            if let Some(value) = value {
                let _ = write!(
                    attrs,
                    " {name}=\"{}\"",
                    xml_encode_with_default(value, "")
                );
            }
        }
        if let Some(days) = self.install_date_days {
            let _ = write!(attrs, " installdate=\"{days}\"");
        }
        if p.scheduled_autotest {
            attrs.push_str(" autotest=\"scheduled\"");
        }
        format!(
            "    <app {attrs}>\n{}{}    </app>\n",
            self.ping_element(),
            self.body_element(),
        )
    }

    pub fn build(&self) -> String {
        let p = self.params;
        let request_id = Uuid::new_v4();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <request requestid=\"{{{request_id}}}\" sessionid=\"{{{session}}}\" \
             protocol=\"{PROTOCOL_VERSION}\" updater=\"{UPDATER_ID}\" \
             updaterversion=\"{version}\" installsource=\"{source}\" ismachine=\"1\">\n\
             \x20   <os version=\"{os_version}\" platform=\"{os_platform}\" sp=\"{os_sp}\"></os>\n\
             {app}\
             </request>\n",
            session = self.session_id,
            version = xml_encode_with_default(&p.app_version, "0.0.0.0"),
            source = p.install_source(),
            os_version = xml_encode_with_default(&p.os_version, ""),
            os_platform = xml_encode_with_default(&p.os_platform, ""),
            os_sp = xml_encode_with_default(&p.os_sp, ""),
            app = self.app_element(),
        )
    }
}

/// Custom headers accompanying every request to the update service.
pub fn request_headers(params: &OmahaRequestParams) -> Vec<(&'static str, String)> {
    vec![
        (
            "X-Goog-Update-Interactivity",
            if params.interactive { "fg" } else { "bg" }.to_string(),
        ),
        ("X-Goog-Update-AppId", params.app_id.clone()),
        (
            "X-Goog-Update-Updater",
            format!("{UPDATER_ID}-{}", params.app_version),
        ),
    ]
}

#[cfg(test)]
pub fn test_params() -> OmahaRequestParams {
    OmahaRequestParams {
        os_platform: "TestOS".into(),
        os_version: "1.2.3".into(),
        os_sp: "1.2.3_x86_64".into(),
        app_id: "{11111111-2222-3333-4444-555555555555}".into(),
        app_version: "1.2.3".into(),
        app_lang: "en-US".into(),
        board: "test-board".into(),
        hwid: "TEST HWID 1-2".into(),
        current_channel: "stable-channel".into(),
        target_channel: "stable-channel".into(),
        fingerprint: "".into(),
        delta_okay: true,
        interactive: false,
        update_url: "https://update.example.com/service/update".into(),
        target_version_prefix: "".into(),
        rollback_allowed: false,
        scheduled_autotest: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::prefs::{MemoryPrefs, MemoryStorage};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_xml_encode() {
        assert_eq!(xml_encode("plain").unwrap(), "plain");
        assert_eq!(
            xml_encode("ab\"cd'&<>").unwrap(),
            "ab&quot;cd&apos;&amp;&lt;&gt;"
        );
        xml_encode("high bit \u{e9}").unwrap_err();
        assert_eq!(xml_encode_with_default("bad\u{ff}", "dflt"), "dflt");
    }

    #[test]
    fn test_request_shape() {
        let params = test_params();
        let prefs = MemoryPrefs::new(MemoryStorage::new());
        let mut builder = OmahaRequestBuilder::new(&params, &prefs, Uuid::new_v4());
        builder.install_date_days = Some(14);
        let doc = builder.build();
        assert!(doc.contains("protocol=\"3.0\""));
        assert!(doc.contains("<updatecheck></updatecheck>"));
        assert!(doc.contains("installsource=\"scheduler\""));
        assert!(doc.contains("installdate=\"14\""));
        assert!(doc.contains("track=\"stable-channel\""));
        assert!(!doc.contains("<ping"));
        assert!(!doc.contains("<event"));
    }

    #[test]
    fn test_request_event() {
        let params = test_params();
        let prefs = MemoryPrefs::new(MemoryStorage::new());
        let mut builder = OmahaRequestBuilder::new(&params, &prefs, Uuid::new_v4());
        builder.event = Some(OmahaEvent {
            event_type: EventType::UpdateComplete,
            result: EventResult::Error,
            error_code: 10,
        });
        let doc = builder.build();
        assert!(doc
            .contains("<event eventtype=\"3\" eventresult=\"0\" errorcode=\"10\"></event>"));
        assert!(!doc.contains("<updatecheck"));
    }

    #[test]
    fn test_cohort_echo() {
        let params = test_params();
        let mut prefs = MemoryPrefs::new(MemoryStorage::new());
        prefs.set_string(PREF_OMAHA_COHORT, "1:17:").unwrap();
        prefs.set_string(PREF_OMAHA_COHORT_NAME, "canary").unwrap();
        let builder = OmahaRequestBuilder::new(&params, &prefs, Uuid::new_v4());
        let doc = builder.build();
        assert!(doc.contains("cohort=\"1:17:\""));
        assert!(doc.contains("cohortname=\"canary\""));
        assert!(!doc.contains("cohorthint"));
    }

    #[test]
    fn test_ping_days() {
        let mut prefs = MemoryPrefs::new(MemoryStorage::new());
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(100 * 86400));

        // never pinged
        let ping = calculate_ping_days(&prefs, &clock);
        assert_eq!(ping.active, Some(PING_NEVER_PINGED));
        assert_eq!(ping.roll_call, Some(PING_NEVER_PINGED));

        persist_ping_anchors(&mut prefs, ping, &clock).unwrap();

        // same day: nothing to report
        let ping = calculate_ping_days(&prefs, &clock);
        assert_eq!(ping.active, None);
        assert_eq!(ping.roll_call, None);
        assert!(!ping.should_send());

        // three days later
        clock.advance(Duration::from_secs(3 * 86400));
        let ping = calculate_ping_days(&prefs, &clock);
        assert_eq!(ping.active, Some(3));
        assert_eq!(ping.roll_call, Some(3));

        // clock jumped backward past the anchor
        clock.rewind_wall(Duration::from_secs(10 * 86400));
        let ping = calculate_ping_days(&prefs, &clock);
        assert_eq!(ping.active, Some(PING_TIME_JUMP));
    }

    #[test]
    fn test_install_date() {
        let mut prefs = MemoryPrefs::new(MemoryStorage::new());
        // no OOBE timestamp yet
        assert_eq!(get_install_date(&mut prefs, None), None);

        let oobe = UNIX_EPOCH + Duration::from_secs((OMAHA_EPOCH_SECS + 23 * 86400) as u64);
        let days = get_install_date(&mut prefs, Some(oobe)).unwrap();
        assert_eq!(days, 21);
        assert_eq!(days % 7, 0);
        // stable across calls, even without the OOBE timestamp
        assert_eq!(get_install_date(&mut prefs, None), Some(21));

        // a suspicious persisted value is discarded
        prefs.set_int64(PREF_INSTALL_DATE_DAYS, -3).unwrap();
        assert_eq!(get_install_date(&mut prefs, None), None);

        let mut prefs = MemoryPrefs::new(MemoryStorage::new());
        persist_install_date_from_elapsed_days(&mut prefs, 20).unwrap();
        assert_eq!(get_install_date(&mut prefs, None), Some(14));
    }

    #[test]
    fn test_headers() {
        let mut params = test_params();
        params.interactive = true;
        let headers = request_headers(&params);
        assert!(headers
            .iter()
            .any(|(k, v)| *k == "X-Goog-Update-Interactivity" && v == "fg"));
        assert!(headers
            .iter()
            .any(|(k, v)| *k == "X-Goog-Update-Updater" && v == "update-agent-1.2.3"));
    }
}
