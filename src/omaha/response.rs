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

//! Event-driven parse of the update-service response.  Only a fixed set of
//! element paths carries semantic content; unknown elements and attributes
//! are ignored.  Entity declarations are refused outright.

use std::collections::HashMap;

use log::{error, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::errors::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyVersion {
    pub key: i32,
    pub version: i32,
}

impl KeyVersion {
    /// Parse the wire form `"<key>.<version>"`.
    fn parse(s: &str) -> Option<Self> {
        let (key, version) = s.split_once('.')?;
        Some(Self {
            key: key.parse().ok()?,
            version: version.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OmahaPackage {
    pub name: String,
    pub size: u64,
    /// Hex SHA-256 of the payload bytes.
    pub hash_sha256: String,
    /// Build fingerprint of the package.
    pub fp: String,
    pub is_delta: bool,
    pub metadata_size: u64,
    /// Base64 signature blob over the payload metadata.
    pub metadata_signature: String,
    pub can_exclude: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OmahaResponse {
    pub update_exists: bool,
    pub app_id: String,
    pub version: String,
    /// Candidate base URLs, in server preference order.
    pub payload_urls: Vec<String>,
    pub packages: Vec<OmahaPackage>,
    pub deadline: String,
    pub max_days_to_scatter: i64,
    pub prompt: bool,
    pub disable_p2p_for_downloading: bool,
    pub disable_p2p_for_sharing: bool,
    pub disable_payload_backoff: bool,
    pub public_key_rsa: String,
    pub powerwash_required: bool,
    pub is_rollback: bool,
    pub rollback_firmware: Option<KeyVersion>,
    pub rollback_kernel: Option<KeyVersion>,
    pub eol_date: Option<i64>,
    pub elapsed_days: Option<i64>,
    pub elapsed_seconds: Option<i64>,
    pub cohort: Option<String>,
    pub cohort_hint: Option<String>,
    pub cohort_name: Option<String>,
}

fn attrs_of(e: &BytesStart<'_>) -> Result<HashMap<String, String>, ErrorCode> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|_| ErrorCode::OmahaRequestXmlParseError)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|_| ErrorCode::OmahaRequestXmlParseError)?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_bool(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("true"))
}

/// Split a colon-separated per-package attribute list.
fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| v.split(':').map(str::to_string).collect())
        .unwrap_or_default()
}

struct ResponseParser {
    response: OmahaResponse,
    saw_updatecheck: bool,
    status: String,
    // postinstall action attrs, distributed over packages at the end
    is_delta_list: Vec<String>,
    metadata_size_list: Vec<String>,
    metadata_signature_list: Vec<String>,
}

impl ResponseParser {
    fn new() -> Self {
        Self {
            response: OmahaResponse::default(),
            saw_updatecheck: false,
            status: String::new(),
            is_delta_list: Vec::new(),
            metadata_size_list: Vec::new(),
            metadata_signature_list: Vec::new(),
        }
    }

    fn handle_element(&mut self, path: &[String], e: &BytesStart<'_>) -> Result<(), ErrorCode> {
        let joined = path.join("/");
        let attrs = match joined.as_str() {
            "response/daystart"
            | "response/app"
            | "response/app/updatecheck"
            | "response/app/updatecheck/urls/url"
            | "response/app/updatecheck/manifest"
            | "response/app/updatecheck/manifest/packages/package"
            | "response/app/updatecheck/manifest/actions/action" => attrs_of(e)?,
            _ => return Ok(()),
        };
        let get = |name: &str| attrs.get(name);
        match joined.as_str() {
            "response/daystart" => {
                self.response.elapsed_days = get("elapsed_days").and_then(|v| v.parse().ok());
                self.response.elapsed_seconds =
                    get("elapsed_seconds").and_then(|v| v.parse().ok());
            }
            "response/app" => {
                if let Some(appid) = get("appid") {
                    self.response.app_id = appid.clone();
                }
                self.response.cohort = get("cohort").cloned();
                self.response.cohort_hint = get("cohorthint").cloned();
                self.response.cohort_name = get("cohortname").cloned();
            }
            "response/app/updatecheck" => {
                self.saw_updatecheck = true;
                self.status = get("status").cloned().unwrap_or_default();
                self.response.eol_date = get("_eol_date").and_then(|v| v.parse().ok());
                self.response.is_rollback = parse_bool(get("_rollback"));
                self.response.rollback_firmware =
                    get("_firmware_version").and_then(|v| KeyVersion::parse(v));
                self.response.rollback_kernel =
                    get("_kernel_version").and_then(|v| KeyVersion::parse(v));
            }
            "response/app/updatecheck/urls/url" => {
                if let Some(codebase) = get("codebase") {
                    self.response.payload_urls.push(codebase.clone());
                }
            }
            "response/app/updatecheck/manifest" => {
                if let Some(version) = get("version") {
                    self.response.version = version.clone();
                }
            }
            "response/app/updatecheck/manifest/packages/package" => {
                self.response.packages.push(OmahaPackage {
                    name: get("name").cloned().unwrap_or_default(),
                    size: get("size").and_then(|v| v.parse().ok()).unwrap_or(0),
                    hash_sha256: get("hash_sha256").cloned().unwrap_or_default(),
                    fp: get("fp").cloned().unwrap_or_default(),
                    ..Default::default()
                });
            }
            "response/app/updatecheck/manifest/actions/action" => {
                // only the postinstall action carries policy
                if get("event").map(String::as_str) != Some("postinstall") {
                    return Ok(());
                }
                let r = &mut self.response;
                r.deadline = get("deadline").cloned().unwrap_or_default();
                r.max_days_to_scatter = get("MaxDaysToScatter")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                r.prompt = parse_bool(get("prompt"));
                r.disable_p2p_for_downloading = parse_bool(get("DisableP2PForDownloading"));
                r.disable_p2p_for_sharing = parse_bool(get("DisableP2PForSharing"));
                r.disable_payload_backoff = parse_bool(get("DisablePayloadBackoff"));
                r.public_key_rsa = get("PublicKeyRsa").cloned().unwrap_or_default();
                r.powerwash_required = parse_bool(get("Powerwash"));
                self.is_delta_list = split_list(get("IsDeltaPayload"));
                self.metadata_size_list = split_list(get("MetadataSize"));
                self.metadata_signature_list = split_list(get("MetadataSignatureRsa"));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn finish(mut self) -> Result<OmahaResponse, ErrorCode> {
        let status = std::mem::take(&mut self.status);
        match status.as_str() {
            "noupdate" => {
                self.response.update_exists = false;
                return Ok(self.response);
            }
            // empty status is used for install operations
            "ok" | "" if self.saw_updatecheck => (),
            _ if !self.saw_updatecheck => {
                self.response.update_exists = false;
                return Ok(self.response);
            }
            other => {
                error!("unknown updatecheck status {other:?}");
                return Err(ErrorCode::OmahaResponseInvalid);
            }
        }
        self.response.update_exists = true;
        if self.response.version.is_empty() {
            error!("update response has no manifest version");
            return Err(ErrorCode::OmahaResponseInvalid);
        }
        if self.response.packages.is_empty() || self.response.payload_urls.is_empty() {
            error!("update response has no packages or no URLs");
            return Err(ErrorCode::OmahaResponseInvalid);
        }
        for (i, package) in self.response.packages.iter_mut().enumerate() {
            package.is_delta =
                self.is_delta_list.get(i).map(String::as_str) == Some("true");
            package.metadata_size = self
                .metadata_size_list
                .get(i)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            package.metadata_signature = self
                .metadata_signature_list
                .get(i)
                .cloned()
                .unwrap_or_default();
            if package.size == 0 {
                error!("package {} has no size", package.name);
                return Err(ErrorCode::OmahaResponseInvalid);
            }
        }
        Ok(self.response)
    }
}

pub fn parse_response(xml: &str) -> Result<OmahaResponse, ErrorCode> {
    if xml.trim().is_empty() {
        return Err(ErrorCode::OmahaRequestEmptyResponse);
    }
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut parser = ResponseParser::new();
    let mut path: Vec<String> = Vec::new();
    loop {
        match reader.read_event() {
            Err(e) => {
                warn!("response parse error: {e}");
                return Err(ErrorCode::OmahaRequestXmlParseError);
            }
            Ok(Event::Eof) => break,
            Ok(Event::DocType(text)) => {
                // "billion laughs" defense: no entity declarations, ever
                let raw = String::from_utf8_lossy(text.as_ref()).to_uppercase();
                if raw.contains("ENTITY") {
                    error!("response contains an entity declaration; refusing to parse");
                    return Err(ErrorCode::OmahaRequestXmlHasEntityDecl);
                }
            }
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                parser.handle_element(&path, &e)?;
            }
            Ok(Event::Empty(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                parser.handle_element(&path, &e)?;
                path.pop();
            }
            Ok(Event::End(_)) => {
                // tag-name mismatches surface as reader errors above
                path.pop();
            }
            Ok(_) => (),
        }
    }
    if path.is_empty() {
        parser.finish()
    } else {
        Err(ErrorCode::OmahaRequestXmlParseError)
    }
}

#[cfg(test)]
pub fn sample_update_response() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<response protocol="3.0" server="prod">
  <daystart elapsed_days="4242" elapsed_seconds="100"/>
  <app appid="{11111111-2222-3333-4444-555555555555}" cohort="1:17:" cohortname="stable" status="ok">
    <updatecheck status="ok" _eol_date="9999">
      <urls>
        <url codebase="https://cdn.example.com/build/"/>
        <url codebase="https://cdn2.example.com/build/"/>
      </urls>
      <manifest version="1.2.4">
        <packages>
          <package name="payload.bin" size="16777216" hash_sha256="8d4e3c6d52b8b2f9a39d1b6b495e2e7f55a5e7a2ad3a80e2f2e6d7c8b9a0f1e2" fp="1.abc" required="true"/>
        </packages>
        <actions>
          <action event="install" run="payload.bin"/>
          <action event="postinstall" MetadataSize="1000" IsDeltaPayload="false" MaxDaysToScatter="4" deadline="now"/>
        </actions>
      </manifest>
    </updatecheck>
  </app>
</response>
"#
    .to_string()
}
