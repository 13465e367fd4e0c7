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

use std::time::Duration;

use log::info;

use crate::errors::ErrorCode;
use crate::payload_state::DownloadSource;

/// Metrics sink.  The reporting backend is out of scope; the pipeline emits
/// into this trait and the default implementation just logs.
pub trait MetricsReporter {
    fn report_update_check(&self, result: ErrorCode) {
        info!("metric: update check result {}", result.code());
    }

    fn report_attempt(&self, error: ErrorCode, duration: Duration) {
        info!(
            "metric: attempt finished with {} after {}s",
            error.code(),
            duration.as_secs()
        );
    }

    fn report_successful_update(&self, attempts: u32, bytes_by_source: &[(DownloadSource, u64)]) {
        info!(
            "metric: update succeeded after {attempts} attempt(s), {} bytes",
            bytes_by_source.iter().map(|(_, b)| b).sum::<u64>()
        );
    }

    fn report_certificate_changed(&self, server: &str, depth: u32) {
        info!("metric: certificate changed for {server} at depth {depth}");
    }

    fn report_rollback(&self, success: bool) {
        info!("metric: rollback {}", if success { "ok" } else { "failed" });
    }
}

/// Log-only sink.
#[derive(Default)]
pub struct LogMetricsReporter;

impl MetricsReporter for LogMetricsReporter {}
