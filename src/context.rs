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

//! The environment record: every platform collaborator the pipeline needs,
//! constructed once at startup and passed by reference.  Tests build one
//! from fakes; nothing in the crate reaches for globals.

use std::path::PathBuf;
use std::rc::Rc;

use crate::boot_control::BootControl;
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::hardware::Hardware;
use crate::metrics::MetricsReporter;
use crate::postinstall::Mounter;
use crate::prefs::{PrefsStorage, SharedPrefs};

pub struct SystemContext<S: PrefsStorage> {
    pub prefs: SharedPrefs<S>,
    pub clock: Rc<dyn Clock>,
    pub hardware: Rc<dyn Hardware>,
    pub boot_control: Rc<dyn BootControl>,
    pub connection: Rc<dyn ConnectionManager>,
    pub metrics: Rc<dyn MetricsReporter>,
    pub mounter: Rc<dyn Mounter>,
    /// Where payload spools (and the peer-visible copies) live.
    pub spool_dir: PathBuf,
    /// Scratch root for post-install mounts.
    pub mount_dir: PathBuf,
}
