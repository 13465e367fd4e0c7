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

//! A/B over-the-air update agent: polls an update service, downloads and
//! verifies a signed payload, writes it to the inactive slot, and arranges
//! for the bootloader to try it on the next boot.

pub mod attempter;
pub mod boot_control;
pub mod bsdiff;
pub mod cert_checker;
pub mod clock;
pub mod connection;
pub mod context;
pub mod delta;
pub mod download;
pub mod errors;
pub mod hardware;
pub mod install_plan;
pub mod io;
pub mod metrics;
pub mod omaha;
pub mod payload;
pub mod payload_state;
pub mod postinstall;
pub mod prefs;
pub mod verifier;
