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

use anyhow::Result;

use crate::prefs::{Prefs, PrefsStorage, PREF_UPDATE_OVER_CELLULAR_PERMISSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Wimax,
    Bluetooth,
    Cellular,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tethering {
    NotDetected,
    Suspected,
    Confirmed,
    Unknown,
}

/// Connection-type discovery, an external collaborator.  The core only asks
/// "what are we on" and "may we download over it".
pub trait ConnectionManager {
    fn get_connection_properties(&self) -> Result<(ConnectionType, Tethering)>;
}

/// Classifies the default-route interface by name.  A platform integration
/// would replace this with its network manager's answer.
pub struct RouteConnectionManager {
    route_table: std::path::PathBuf,
}

impl RouteConnectionManager {
    pub fn new() -> Self {
        Self {
            route_table: "/proc/net/route".into(),
        }
    }

    fn default_interface(&self) -> Option<String> {
        let table = std::fs::read_to_string(&self.route_table).ok()?;
        for line in table.lines().skip(1) {
            let mut fields = line.split_ascii_whitespace();
            let iface = fields.next()?;
            // destination 00000000 marks the default route
            if fields.next() == Some("00000000") {
                return Some(iface.to_string());
            }
        }
        None
    }
}

impl Default for RouteConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager for RouteConnectionManager {
    fn get_connection_properties(&self) -> Result<(ConnectionType, Tethering)> {
        let connection = match self.default_interface() {
            None => ConnectionType::Disconnected,
            Some(iface) if iface.starts_with("wl") => ConnectionType::Wifi,
            Some(iface) if iface.starts_with("ww") || iface.starts_with("rmnet") => {
                ConnectionType::Cellular
            }
            Some(iface) if iface.starts_with("e") => ConnectionType::Ethernet,
            Some(_) => ConnectionType::Unknown,
        };
        Ok((connection, Tethering::NotDetected))
    }
}

/// Whether an update download is allowed over this connection.  Cellular
/// (and tethered connections, which are suspected cellular) requires device
/// policy or an explicit user consent pref.
pub fn is_update_allowed_over<S: PrefsStorage>(
    connection: ConnectionType,
    tethering: Tethering,
    policy_allows_cellular: Option<bool>,
    prefs: &Prefs<S>,
) -> bool {
    let effectively_cellular = connection == ConnectionType::Cellular
        || tethering == Tethering::Confirmed;
    match connection {
        ConnectionType::Disconnected => false,
        // never over bluetooth, regardless of policy or consent
        ConnectionType::Bluetooth => false,
        _ if !effectively_cellular => true,
        _ => match policy_allows_cellular {
            Some(allowed) => allowed,
            // no device policy: fall back to the user pref, default deny
            None => prefs
                .get_bool(PREF_UPDATE_OVER_CELLULAR_PERMISSION)
                .unwrap_or(None)
                .unwrap_or(false),
        },
    }
}
