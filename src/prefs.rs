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

//! Durable typed key-value store backing every piece of cross-attempt state.
//! Keys form a flat namespace with `/` as a sub-key separator; values are
//! stored as their string representation.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use log::warn;
use walkdir::WalkDir;

pub const KEY_SEPARATOR: char = '/';

// Update-check state.
pub const PREF_UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
pub const PREF_UPDATE_CHECK_COUNT: &str = "update-check-count";
pub const PREF_UPDATE_FIRST_SEEN_AT: &str = "update-first-seen-at";
pub const PREF_UPDATE_SCATTER_WAIT: &str = "update-scatter-wait-seconds";
pub const PREF_PREVIOUS_VERSION: &str = "previous-version";

// Delta-performer resume state.
pub const PREF_UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const PREF_UPDATE_STATE_NEXT_DATA_LENGTH: &str = "update-state-next-data-length";
pub const PREF_UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
pub const PREF_MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
pub const PREF_MANIFEST_SIGNATURE_SIZE: &str = "manifest-signature-size";

// Payload-state bookkeeping.
pub const PREF_CURRENT_RESPONSE_SIGNATURE: &str = "current-response-signature";
pub const PREF_CURRENT_URL_INDEX: &str = "current-url-index";
pub const PREF_CURRENT_URL_FAILURE_COUNT: &str = "current-url-failure-count";
pub const PREF_URL_SWITCH_COUNT: &str = "url-switch-count";
pub const PREF_PAYLOAD_ATTEMPT_NUMBER: &str = "payload-attempt-number";
pub const PREF_BACKOFF_EXPIRY_TIME: &str = "backoff-expiry-time";
pub const PREF_UPDATE_TIMESTAMP_START: &str = "update-timestamp-start";
pub const PREF_UPDATE_DURATION_UPTIME: &str = "update-duration-uptime";
pub const PREF_CURRENT_BYTES_DOWNLOADED: &str = "current-bytes-downloaded";
pub const PREF_TOTAL_BYTES_DOWNLOADED: &str = "total-bytes-downloaded";
pub const PREF_NUM_REBOOTS: &str = "num-reboots";
pub const PREF_P2P_ENABLED: &str = "p2p-enabled";
pub const PREF_P2P_URL: &str = "p2p-url";
pub const PREF_ROLLBACK_VERSION: &str = "rollback-version";

// Ping anchors and install date.
pub const PREF_LAST_ACTIVE_PING_DAY: &str = "last-active-ping-day";
pub const PREF_LAST_ROLL_CALL_PING_DAY: &str = "last-roll-call-ping-day";
pub const PREF_INSTALL_DATE_DAYS: &str = "install-date-days";

// Cohort handling.
pub const PREF_OMAHA_COHORT: &str = "omaha-cohort";
pub const PREF_OMAHA_COHORT_HINT: &str = "omaha-cohorthint";
pub const PREF_OMAHA_COHORT_NAME: &str = "omaha-cohortname";

// Policy consents and memos.
pub const PREF_UPDATE_OVER_CELLULAR_PERMISSION: &str = "update-over-cellular-permission";
pub const PREF_CHANNEL_ON_SLOT_PREFIX: &str = "channel-on-slot";
pub const PREF_CERTIFICATE_PREFIX: &str = "update-server-certificate";

/// Storage backend contract.  Implementations persist raw strings; typing
/// and observers live in [`Prefs`].
pub trait PrefsStorage {
    fn get_key(&self, key: &str) -> Result<Option<String>>;
    fn set_key(&mut self, key: &str, value: &str) -> Result<()>;
    fn key_exists(&self, key: &str) -> Result<bool>;
    fn delete_key(&mut self, key: &str) -> Result<()>;
    fn sub_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

pub trait PrefObserver {
    fn on_pref_set(&self, key: &str);
    fn on_pref_deleted(&self, key: &str);
}

/// Typed prefs over a storage backend, with per-key observers notified
/// synchronously after a successful set or delete.
pub struct Prefs<S: PrefsStorage> {
    storage: S,
    observers: HashMap<String, Vec<Rc<dyn PrefObserver>>>,
}

impl<S: PrefsStorage> Prefs<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            observers: HashMap::new(),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.storage.get_key(key)
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.storage.set_key(key, value)?;
        self.notify(key, |o| o.on_pref_set(key));
        Ok(())
    }

    pub fn get_int64(&self, key: &str) -> Result<Option<i64>> {
        match self.storage.get_key(key)? {
            None => Ok(None),
            Some(s) => Ok(Some(
                s.trim()
                    .parse::<i64>()
                    .with_context(|| format!("parsing pref {key} as int64"))?,
            )),
        }
    }

    pub fn set_int64(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.storage.get_key(key)? {
            None => Ok(None),
            Some(s) => match s.trim() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                other => bail!("parsing pref {key} as bool: {other:?}"),
            },
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.set_string(key, if value { "true" } else { "false" })
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.storage.key_exists(key)
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.storage.delete_key(key)?;
        self.notify(key, |o| o.on_pref_deleted(key));
        Ok(())
    }

    /// Every key whose on-storage path begins with `prefix`.
    pub fn sub_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.storage.sub_keys(prefix)
    }

    pub fn add_observer(&mut self, key: &str, observer: Rc<dyn PrefObserver>) {
        self.observers.entry(key.to_string()).or_default().push(observer);
    }

    pub fn remove_observer(&mut self, key: &str, observer: &Rc<dyn PrefObserver>) {
        if let Some(list) = self.observers.get_mut(key) {
            list.retain(|o| !Rc::ptr_eq(o, observer));
        }
    }

    // Iterate over a snapshot so an observer may remove itself (or others)
    // while being notified.
    fn notify(&self, key: &str, f: impl Fn(&Rc<dyn PrefObserver>)) {
        if let Some(list) = self.observers.get(key) {
            for observer in list.clone() {
                f(&observer);
            }
        }
    }
}

/// Join sub-key parts with the separator: `["dlc", id, "key"]` → `dlc/<id>/key`.
pub fn create_sub_key(parts: &[&str]) -> String {
    parts.join(&KEY_SEPARATOR.to_string())
}

/// One file per key under a configured directory.
pub struct FileStorage {
    prefs_dir: PathBuf,
}

impl FileStorage {
    /// Opens the store rooted at `prefs_dir`, sweeping empty directories
    /// left behind by deleted sub-keys.  Sweep errors are ignored.
    pub fn new(prefs_dir: impl Into<PathBuf>) -> Self {
        let prefs_dir = prefs_dir.into();
        delete_empty_directories(&prefs_dir);
        Self { prefs_dir }
    }

    // Allows only non-empty keys containing [A-Za-z0-9_-/].
    fn file_for_key(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            bail!("empty pref key");
        }
        for c in key.chars() {
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == KEY_SEPARATOR) {
                bail!("invalid character {c:?} in pref key {key:?}");
            }
        }
        Ok(self.prefs_dir.join(key))
    }
}

fn delete_empty_directories(dir: &std::path::Path) {
    // deepest first, so emptying a subtree empties its parent
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .flatten()
    {
        if entry.file_type().is_dir() {
            let _ = fs::remove_dir(entry.path());
        }
    }
}

impl PrefsStorage for FileStorage {
    fn get_key(&self, key: &str) -> Result<Option<String>> {
        let path = self.file_for_key(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.file_for_key(key)?;
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        fs::write(&path, value).with_context(|| format!("writing {}", path.display()))
    }

    fn key_exists(&self, key: &str) -> Result<bool> {
        Ok(self.file_for_key(key)?.exists())
    }

    fn delete_key(&mut self, key: &str) -> Result<()> {
        let path = self.file_for_key(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    fn sub_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let wanted = self.file_for_key(prefix)?;
        let wanted = wanted.to_string_lossy().into_owned();
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.prefs_dir).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("walking prefs dir: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_string_lossy().into_owned();
            if path.starts_with(&wanted) {
                if let Ok(rel) = entry.path().strip_prefix(&self.prefs_dir) {
                    keys.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Sorted in-memory backend, used for sideloading and tests.
#[derive(Default)]
pub struct MemoryStorage {
    values: BTreeMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrefsStorage for MemoryStorage {
    fn get_key(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn key_exists(&self, key: &str) -> Result<bool> {
        Ok(self.values.contains_key(key))
    }

    fn delete_key(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    fn sub_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Convenience alias for the common file-backed configuration.
pub type FilePrefs = Prefs<FileStorage>;
/// Convenience alias for the in-memory configuration.
pub type MemoryPrefs = Prefs<MemoryStorage>;

/// The prefs store is process-wide durable state shared by every pipeline
/// stage; scheduling is single-threaded, so a `RefCell` suffices.
pub type SharedPrefs<S> = std::rc::Rc<std::cell::RefCell<Prefs<S>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[test]
    fn test_typed_values() {
        let mut prefs = MemoryPrefs::new(MemoryStorage::new());
        prefs.set_int64("count", -25).unwrap();
        assert_eq!(prefs.get_int64("count").unwrap(), Some(-25));
        prefs.set_bool("flag", true).unwrap();
        assert_eq!(prefs.get_bool("flag").unwrap(), Some(true));
        assert_eq!(prefs.get_string("missing").unwrap(), None);

        // readers trim whitespace
        prefs.set_string("count", " 42\n").unwrap();
        assert_eq!(prefs.get_int64("count").unwrap(), Some(42));
        prefs.set_string("flag", "false ").unwrap();
        assert_eq!(prefs.get_bool("flag").unwrap(), Some(false));

        // non-numeric and non-boolean values are parse errors
        prefs.set_string("count", "25x").unwrap();
        prefs.get_int64("count").unwrap_err();
        prefs.set_string("flag", "yes").unwrap();
        prefs.get_bool("flag").unwrap_err();
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut prefs = FilePrefs::new(FileStorage::new(dir.path()));
        prefs.set_string("some-key", "value").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("some-key")).unwrap(),
            "value"
        );
        assert!(prefs.exists("some-key").unwrap());
        prefs.delete("some-key").unwrap();
        assert!(!prefs.exists("some-key").unwrap());
        // deleting a missing key is fine
        prefs.delete("some-key").unwrap();
    }

    #[test]
    fn test_file_storage_key_charset() {
        let dir = TempDir::new().unwrap();
        let mut prefs = FilePrefs::new(FileStorage::new(dir.path()));
        prefs.set_string("", "v").unwrap_err();
        prefs.set_string("bad key", "v").unwrap_err();
        prefs.set_string("bad.key", "v").unwrap_err();
        prefs.set_string("A-Z_0/9", "v").unwrap();
    }

    #[test]
    fn test_sub_keys() {
        let dir = TempDir::new().unwrap();
        let mut prefs = FilePrefs::new(FileStorage::new(dir.path()));
        let key_a = create_sub_key(&["dlc", "a", "key"]);
        let key_b = create_sub_key(&["dlc", "b", "key"]);
        assert_eq!(key_a, "dlc/a/key");
        prefs.set_string(&key_a, "1").unwrap();
        prefs.set_string(&key_b, "2").unwrap();
        prefs.set_string("other", "3").unwrap();
        assert_eq!(prefs.sub_keys("dlc/").unwrap(), vec![key_a.clone(), key_b]);

        let mut mem = MemoryPrefs::new(MemoryStorage::new());
        mem.set_string(&key_a, "1").unwrap();
        mem.set_string("dld", "x").unwrap();
        assert_eq!(mem.sub_keys("dlc/").unwrap(), vec![key_a]);
    }

    #[test]
    fn test_init_sweeps_empty_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/key"), "v").unwrap();
        let _ = FileStorage::new(dir.path());
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("d/key").exists());
    }

    struct Recorder {
        sets: RefCell<Vec<String>>,
        deletes: RefCell<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                sets: RefCell::new(Vec::new()),
                deletes: RefCell::new(Vec::new()),
            })
        }
    }

    impl PrefObserver for Recorder {
        fn on_pref_set(&self, key: &str) {
            self.sets.borrow_mut().push(key.to_string());
        }
        fn on_pref_deleted(&self, key: &str) {
            self.deletes.borrow_mut().push(key.to_string());
        }
    }

    #[test]
    fn test_observer_notifications() {
        let dir = TempDir::new().unwrap();
        let mut prefs = FilePrefs::new(FileStorage::new(dir.path()));
        let observer = Recorder::new();
        prefs.add_observer("watched", observer.clone());

        prefs.set_string("watched", "v").unwrap();
        prefs.set_string("unwatched", "v").unwrap();
        assert_eq!(*observer.sets.borrow(), vec!["watched"]);

        // failed persist must not notify
        prefs.set_string("bad key", "v").unwrap_err();
        assert_eq!(observer.sets.borrow().len(), 1);

        prefs.delete("watched").unwrap();
        assert_eq!(*observer.deletes.borrow(), vec!["watched"]);

        let obs_dyn: Rc<dyn PrefObserver> = observer.clone();
        prefs.remove_observer("watched", &obs_dyn);
        prefs.set_string("watched", "v2").unwrap();
        assert_eq!(observer.sets.borrow().len(), 1);
    }
}
