//! Settings and status collaborator.
//!
//! The mining core does not own persistent storage or a UI; it talks to both
//! through the interfaces in this module. [`Settings`] is the key-value
//! store the firmware keeps in flash (pool coordinates, ASIC tuning, best
//! difficulty). Every typed accessor falls back to a documented default when
//! the key is missing, so a blank store still yields a bootable
//! configuration. [`MinerStatus`] is the snapshot the core maintains for an
//! external UI to render; the core never draws anything itself.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use thiserror::Error;

use crate::asic::AsicModel;
use crate::tracing::prelude::*;

/// Key names, as stored.
pub mod keys {
    pub const WIFI_SSID: &str = "wifi_ssid";
    pub const WIFI_PASS: &str = "wifi_pass";
    pub const HOSTNAME: &str = "hostname";
    pub const STRATUM_URL: &str = "stratum_url";
    pub const STRATUM_PORT: &str = "stratum_port";
    pub const STRATUM_USER: &str = "stratum_user";
    pub const STRATUM_PASS: &str = "stratum_pass";
    pub const FALLBACK_STRATUM_URL: &str = "fallback_stratum_url";
    pub const FALLBACK_STRATUM_PORT: &str = "fallback_stratum_port";
    pub const FALLBACK_STRATUM_USER: &str = "fallback_stratum_user";
    pub const FALLBACK_STRATUM_PASS: &str = "fallback_stratum_pass";
    pub const ASIC_MODEL: &str = "asic_model";
    pub const ASIC_FREQUENCY: &str = "asic_frequency";
    pub const ASIC_VOLTAGE: &str = "asic_voltage";
    pub const BEST_DIFF: &str = "best_difficulty";
    pub const OVERHEAT_MODE: &str = "overheat_mode";
}

/// Defaults returned when a key is missing from the store.
pub mod defaults {
    pub const WIFI_SSID: &str = "";
    pub const WIFI_PASS: &str = "";
    pub const HOSTNAME: &str = "bitaxe";
    pub const STRATUM_URL: &str = "public-pool.io";
    pub const STRATUM_PORT: u16 = 21496;
    pub const STRATUM_USER: &str = "";
    pub const STRATUM_PASS: &str = "x";
    pub const ASIC_FREQUENCY_MHZ: u16 = 485;
    pub const ASIC_VOLTAGE_MV: u16 = 1200;
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings I/O: {0}")]
    Io(#[from] io::Error),

    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key-value settings store.
///
/// Reads return `None` for missing or wrong-typed keys; the typed accessors
/// layered on top turn that into documented defaults. Writes that fail are
/// logged and dropped, matching the firmware's tolerance for a flaky store:
/// losing a best-difficulty update is preferable to stalling the pipeline.
pub trait Settings: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str);
    fn get_u16(&self, key: &str) -> Option<u16>;
    fn set_u16(&self, key: &str, value: u16);
    fn get_u64(&self, key: &str) -> Option<u64>;
    fn set_u64(&self, key: &str, value: u64);

    fn wifi_ssid(&self) -> String {
        self.get_string(keys::WIFI_SSID)
            .unwrap_or_else(|| defaults::WIFI_SSID.into())
    }

    fn wifi_pass(&self) -> String {
        self.get_string(keys::WIFI_PASS)
            .unwrap_or_else(|| defaults::WIFI_PASS.into())
    }

    fn hostname(&self) -> String {
        self.get_string(keys::HOSTNAME)
            .unwrap_or_else(|| defaults::HOSTNAME.into())
    }

    fn stratum_url(&self) -> String {
        self.get_string(keys::STRATUM_URL)
            .unwrap_or_else(|| defaults::STRATUM_URL.into())
    }

    fn stratum_port(&self) -> u16 {
        self.get_u16(keys::STRATUM_PORT)
            .unwrap_or(defaults::STRATUM_PORT)
    }

    fn stratum_user(&self) -> String {
        self.get_string(keys::STRATUM_USER)
            .unwrap_or_else(|| defaults::STRATUM_USER.into())
    }

    fn stratum_pass(&self) -> String {
        self.get_string(keys::STRATUM_PASS)
            .unwrap_or_else(|| defaults::STRATUM_PASS.into())
    }

    /// Fallback pool URL; defaults to the primary when unset.
    fn fallback_stratum_url(&self) -> String {
        self.get_string(keys::FALLBACK_STRATUM_URL)
            .unwrap_or_else(|| self.stratum_url())
    }

    fn fallback_stratum_port(&self) -> u16 {
        self.get_u16(keys::FALLBACK_STRATUM_PORT)
            .unwrap_or_else(|| self.stratum_port())
    }

    fn fallback_stratum_user(&self) -> String {
        self.get_string(keys::FALLBACK_STRATUM_USER)
            .unwrap_or_else(|| self.stratum_user())
    }

    fn fallback_stratum_pass(&self) -> String {
        self.get_string(keys::FALLBACK_STRATUM_PASS)
            .unwrap_or_else(|| self.stratum_pass())
    }

    /// Configured chip model; unknown names fall back to BM1366.
    fn asic_model(&self) -> AsicModel {
        match self.get_string(keys::ASIC_MODEL) {
            None => AsicModel::Bm1366,
            Some(name) => name.parse().unwrap_or_else(|_| {
                warn!(model = %name, "Unknown ASIC model in settings, using BM1366");
                AsicModel::Bm1366
            }),
        }
    }

    /// Target hash frequency in MHz.
    fn asic_frequency(&self) -> u16 {
        self.get_u16(keys::ASIC_FREQUENCY)
            .unwrap_or(defaults::ASIC_FREQUENCY_MHZ)
    }

    /// Core voltage in millivolts (applied by the power collaborator).
    fn asic_voltage(&self) -> u16 {
        self.get_u16(keys::ASIC_VOLTAGE)
            .unwrap_or(defaults::ASIC_VOLTAGE_MV)
    }

    /// Best share difficulty ever found, floored at 0.
    fn best_difficulty(&self) -> u64 {
        self.get_u64(keys::BEST_DIFF).unwrap_or(0)
    }

    fn set_best_difficulty(&self, diff: u64) {
        self.set_u64(keys::BEST_DIFF, diff);
    }

    fn overheat_mode(&self) -> u16 {
        self.get_u16(keys::OVERHEAT_MODE).unwrap_or(0)
    }

    /// Make sure `overheat_mode` exists in the store so the thermal
    /// collaborator always finds a value.
    fn ensure_overheat_mode(&self) {
        if self.get_u16(keys::OVERHEAT_MODE).is_none() {
            self.set_u16(keys::OVERHEAT_MODE, 0);
            info!("Default value for overheat_mode set to 0");
        }
    }
}

/// JSON file-backed settings store.
///
/// The whole store is a flat JSON object, rewritten on every set. Writes are
/// serialized through the interior mutex.
pub struct FileSettings {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Value>>,
}

impl FileSettings {
    /// Open a settings file, creating an empty store if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let map = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn set_value(&self, key: &str, value: Value) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), value);
        let serialized = match serde_json::to_vec_pretty(&*map) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key, error = %err, "Could not serialize settings");
                return;
            }
        };
        if let Err(err) = std::fs::write(&self.path, serialized) {
            warn!(key, error = %err, "Could not write settings file");
        }
    }
}

impl Settings for FileSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        let map = self.map.lock().unwrap();
        map.get(key)?.as_str().map(String::from)
    }

    fn set_string(&self, key: &str, value: &str) {
        self.set_value(key, Value::String(value.to_string()));
    }

    fn get_u16(&self, key: &str) -> Option<u16> {
        let map = self.map.lock().unwrap();
        map.get(key)?.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    fn set_u16(&self, key: &str, value: u16) {
        self.set_value(key, Value::from(value));
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        let map = self.map.lock().unwrap();
        map.get(key)?.as_u64()
    }

    fn set_u64(&self, key: &str, value: u64) {
        self.set_value(key, Value::from(value));
    }
}

/// In-memory settings store for tests and bench setups.
#[derive(Default)]
pub struct MemSettings {
    map: Mutex<BTreeMap<String, Value>>,
}

impl MemSettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        let map = self.map.lock().unwrap();
        map.get(key)?.as_str().map(String::from)
    }

    fn set_string(&self, key: &str, value: &str) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), Value::String(value.to_string()));
    }

    fn get_u16(&self, key: &str) -> Option<u16> {
        let map = self.map.lock().unwrap();
        map.get(key)?.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    fn set_u16(&self, key: &str, value: u16) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), Value::from(value));
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        let map = self.map.lock().unwrap();
        map.get(key)?.as_u64()
    }

    fn set_u64(&self, key: &str, value: u64) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), Value::from(value));
    }
}

/// Pool connection state as reflected to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of user-visible miner state.
///
/// Owned by the core, rendered by external surfaces (screen, HTTP). The
/// string fields are preformatted so renderers stay dumb.
#[derive(Debug, Clone, Default)]
pub struct MinerStatus {
    pub wifi_status: String,
    pub pool_state: PoolState,
    pub using_fallback: bool,
    pub overheated: bool,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub hashrate: crate::types::HashRate,
    pub best_diff_string: String,
    pub best_session_diff_string: String,
    pub found_block: bool,
}

/// Shared handle to the status snapshot.
pub type StatusHandle = Arc<RwLock<MinerStatus>>;

/// Create a fresh status handle seeded from persisted settings.
pub fn new_status(settings: &dyn Settings) -> StatusHandle {
    let status = MinerStatus {
        best_diff_string: crate::types::suffix_string(settings.best_difficulty()),
        best_session_diff_string: crate::types::suffix_string(0),
        ..Default::default()
    };
    Arc::new(RwLock::new(status))
}
