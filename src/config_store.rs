//! Keyed configuration store with JSON datastore persistence.
//!
//! Every entry carries a `can_be_saved` marker; only marked entries are
//! written to `datastore/<group>.json`. The store is a shared handle passed
//! explicitly to the router and the HTTP handlers, with typed accessors for
//! the keys the protocol core consumes. Trust keys are kept base64-encoded
//! inside the JSON document.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::ConfigError;

/// Name of the configuration group the node boots from.
pub const GLOBAL_GROUP: &str = "global";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Value,
    can_be_saved: bool,
}

/// Thread-safe configuration handle backed by a JSON datastore directory.
#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), entries: Mutex::new(HashMap::new()) }
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.root.join(format!("{group}.json"))
    }

    /// Merge a configuration group from the datastore into the live store.
    pub fn load(&self, group: &str) -> Result<(), ConfigError> {
        let raw = fs::read_to_string(self.group_path(group))?;
        let parsed: HashMap<String, Entry> = serde_json::from_str(&raw)?;
        self.entries.lock().extend(parsed);
        Ok(())
    }

    /// Persist all `can_be_saved` entries of the live store to the group
    /// file. A store with nothing savable writes nothing.
    pub fn save(&self, group: &str) -> Result<(), ConfigError> {
        let to_save: HashMap<String, Entry> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.can_be_saved)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        if to_save.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.root)?;
        fs::write(self.group_path(group), serde_json::to_string_pretty(&to_save)?)?;
        Ok(())
    }

    /// Set a configuration item. Keys are lowercase; with `overwrite` unset
    /// an existing key keeps its value (used for boot-time defaults).
    pub fn set(&self, key: &str, value: Value, can_be_saved: bool, overwrite: bool) {
        let key = key.to_lowercase();
        let mut entries = self.entries.lock();
        if overwrite || !entries.contains_key(&key) {
            entries.insert(key, Entry { value, can_be_saved });
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(&key.to_lowercase()).map(|entry| entry.value.clone())
    }

    fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    // Typed accessors for the keys the core reads.

    /// Shared secret for Zombiegram HMAC signing, when configured.
    pub fn trust_key(&self) -> Option<Vec<u8>> {
        let encoded = self.get("device_trust_key")?;
        let encoded = encoded.as_str()?;
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(key) if key.is_empty() => None,
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "configured trust key is not valid base64, ignoring");
                None
            }
        }
    }

    pub fn set_trust_key(&self, key: Option<&[u8]>) {
        let value = match key {
            Some(key) => json!(base64::engine::general_purpose::STANDARD.encode(key)),
            None => Value::Null,
        };
        self.set("device_trust_key", value, true, true);
    }

    pub fn device_source_id(&self) -> Option<u32> {
        self.get("device_source_id")?.as_u64().map(|id| id as u32)
    }

    pub fn set_device_source_id(&self, source_id: u32) {
        self.set("device_source_id", json!(source_id), true, true);
    }

    pub fn is_gateway(&self) -> bool {
        self.get_bool("device_is_gateway")
    }

    pub fn is_router(&self) -> bool {
        self.get_bool("device_is_router")
    }

    pub fn tampered_flag(&self) -> bool {
        self.get_bool("lora_tampered_flag")
    }

    pub fn set_tampered_flag(&self, tampered: bool) {
        self.set("lora_tampered_flag", json!(tampered), true, true);
    }

    pub fn maintenance_flag(&self) -> bool {
        self.get_bool("lora_maintenance_flag")
    }

    pub fn set_maintenance_flag(&self, maintenance: bool) {
        self.set("lora_maintenance_flag", json!(maintenance), true, true);
    }

    pub fn seq_num(&self) -> u8 {
        self.get("lora_seq_num")
            .and_then(|v| v.as_u64())
            .map(|seq| (seq % 256) as u8)
            .unwrap_or(0)
    }

    /// The runtime sequence counter is volatile on purpose: persisting every
    /// increment would wear the flash.
    pub fn set_seq_num(&self, seq_num: u8) {
        self.set("lora_seq_num", json!(seq_num), false, true);
    }

    /// Configured gateway webhook URLs, empty slots skipped.
    pub fn webhooks(&self) -> Vec<String> {
        ["gateway_webhook_1", "gateway_webhook_2", "gateway_webhook_3"]
            .iter()
            .filter_map(|key| self.get(key))
            .filter_map(|v| v.as_str().map(str::to_string))
            .filter(|url| !url.is_empty())
            .collect()
    }

    /// Device GPS position as `(latitude, longitude)`.
    pub fn position(&self) -> Option<(f32, f32)> {
        let value = self.get("device_position")?;
        let coords = value.as_array()?;
        let lat = coords.first()?.as_f64()? as f32;
        let lon = coords.get(1)?.as_f64()? as f32;
        Some((lat, lon))
    }

    pub fn set_position(&self, latitude: f32, longitude: f32) {
        self.set("device_position", json!([latitude, longitude]), true, true);
    }
}
