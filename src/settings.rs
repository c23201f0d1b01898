//! Engine settings stored in the key-value store under `settings:<key>`.
//!
//! Each value is a plain string so a single setting can be changed from the
//! CLI without rewriting the others. Unparseable values fall back to the
//! default with a warning.

use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::DEFAULT_ACTIVITY_CAP;
use crate::error::{LedgerError, LedgerResult};
use crate::reconciliation::DEFAULT_TOLERANCE;
use crate::store::KvStore;

const PREFIX: &str = "settings:";

pub const KEY_CLIENT_ID: &str = "client_id";
pub const KEY_PERSIST_DEBOUNCE_MS: &str = "persist_debounce_ms";
pub const KEY_ACTIVITY_CAP: &str = "activity_cap";
pub const KEY_DISCREPANCY_TOLERANCE: &str = "discrepancy_tolerance";
pub const KEY_REPLAY_TIMEOUT_MS: &str = "replay_timeout_ms";
pub const KEY_START_ONLINE: &str = "start_online";

pub const ALL_KEYS: &[&str] = &[
    KEY_CLIENT_ID,
    KEY_PERSIST_DEBOUNCE_MS,
    KEY_ACTIVITY_CAP,
    KEY_DISCREPANCY_TOLERANCE,
    KEY_REPLAY_TIMEOUT_MS,
    KEY_START_ONLINE,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    pub client_id: String,
    pub persist_debounce_ms: u64,
    pub activity_cap: usize,
    pub discrepancy_tolerance: f64,
    pub replay_timeout_ms: u64,
    pub start_online: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            persist_debounce_ms: 500,
            activity_cap: DEFAULT_ACTIVITY_CAP,
            discrepancy_tolerance: DEFAULT_TOLERANCE,
            replay_timeout_ms: 10_000,
            start_online: true,
        }
    }
}

pub fn get_setting(store: &dyn KvStore, key: &str) -> LedgerResult<Option<String>> {
    store.get(&format!("{PREFIX}{key}"))
}

pub fn set_setting(store: &dyn KvStore, key: &str, value: &str) -> LedgerResult<()> {
    if !ALL_KEYS.contains(&key) {
        return Err(LedgerError::validation(format!("unknown setting: {key}")));
    }
    store.set(&format!("{PREFIX}{key}"), value.trim())
}

fn parsed_or<T: FromStr>(store: &dyn KvStore, key: &str, default: T) -> LedgerResult<T> {
    match get_setting(store, key)? {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Ok(v),
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparseable setting");
                Ok(default)
            }
        },
        None => Ok(default),
    }
}

impl EngineSettings {
    /// Load settings, generating and persisting a client id on first run.
    pub fn load(store: &dyn KvStore) -> LedgerResult<Self> {
        let defaults = Self::default();

        let client_id = match get_setting(store, KEY_CLIENT_ID)? {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                set_setting(store, KEY_CLIENT_ID, &defaults.client_id)?;
                info!(client_id = %defaults.client_id, "Generated client id");
                defaults.client_id.clone()
            }
        };

        let tolerance = parsed_or(store, KEY_DISCREPANCY_TOLERANCE, defaults.discrepancy_tolerance)?;
        let discrepancy_tolerance = if tolerance.is_finite() && tolerance >= 0.0 {
            tolerance
        } else {
            warn!(tolerance, "Discrepancy tolerance out of range, using default");
            defaults.discrepancy_tolerance
        };

        Ok(Self {
            client_id,
            persist_debounce_ms: parsed_or(store, KEY_PERSIST_DEBOUNCE_MS, defaults.persist_debounce_ms)?,
            activity_cap: parsed_or(store, KEY_ACTIVITY_CAP, defaults.activity_cap)?.max(1),
            discrepancy_tolerance,
            replay_timeout_ms: parsed_or(store, KEY_REPLAY_TIMEOUT_MS, defaults.replay_timeout_ms)?,
            start_online: parsed_or(store, KEY_START_ONLINE, defaults.start_online)?,
        })
    }

    pub fn save(&self, store: &dyn KvStore) -> LedgerResult<()> {
        set_setting(store, KEY_CLIENT_ID, &self.client_id)?;
        set_setting(store, KEY_PERSIST_DEBOUNCE_MS, &self.persist_debounce_ms.to_string())?;
        set_setting(store, KEY_ACTIVITY_CAP, &self.activity_cap.to_string())?;
        set_setting(store, KEY_DISCREPANCY_TOLERANCE, &self.discrepancy_tolerance.to_string())?;
        set_setting(store, KEY_REPLAY_TIMEOUT_MS, &self.replay_timeout_ms.to_string())?;
        set_setting(store, KEY_START_ONLINE, &self.start_online.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[test]
    fn test_first_load_generates_stable_client_id() {
        let store = MemoryKvStore::new();
        let first = EngineSettings::load(&store).unwrap();
        let second = EngineSettings::load(&store).unwrap();
        assert_eq!(first.client_id, second.client_id);
        assert!(Uuid::parse_str(&first.client_id).is_ok());
        assert_eq!(first.persist_debounce_ms, 500);
        assert_eq!(first.activity_cap, 1000);
        assert_eq!(first.discrepancy_tolerance, 0.1);
        assert_eq!(first.replay_timeout_ms, 10_000);
        assert!(first.start_online);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let store = MemoryKvStore::new();
        set_setting(&store, KEY_ACTIVITY_CAP, "250").unwrap();
        set_setting(&store, KEY_PERSIST_DEBOUNCE_MS, "soon").unwrap();
        set_setting(&store, KEY_DISCREPANCY_TOLERANCE, "-1").unwrap();
        set_setting(&store, KEY_START_ONLINE, "false").unwrap();

        let settings = EngineSettings::load(&store).unwrap();
        assert_eq!(settings.activity_cap, 250);
        assert_eq!(settings.persist_debounce_ms, 500);
        assert_eq!(settings.discrepancy_tolerance, 0.1);
        assert!(!settings.start_online);
    }

    #[test]
    fn test_unknown_setting_is_rejected() {
        let store = MemoryKvStore::new();
        assert!(matches!(
            set_setting(&store, "colour", "red"),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_save_round_trips() {
        let store = MemoryKvStore::new();
        let settings = EngineSettings {
            client_id: "bar-tablet".into(),
            persist_debounce_ms: 50,
            activity_cap: 10,
            discrepancy_tolerance: 0.5,
            replay_timeout_ms: 2_000,
            start_online: false,
        };
        settings.save(&store).unwrap();
        assert_eq!(EngineSettings::load(&store).unwrap(), settings);
    }
}
