//! Actor / device attribution for activity records.
//!
//! The desktop build reads the signed-in staff member and device label from
//! the OS credential store (DPAPI on Windows, Keychain on macOS, Secret
//! Service on Linux), written there by the login flow. Tests and headless
//! tools use [`StaticIdentity`].

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const SERVICE_NAME: &str = "peg-ledger";

const KEY_ACTOR_ID: &str = "actor_id";
const KEY_ACTOR_NAME: &str = "actor_name";
const KEY_DEVICE_LABEL: &str = "device_label";

const ALL_KEYS: &[&str] = &[KEY_ACTOR_ID, KEY_ACTOR_NAME, KEY_DEVICE_LABEL];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub device: String,
}

impl Actor {
    pub fn system(device: impl Into<String>) -> Self {
        Self {
            id: "system".into(),
            name: "System".into(),
            device: device.into(),
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Actor;
}

#[derive(Debug, Clone)]
pub struct StaticIdentity(pub Actor);

impl StaticIdentity {
    pub fn new(id: &str, name: &str, device: &str) -> Self {
        Self(Actor {
            id: id.into(),
            name: name.into(),
            device: device.into(),
        })
    }
}

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Actor {
        self.0.clone()
    }
}

/// Reads the actor from the OS keyring on every call so a staff change on
/// the terminal is picked up without restarting.
#[derive(Debug, Clone)]
pub struct KeyringIdentity {
    fallback_device: String,
}

impl KeyringIdentity {
    pub fn new(fallback_device: impl Into<String>) -> Self {
        Self {
            fallback_device: fallback_device.into(),
        }
    }

    /// Record the signed-in actor. Called by the login flow.
    pub fn store(actor: &Actor) -> Result<(), String> {
        set_credential(KEY_ACTOR_ID, &actor.id)?;
        set_credential(KEY_ACTOR_NAME, &actor.name)?;
        set_credential(KEY_DEVICE_LABEL, &actor.device)?;
        info!(actor_id = %actor.id, device = %actor.device, "actor identity stored");
        Ok(())
    }

    /// Forget the signed-in actor (sign-out).
    pub fn clear() -> Result<(), String> {
        for key in ALL_KEYS {
            delete_credential(key)?;
        }
        Ok(())
    }
}

impl IdentityProvider for KeyringIdentity {
    fn current(&self) -> Actor {
        let device =
            get_credential(KEY_DEVICE_LABEL).unwrap_or_else(|| self.fallback_device.clone());
        match get_credential(KEY_ACTOR_ID) {
            Some(id) => Actor {
                name: get_credential(KEY_ACTOR_NAME).unwrap_or_else(|| id.clone()),
                id,
                device,
            },
            None => Actor::system(device),
        }
    }
}

fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if !pw.trim().is_empty() => Some(pw.trim().to_string()),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity_returns_configured_actor() {
        let identity = StaticIdentity::new("staff-7", "Ravi", "front-desk");
        let actor = identity.current();
        assert_eq!(actor.id, "staff-7");
        assert_eq!(actor.name, "Ravi");
        assert_eq!(actor.device, "front-desk");
    }

    #[test]
    fn test_system_actor_keeps_device() {
        let actor = Actor::system("bar-tablet");
        assert_eq!(actor.id, "system");
        assert_eq!(actor.device, "bar-tablet");
    }
}
