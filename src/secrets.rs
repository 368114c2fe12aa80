use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const PLACES_KEY_ALIAS: &str = "google-places-api-key";

/// Provider credentials kept outside the environment.
#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn get(&self, account: &str) -> AppResult<Option<SecretString>> {
        let secret = match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Some(SecretString::from(value)),
                    Err(keyring::Error::NoEntry) => None,
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => store.lock().get(account).cloned(),
        };
        if secret.is_some() {
            debug!(
                target: "secret_vault",
                service = %self.service_name,
                account,
                "loaded secret from secure backend"
            );
        }
        Ok(secret)
    }

    pub fn store(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        if secret.expose_secret().trim().is_empty() {
            return Err(AppError::Config(format!("refusing to store empty secret for {account}")));
        }
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
        }
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored secret in secure backend"
        );
        Ok(())
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.get(account).map(|secret| secret.is_some())
    }

    /// Environment value wins; otherwise fall back to the vault entry.
    pub fn resolve(
        &self,
        account: &str,
        from_env: Option<SecretString>,
    ) -> AppResult<Option<SecretString>> {
        match from_env {
            Some(secret) => Ok(Some(secret)),
            None => self.get(account),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_reads_back_secret() {
        let vault = SecretVault::in_memory();
        assert!(!vault.has(PLACES_KEY_ALIAS).unwrap());

        vault
            .store(PLACES_KEY_ALIAS, &SecretString::from("abc123".to_string()))
            .unwrap();
        let loaded = vault.get(PLACES_KEY_ALIAS).unwrap().unwrap();
        assert_eq!(loaded.expose_secret(), "abc123");
    }

    #[test]
    fn environment_value_takes_precedence() {
        let vault = SecretVault::in_memory();
        vault
            .store(PLACES_KEY_ALIAS, &SecretString::from("vault".to_string()))
            .unwrap();

        let resolved = vault
            .resolve(PLACES_KEY_ALIAS, Some(SecretString::from("env".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.expose_secret(), "env");

        let fallback = vault.resolve(PLACES_KEY_ALIAS, None).unwrap().unwrap();
        assert_eq!(fallback.expose_secret(), "vault");
    }

    #[test]
    fn rejects_blank_secret() {
        let vault = SecretVault::in_memory();
        let result = vault.store(PLACES_KEY_ALIAS, &SecretString::from("  ".to_string()));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
