use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use tracing::warn;

const KEYRING_SERVICE: &str = "dev.tether.sync";
const SESSION_TOKEN_ACCOUNT: &str = "session_token";

/// Environment override for the session store token (CI and headless hosts).
pub const TOKEN_ENV_VAR: &str = "TETHER_TOKEN";

/// Source of the credential used for session store calls. Polled at the
/// start of every sync pass.
pub trait CredentialSource: Send + Sync {
    fn get_token(&self) -> Option<String>;
}

/// Token held in memory; set by the host after sign-in.
#[derive(Debug, Default)]
pub struct StaticCredentialSource {
    token: Mutex<Option<String>>,
}

impl StaticCredentialSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token: Mutex::new(token) }
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = token;
        }
    }
}

impl CredentialSource for StaticCredentialSource {
    fn get_token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Token stored in the OS keychain, with a `TETHER_TOKEN` override.
pub struct KeyringCredentialSource<S: SecretStore = KeyringSecretStore> {
    store: S,
}

impl KeyringCredentialSource<KeyringSecretStore> {
    pub fn new() -> Self {
        Self { store: KeyringSecretStore }
    }
}

impl Default for KeyringCredentialSource<KeyringSecretStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SecretStore> KeyringCredentialSource<S> {
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    pub fn store_token(&self, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            bail!("session token must not be empty");
        }
        self.store
            .set_secret(KEYRING_SERVICE, SESSION_TOKEN_ACCOUNT, token)
            .context("failed to persist session token in keychain")
    }

    pub fn clear_token(&self) -> Result<()> {
        self.store
            .delete_secret(KEYRING_SERVICE, SESSION_TOKEN_ACCOUNT)
            .context("failed to clear session token from keychain")
    }
}

impl<S: SecretStore> CredentialSource for KeyringCredentialSource<S> {
    fn get_token(&self) -> Option<String> {
        if let Some(token) = std::env::var(TOKEN_ENV_VAR).ok().filter(|value| !value.trim().is_empty()) {
            return Some(token);
        }

        match self.store.get_secret(KEYRING_SERVICE, SESSION_TOKEN_ACCOUNT) {
            Ok(token) => token.filter(|value| !value.trim().is_empty()),
            Err(error) => {
                warn!(error = %error, "failed to read session token from keychain");
                None
            }
        }
    }
}

pub trait SecretStore: Send + Sync {
    fn set_secret(&self, service: &str, account: &str, value: &str) -> Result<()>;
    fn get_secret(&self, service: &str, account: &str) -> Result<Option<String>>;
    fn delete_secret(&self, service: &str, account: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringSecretStore;

impl SecretStore for KeyringSecretStore {
    fn set_secret(&self, service: &str, account: &str, value: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, account)
            .context("failed to initialize keychain entry")?;
        entry.set_password(value).context("failed to write keychain entry")?;
        Ok(())
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<Option<String>> {
        let entry = keyring::Entry::new(service, account)
            .context("failed to initialize keychain entry")?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(error).context("failed to read keychain entry"),
        }
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, account)
            .context("failed to initialize keychain entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(error).context("failed to delete keychain entry"),
        }
    }
}

pub fn ensure_owner_only_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read metadata for `{}`", path.display()))?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}

pub fn ensure_owner_only_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read metadata for `{}`", path.display()))?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}
