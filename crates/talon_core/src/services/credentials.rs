//! Credential storage with configurable providers.
//!
//! ## Provider Selection
//!
//! - **Debug builds**: File-based storage at `<config dir>/talon/dev_credentials.json`
//!   - Avoids keychain prompts with unsigned development builds
//!   - Override with `TALON_USE_KEYCHAIN=1` to force keychain usage
//! - **Release builds**: OS keychain (macOS Keychain, Windows Credential Manager, Linux Secret Service)
//!
//! ## Accounts
//!
//! Each field of the active credential set is stored under its own account name in the
//! [`SERVICE_NAMESPACE`] service. Only the accounts of the active method exist at any
//! time; configuring a method removes the others.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keyring::Entry;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{CredentialError, Result, TalonError};
use crate::models::{AuthMethod, Credentials};
use crate::services::identity::ClientIdentity;

/// Service name used for keychain entries.
pub const SERVICE_NAMESPACE: &str = "dev.talon.Console";

/// Environment variable to force keychain usage in debug builds.
const FORCE_KEYCHAIN_ENV: &str = "TALON_USE_KEYCHAIN";

/// Account names under the service namespace.
pub mod accounts {
    pub const API_KEY: &str = "apiKey";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const CERTIFICATE_PATH: &str = "certificatePath";
    pub const KEY_PATH: &str = "keyPath";
    pub const CA_CERTIFICATE_PATH: &str = "caCertificatePath";
    pub const SERVER_URL: &str = "serverURL";

    /// Every account the store may write.
    pub const ALL: [&str; 7] =
        [API_KEY, USERNAME, PASSWORD, CERTIFICATE_PATH, KEY_PATH, CA_CERTIFICATE_PATH, SERVER_URL];
}

// ============================================================================
// CredentialsProvider Trait
// ============================================================================

/// Backend for secret persistence.
pub trait CredentialsProvider: Send + Sync {
    /// Store a value under an account.
    fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Get a value, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a value. Deleting an absent account succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check if a value exists.
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

// ============================================================================
// FileCredentialsProvider
// ============================================================================

/// Owner-only JSON file storage for development builds.
#[derive(Debug)]
pub struct FileCredentialsProvider {
    file_path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialsFile {
    service: String,
    credentials: HashMap<String, String>,
}

impl FileCredentialsProvider {
    /// Create a provider at the default location.
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| TalonError::storage("Could not determine config directory", None))?
            .join("talon");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|e| {
                TalonError::storage(
                    format!("Failed to create config directory: {e}"),
                    Some("Check permissions for the talon config directory"),
                )
            })?;
        }

        Self::with_path(config_dir.join("dev_credentials.json"))
    }

    /// Create a provider backed by a specific file.
    pub fn with_path(file_path: PathBuf) -> Result<Self> {
        let provider = Self { file_path, cache: RwLock::new(HashMap::new()) };
        provider.load_from_file()?;
        Ok(provider)
    }

    fn load_from_file(&self) -> Result<()> {
        if !self.file_path.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(&self.file_path).map_err(|e| {
            TalonError::storage(format!("Failed to read credentials file: {e}"), None)
        })?;
        if contents.trim().is_empty() {
            return Ok(());
        }

        let creds_file: CredentialsFile = serde_json::from_str(&contents).map_err(|e| {
            TalonError::storage(format!("Invalid credentials file format: {e}"), None)
        })?;

        *self.cache.write() = creds_file.credentials;
        Ok(())
    }

    fn save_to_file(&self, cache: &HashMap<String, String>) -> Result<()> {
        let creds_file =
            CredentialsFile { service: SERVICE_NAMESPACE.to_string(), credentials: cache.clone() };
        let json = serde_json::to_string_pretty(&creds_file)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.file_path).map_err(|e| {
            TalonError::storage(format!("Failed to create credentials file: {e}"), None)
        })?;
        file.write_all(json.as_bytes()).map_err(|e| {
            TalonError::storage(format!("Failed to write credentials file: {e}"), None)
        })?;
        Ok(())
    }
}

impl CredentialsProvider for FileCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        let mut cache = self.cache.write();
        cache.insert(key.to_string(), value.to_string());
        self.save_to_file(&cache)?;
        tracing::debug!(key = key, "Credential stored in file");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut cache = self.cache.write();
        if cache.remove(key).is_some() {
            self.save_to_file(&cache)?;
            tracing::debug!(key = key, "Credential deleted from file");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FileCredentialsProvider"
    }
}

// ============================================================================
// KeychainCredentialsProvider
// ============================================================================

/// OS keychain storage for release builds.
#[derive(Debug)]
pub struct KeychainCredentialsProvider {
    service: String,
}

impl Default for KeychainCredentialsProvider {
    fn default() -> Self {
        Self { service: SERVICE_NAMESPACE.to_string() }
    }
}

impl KeychainCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom service name.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

impl CredentialsProvider for KeychainCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        Entry::new(&self.service, key)?.set_password(value)?;
        tracing::debug!(key = key, "Credential stored in keychain");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match Entry::new(&self.service, key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match Entry::new(&self.service, key)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = key, "Credential deleted from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "KeychainCredentialsProvider"
    }
}

// ============================================================================
// SessionCredentialsProvider (Fallback)
// ============================================================================

/// In-memory storage, lost when the process exits.
#[derive(Debug, Default)]
pub struct SessionCredentialsProvider {
    store: RwLock<HashMap<String, String>>,
}

impl SessionCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for SessionCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.store.write().insert(key.to_string(), value.to_string());
        tracing::debug!(key = key, "Credential stored in session");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.store.write().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SessionCredentialsProvider"
    }
}

/// Select the provider for this build.
pub fn select_provider() -> Box<dyn CredentialsProvider> {
    let force_keychain = std::env::var(FORCE_KEYCHAIN_ENV).map(|v| v == "1").unwrap_or(false);

    #[cfg(debug_assertions)]
    {
        if force_keychain {
            tracing::debug!(
                provider = "KeychainCredentialsProvider",
                reason = "TALON_USE_KEYCHAIN=1",
                "Using keychain provider (override)"
            );
            return Box::new(KeychainCredentialsProvider::new());
        }

        match FileCredentialsProvider::new() {
            Ok(provider) => {
                tracing::debug!(
                    provider = "FileCredentialsProvider",
                    reason = "debug build",
                    "Using file-based credential storage"
                );
                Box::new(provider)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create file provider, falling back to session");
                Box::new(SessionCredentialsProvider::new())
            }
        }
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = force_keychain;
        tracing::debug!(
            provider = "KeychainCredentialsProvider",
            reason = "release build",
            "Using keychain credential storage"
        );
        Box::new(KeychainCredentialsProvider::new())
    }
}

// ============================================================================
// CredentialStore
// ============================================================================

#[derive(Default)]
struct StoreState {
    credentials: Option<Credentials>,
    identity: Option<Arc<ClientIdentity>>,
    generation: u64,
}

/// Owner of the active credential set.
///
/// Mutations (`configure`, `clear_credentials`) are serialized by a single write lock,
/// so readers only ever observe a complete credential set. Every mutation bumps
/// [`generation`](Self::generation), which transports use to drop cached clients.
pub struct CredentialStore {
    provider: Box<dyn CredentialsProvider>,
    state: RwLock<StoreState>,
    // Serializes identity materialization so concurrent callers read the files once.
    materialize_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create a store with the build's default provider and reload persisted credentials.
    pub fn new() -> Self {
        let provider = select_provider();
        tracing::info!(provider = provider.name(), "Credential store initialized");
        Self::with_provider(provider)
    }

    /// Create a store over a specific provider and reload persisted credentials.
    pub fn with_provider(provider: Box<dyn CredentialsProvider>) -> Self {
        let store = Self {
            provider,
            state: RwLock::new(StoreState::default()),
            materialize_lock: Mutex::new(()),
        };
        store.reload();
        store
    }

    /// Name of the active provider.
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Re-read persisted credentials. Missing or incomplete data leaves the store
    /// unconfigured.
    pub fn reload(&self) -> bool {
        let loaded = match self.read_persisted() {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable persisted credentials");
                None
            }
        };

        let found = loaded.is_some();
        if let Some(creds) = &loaded {
            tracing::info!(
                server = %creds.server_url,
                method = creds.method.kind(),
                "Loaded persisted credentials"
            );
        } else {
            tracing::debug!("No persisted credentials");
        }

        let mut state = self.state.write();
        state.credentials = loaded;
        state.identity = None;
        state.generation += 1;
        found
    }

    fn read_persisted(&self) -> Result<Option<Credentials>> {
        let get = |key: &'static str| self.provider.get(key);

        let Some(server_url) = get(accounts::SERVER_URL)? else {
            return Ok(None);
        };

        let method = if let Some(token) = get(accounts::API_KEY)? {
            AuthMethod::api_key(token)
        } else if let Some(username) = get(accounts::USERNAME)? {
            let password = get(accounts::PASSWORD)?
                .ok_or(CredentialError::Incomplete { missing: accounts::PASSWORD })?;
            AuthMethod::basic(username, password)
        } else if let Some(cert) = get(accounts::CERTIFICATE_PATH)? {
            let key = get(accounts::KEY_PATH)?
                .ok_or(CredentialError::Incomplete { missing: accounts::KEY_PATH })?;
            let method = AuthMethod::mutual_tls(cert, key);
            match get(accounts::CA_CERTIFICATE_PATH)? {
                Some(ca) => method.with_ca(ca),
                None => method,
            }
        } else {
            return Err(CredentialError::Incomplete { missing: accounts::API_KEY }.into());
        };

        Ok(Some(Credentials::new(server_url, method)))
    }

    /// Validate, persist and activate a credential set.
    ///
    /// mTLS file paths are checked before anything is written.
    pub fn configure(&self, server_url: &str, method: AuthMethod) -> Result<Credentials> {
        let server_url = validate_server_url(server_url)?;

        if let AuthMethod::MutualTls { certificate_path, key_path, ca_path } = &method {
            for path in [Some(certificate_path), Some(key_path), ca_path.as_ref()].into_iter().flatten()
            {
                ensure_exists(path)?;
            }
        }

        let mut state = self.state.write();

        let mut fields: Vec<(&'static str, String)> =
            vec![(accounts::SERVER_URL, server_url.clone())];
        match &method {
            AuthMethod::ApiKey { token } => fields.push((accounts::API_KEY, token.clone())),
            AuthMethod::BasicAuth { username, password } => {
                fields.push((accounts::USERNAME, username.clone()));
                fields.push((accounts::PASSWORD, password.clone()));
            }
            AuthMethod::MutualTls { certificate_path, key_path, ca_path } => {
                fields.push((accounts::CERTIFICATE_PATH, path_string(certificate_path)));
                fields.push((accounts::KEY_PATH, path_string(key_path)));
                if let Some(ca) = ca_path {
                    fields.push((accounts::CA_CERTIFICATE_PATH, path_string(ca)));
                }
            }
        }

        for account in accounts::ALL {
            if !fields.iter().any(|(name, _)| *name == account) {
                self.provider.delete(account)?;
            }
        }
        for (account, value) in &fields {
            self.provider.store(account, value)?;
        }

        let credentials = Credentials::new(server_url, method);
        state.credentials = Some(credentials.clone());
        state.identity = None;
        state.generation += 1;

        tracing::info!(
            server = %credentials.server_url,
            method = credentials.method.kind(),
            generation = state.generation,
            "Credentials configured"
        );
        Ok(credentials)
    }

    /// The active credential set, if any.
    pub fn current_credentials(&self) -> Option<Credentials> {
        self.state.read().credentials.clone()
    }

    /// The active credential set, or `NotConfigured`.
    pub fn require_credentials(&self) -> Result<Credentials> {
        self.current_credentials()
            .ok_or_else(|| TalonError::not_configured("No server credentials configured"))
    }

    /// Check if credentials are active.
    pub fn is_configured(&self) -> bool {
        self.state.read().credentials.is_some()
    }

    /// Counter bumped by every configure, clear and reload.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Remove all persisted accounts and deactivate.
    pub fn clear_credentials(&self) -> Result<()> {
        let mut state = self.state.write();
        for account in accounts::ALL {
            self.provider.delete(account)?;
        }
        state.credentials = None;
        state.identity = None;
        state.generation += 1;
        tracing::info!("Credentials cleared");
        Ok(())
    }

    /// Build (once per configuration) the mTLS client identity.
    pub fn materialize_identity(&self) -> Result<Arc<ClientIdentity>> {
        let _guard = self.materialize_lock.lock();

        let (credentials, generation) = {
            let state = self.state.read();
            if let Some(identity) = &state.identity {
                return Ok(Arc::clone(identity));
            }
            let credentials = state
                .credentials
                .clone()
                .ok_or_else(|| TalonError::not_configured("No server credentials configured"))?;
            (credentials, state.generation)
        };

        let AuthMethod::MutualTls { certificate_path, key_path, ca_path } = &credentials.method
        else {
            return Err(TalonError::identity(format!(
                "Active auth method is {}, not mutual TLS",
                credentials.method.kind()
            )));
        };

        let identity =
            Arc::new(ClientIdentity::from_files(certificate_path, key_path, ca_path.as_deref())?);

        let mut state = self.state.write();
        // A reconfigure raced with the file reads; do not cache stale material.
        if state.generation == generation {
            state.identity = Some(Arc::clone(&identity));
        }
        tracing::debug!(generation, "Client identity materialized");
        Ok(identity)
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CredentialStore")
            .field("provider", &self.provider.name())
            .field("credentials", &state.credentials)
            .field("generation", &state.generation)
            .finish()
    }
}

fn validate_server_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed)
        .map_err(|_| CredentialError::InvalidServerUrl { url: raw.to_string() })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(CredentialError::InvalidServerUrl { url: raw.to_string() }.into());
    }
    Ok(trimmed.to_string())
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CredentialError::FileNotFound { path: path.to_path_buf() }.into())
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    fn session_store() -> CredentialStore {
        CredentialStore::with_provider(Box::new(SessionCredentialsProvider::new()))
    }

    #[test]
    fn test_file_provider_store_and_get() {
        let dir = tempdir().unwrap();
        let provider = FileCredentialsProvider::with_path(dir.path().join("creds.json")).unwrap();

        provider.store("apiKey", "tok-1").unwrap();
        assert_eq!(provider.get("apiKey").unwrap(), Some("tok-1".to_string()));

        provider.delete("apiKey").unwrap();
        assert_eq!(provider.get("apiKey").unwrap(), None);
    }

    #[test]
    fn test_file_provider_persistence() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("creds.json");

        {
            let provider = FileCredentialsProvider::with_path(file_path.clone()).unwrap();
            provider.store("serverURL", "https://dfir.example.com").unwrap();
        }

        let provider = FileCredentialsProvider::with_path(file_path.clone()).unwrap();
        assert!(provider.exists("serverURL").unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&file_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_empty_store_is_unconfigured() {
        let store = session_store();
        assert!(store.current_credentials().is_none());
        assert!(matches!(store.require_credentials(), Err(TalonError::NotConfigured { .. })));
    }

    #[test]
    fn test_configure_api_key() {
        let store = session_store();
        let before = store.generation();

        let creds = store.configure("https://dfir.example.com:8889/", AuthMethod::api_key("tok-1")).unwrap();
        assert_eq!(creds.server_url, "https://dfir.example.com:8889");
        assert_eq!(store.current_credentials(), Some(creds));
        assert!(store.generation() > before);
    }

    #[test]
    fn test_configure_rejects_bad_url() {
        let store = session_store();
        for url in ["not a url", "ftp://dfir.example.com", ""] {
            let err = store.configure(url, AuthMethod::api_key("t")).unwrap_err();
            assert!(matches!(
                err,
                TalonError::Credential(CredentialError::InvalidServerUrl { .. })
            ));
        }
        assert!(!store.is_configured());
    }

    #[test]
    fn test_configure_mtls_missing_file_writes_nothing() {
        let dir = tempdir().unwrap();
        let provider = FileCredentialsProvider::with_path(dir.path().join("creds.json")).unwrap();
        let store = CredentialStore::with_provider(Box::new(provider));

        let err = store
            .configure(
                "https://dfir.example.com",
                AuthMethod::mutual_tls(fixture("client.crt"), dir.path().join("missing.key")),
            )
            .unwrap_err();

        assert!(matches!(err, TalonError::Credential(CredentialError::FileNotFound { .. })));
        assert!(!store.is_configured());
        assert!(!dir.path().join("creds.json").exists());
    }

    #[test]
    fn test_switching_methods_removes_old_accounts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let store = CredentialStore::with_provider(Box::new(
            FileCredentialsProvider::with_path(path.clone()).unwrap(),
        ));

        store.configure("https://a.example.com", AuthMethod::basic("admin", "hunter2")).unwrap();
        store.configure("https://a.example.com", AuthMethod::api_key("tok-2")).unwrap();

        let provider = FileCredentialsProvider::with_path(path).unwrap();
        assert_eq!(provider.get(accounts::API_KEY).unwrap(), Some("tok-2".to_string()));
        assert_eq!(provider.get(accounts::USERNAME).unwrap(), None);
        assert_eq!(provider.get(accounts::PASSWORD).unwrap(), None);
    }

    #[test]
    fn test_reload_on_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let method = AuthMethod::mutual_tls(fixture("client.crt"), fixture("client.key"))
            .with_ca(fixture("client.crt"));

        {
            let store = CredentialStore::with_provider(Box::new(
                FileCredentialsProvider::with_path(path.clone()).unwrap(),
            ));
            store.configure("https://dfir.example.com", method.clone()).unwrap();
        }

        let store = CredentialStore::with_provider(Box::new(
            FileCredentialsProvider::with_path(path).unwrap(),
        ));
        let creds = store.current_credentials().unwrap();
        assert_eq!(creds.server_url, "https://dfir.example.com");
        assert_eq!(creds.method, method);
    }

    #[test]
    fn test_incomplete_persisted_credentials_stay_unconfigured() {
        let provider = SessionCredentialsProvider::new();
        provider.store(accounts::SERVER_URL, "https://dfir.example.com").unwrap();
        provider.store(accounts::USERNAME, "admin").unwrap();

        let store = CredentialStore::with_provider(Box::new(provider));
        assert!(!store.is_configured());
    }

    #[test]
    fn test_clear_credentials() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let store = CredentialStore::with_provider(Box::new(
            FileCredentialsProvider::with_path(path.clone()).unwrap(),
        ));
        store.configure("https://dfir.example.com", AuthMethod::api_key("tok-1")).unwrap();

        store.clear_credentials().unwrap();
        assert!(!store.is_configured());

        let provider = FileCredentialsProvider::with_path(path).unwrap();
        for account in accounts::ALL {
            assert!(!provider.exists(account).unwrap(), "{account} survived clear");
        }
    }

    #[test]
    fn test_materialize_requires_mtls() {
        let store = session_store();
        assert!(matches!(store.materialize_identity(), Err(TalonError::NotConfigured { .. })));

        store.configure("https://dfir.example.com", AuthMethod::api_key("tok-1")).unwrap();
        assert!(matches!(store.materialize_identity(), Err(TalonError::Identity { .. })));
    }

    #[test]
    fn test_materialize_is_cached_until_reconfigured() {
        let store = session_store();
        let method = AuthMethod::mutual_tls(fixture("client.crt"), fixture("client.key"));
        store.configure("https://dfir.example.com", method.clone()).unwrap();

        let first = store.materialize_identity().unwrap();
        let second = store.materialize_identity().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        store.configure("https://dfir.example.com", method).unwrap();
        let third = store.materialize_identity().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
