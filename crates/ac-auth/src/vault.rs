use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto;
use crate::errors::VaultError;

const DOMAIN_SEPARATOR: &str = "__AUTHCHAIN_VAULT_V:2__";
const KEY_LEN: usize = 32;
const SALT_RANDOM_LEN: usize = 128;
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_MIN: Duration = Duration::from_millis(10);
const LOCK_RETRY_MAX: Duration = Duration::from_millis(200);
const TAG_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

type VaultResult<T> = std::result::Result<T, VaultError>;

/// Persistence of a single long-lived secret (a refresh token).
///
/// Implementations must treat missing or unreadable data as "no secret"
/// rather than an error, so callers fall back to re-authentication.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    /// Whether everything needed to load a secret is on disk
    async fn has(&self) -> bool;

    /// Load the secret, `None` if absent or unrecoverable
    async fn load(&self) -> VaultResult<Option<String>>;

    async fn save(&self, secret: &str) -> VaultResult<()>;

    async fn delete(&self) -> VaultResult<()>;
}

/// How the secret is kept on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Plaintext file in the working directory, inspectable by the user
    #[default]
    Lite,
    /// AES-256-CBC ciphertext with locally generated key material
    Encrypted,
}

/// Locations for both storage modes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    pub mode: StorageMode,
    pub lite_path: PathBuf,
    pub token_path: PathBuf,
    pub key_path: PathBuf,
    pub salt_path: PathBuf,
}

impl VaultConfig {
    /// OS-appropriate locations: ciphertext under the per-user data dir,
    /// key and salt under the per-machine local data dir.
    pub fn default_paths(mode: StorageMode) -> VaultResult<Self> {
        let dirs = directories::ProjectDirs::from("dev", "authchain", "authchain-mc")
            .ok_or(VaultError::NoStorageDir)?;

        Ok(Self {
            mode,
            lite_path: PathBuf::from("token.txt"),
            token_path: dirs.data_dir().join("vault").join("secret.bin"),
            key_path: dirs.data_local_dir().join("vault").join("key.bin"),
            salt_path: dirs.data_local_dir().join("vault-salt").join("salt.txt"),
        })
    }

    /// Every file under a single directory
    pub fn in_dir(mode: StorageMode, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            mode,
            lite_path: dir.join("token.txt"),
            token_path: dir.join("secret.bin"),
            key_path: dir.join("key.bin"),
            salt_path: dir.join("salt.txt"),
        }
    }

    /// Build the store selected by `mode`
    pub fn open(&self) -> Arc<dyn SecretStore> {
        match self.mode {
            StorageMode::Lite => Arc::new(PlainSecretStore::new(&self.lite_path)),
            StorageMode::Encrypted => Arc::new(EncryptedSecretStore::new(
                &self.token_path,
                &self.key_path,
                &self.salt_path,
            )),
        }
    }
}

/// Plaintext storage of the secret in a single file
#[derive(Debug, Clone)]
pub struct PlainSecretStore {
    path: PathBuf,
}

impl PlainSecretStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl SecretStore for PlainSecretStore {
    async fn has(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn load(&self) -> VaultResult<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(secret) if secret.is_empty() => Ok(None),
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, secret: &str) -> VaultResult<()> {
        write_atomic(&self.path, secret.as_bytes()).await?;
        debug!(path = %self.path.display(), "saved plaintext secret");
        Ok(())
    }

    async fn delete(&self) -> VaultResult<()> {
        remove_if_exists(&self.path).await
    }
}

/// Encrypted storage: `iv || ciphertext` beside a random key and salt.
///
/// Losing either the key or the salt makes the secret unrecoverable;
/// [`load`](SecretStore::load) then reports no secret.
#[derive(Debug, Clone)]
pub struct EncryptedSecretStore {
    token_path: PathBuf,
    key_path: PathBuf,
    salt_path: PathBuf,
    lock_path: PathBuf,
}

impl EncryptedSecretStore {
    pub fn new(
        token_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        salt_path: impl AsRef<Path>,
    ) -> Self {
        let token_path = token_path.as_ref().to_path_buf();
        let lock_path = token_path.with_extension("lock");
        Self {
            token_path,
            key_path: key_path.as_ref().to_path_buf(),
            salt_path: salt_path.as_ref().to_path_buf(),
            lock_path,
        }
    }

    /// Acquire an exclusive lock on the storage, waiting up to [`LOCK_TIMEOUT`]
    async fn acquire_lock(&self) -> VaultResult<std::fs::File> {
        ensure_parent(&self.lock_path).await?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        let mut delay = LOCK_RETRY_MIN;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() + delay > deadline {
                warn!(path = %self.lock_path.display(), "timed out waiting for vault lock");
                return Err(VaultError::LockTimeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(LOCK_RETRY_MAX);
        }
    }

    /// Create the key and salt files if either is missing
    async fn ensure_key_material(&self) -> VaultResult<()> {
        if !fs::try_exists(&self.salt_path).await? {
            let salt = generate_salt()?;
            write_atomic(&self.salt_path, salt.as_bytes()).await?;
            debug!(path = %self.salt_path.display(), "generated vault salt");
        }

        if !fs::try_exists(&self.key_path).await? {
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            crypto::random_bytes(key.as_mut_slice())?;
            write_atomic(&self.key_path, key.as_slice()).await?;
            debug!(path = %self.key_path.display(), "generated vault key");
        }

        Ok(())
    }

    async fn derived_key(&self) -> VaultResult<Zeroizing<Vec<u8>>> {
        let key = Zeroizing::new(fs::read(&self.key_path).await?);
        let salt = Zeroizing::new(fs::read_to_string(&self.salt_path).await?);
        Ok(derive_key(&key, &salt))
    }
}

#[async_trait::async_trait]
impl SecretStore for EncryptedSecretStore {
    async fn has(&self) -> bool {
        let exists = |path: &Path| {
            let path = path.to_path_buf();
            async move { fs::try_exists(path).await.unwrap_or(false) }
        };
        exists(&self.token_path).await
            && exists(&self.key_path).await
            && exists(&self.salt_path).await
    }

    async fn load(&self) -> VaultResult<Option<String>> {
        if !self.has().await {
            return Ok(None);
        }

        let blob = fs::read(&self.token_path).await?;
        if blob.is_empty() {
            return Ok(None);
        }

        let key = self.derived_key().await?;
        let plaintext = match crypto::decrypt(&blob, &key) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(VaultError::Decryption) => {
                warn!(
                    path = %self.token_path.display(),
                    "stored secret could not be decrypted, treating as absent"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match String::from_utf8(plaintext.to_vec()) {
            Ok(secret) => Ok(Some(secret)),
            Err(_) => {
                warn!(
                    path = %self.token_path.display(),
                    "decrypted secret is not valid UTF-8, treating as absent"
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, secret: &str) -> VaultResult<()> {
        let _lock = self.acquire_lock().await?;

        self.ensure_key_material().await?;
        let key = self.derived_key().await?;
        let blob = crypto::encrypt(secret.as_bytes(), &key)?;

        write_atomic(&self.token_path, &blob).await?;
        debug!(path = %self.token_path.display(), "saved encrypted secret");
        Ok(())
    }

    async fn delete(&self) -> VaultResult<()> {
        let _lock = self.acquire_lock().await?;
        remove_if_exists(&self.token_path).await
    }
}

/// 64 ASCII bytes: hex SHA-256 of `base64(key) || separator || salt`
pub fn derive_key(key: &[u8], salt: &str) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(STANDARD.encode(key).as_bytes());
    hasher.update(DOMAIN_SEPARATOR.as_bytes());
    hasher.update(salt.as_bytes());
    Zeroizing::new(hex::encode(hasher.finalize()).into_bytes())
}

/// Random salt blob: base64 of 128 random bytes, a `XXX-XXX` tag, a v4 uuid
pub fn generate_salt() -> VaultResult<String> {
    let mut random = [0u8; SALT_RANDOM_LEN];
    crypto::random_bytes(&mut random)?;

    let mut salt = STANDARD.encode(random);
    salt.push_str(&random_tag()?);
    salt.push_str(&uuid::Uuid::new_v4().to_string());
    Ok(salt)
}

fn random_tag() -> VaultResult<String> {
    let mut bytes = [0u8; 6];
    crypto::random_bytes(&mut bytes)?;

    let mut tag = String::with_capacity(7);
    for (i, b) in bytes.iter().enumerate() {
        if i == 3 {
            tag.push('-');
        }
        tag.push(TAG_ALPHABET[*b as usize % TAG_ALPHABET.len()] as char);
    }
    Ok(tag)
}

async fn ensure_parent(path: &Path) -> VaultResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
    }
    Ok(())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> VaultResult<()> {
    ensure_parent(path).await?;

    // Atomic write: write to temp file, then rename
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&temp_path, contents).await?;

    let file = std::fs::File::open(&temp_path)?;
    file.sync_all()?;

    fs::rename(&temp_path, path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

async fn remove_if_exists(path: &Path) -> VaultResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stores(dir: &TempDir) -> Vec<Arc<dyn SecretStore>> {
        vec![
            VaultConfig::in_dir(StorageMode::Lite, dir.path()).open(),
            VaultConfig::in_dir(StorageMode::Encrypted, dir.path().join("enc")).open(),
        ]
    }

    #[tokio::test]
    async fn test_both_modes_share_contract() {
        let dir = TempDir::new().unwrap();

        for store in stores(&dir) {
            assert!(!store.has().await);
            assert_eq!(store.load().await.unwrap(), None);

            store.save("M.C123_refresh").await.unwrap();
            assert!(store.has().await);
            assert_eq!(store.load().await.unwrap().as_deref(), Some("M.C123_refresh"));

            store.save("M.C456_rotated").await.unwrap();
            assert_eq!(store.load().await.unwrap().as_deref(), Some("M.C456_rotated"));

            store.delete().await.unwrap();
            assert!(!store.has().await);
            assert_eq!(store.load().await.unwrap(), None);

            // deleting twice is fine
            store.delete().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_encrypted_file_does_not_contain_plaintext() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::in_dir(StorageMode::Encrypted, dir.path());
        config.open().save("very-secret-token").await.unwrap();

        let blob = std::fs::read(&config.token_path).unwrap();
        assert!(blob.len() > crypto::IV_LEN);
        assert!(!String::from_utf8_lossy(&blob).contains("very-secret-token"));
        assert_eq!(std::fs::read(&config.key_path).unwrap().len(), KEY_LEN);
    }

    #[tokio::test]
    async fn test_key_material_survives_resave() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::in_dir(StorageMode::Encrypted, dir.path());
        let store = config.open();

        store.save("first").await.unwrap();
        let key = std::fs::read(&config.key_path).unwrap();
        let salt = std::fs::read_to_string(&config.salt_path).unwrap();

        store.save("second").await.unwrap();
        assert_eq!(std::fs::read(&config.key_path).unwrap(), key);
        assert_eq!(std::fs::read_to_string(&config.salt_path).unwrap(), salt);

        // a fresh store over the same files reads the secret back
        assert_eq!(config.open().load().await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_lost_salt_means_no_token() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::in_dir(StorageMode::Encrypted, dir.path());
        let store = config.open();
        store.save("token").await.unwrap();

        std::fs::remove_file(&config.salt_path).unwrap();
        assert!(!store.has().await);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replaced_key_fails_open() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::in_dir(StorageMode::Encrypted, dir.path());
        let store = config.open();
        store.save("token").await.unwrap();

        std::fs::write(&config.key_path, [9u8; KEY_LEN]).unwrap();
        match store.load().await {
            Ok(None) => {}
            Ok(Some(secret)) => assert_ne!(secret, "token"),
            Err(e) => panic!("corruption must not surface as an error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_corrupted_ciphertext_is_absent() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::in_dir(StorageMode::Encrypted, dir.path());
        let store = config.open();
        store.save("token").await.unwrap();

        std::fs::write(&config.token_path, b"not a ciphertext").unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        std::fs::write(&config.token_path, b"").unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_keeps_key_material() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::in_dir(StorageMode::Encrypted, dir.path());
        let store = config.open();
        store.save("token").await.unwrap();
        store.delete().await.unwrap();

        assert!(config.key_path.exists());
        assert!(config.salt_path.exists());
        assert!(!config.token_path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_saves_wait_their_turn() {
        let dir = TempDir::new().unwrap();

        for store in stores(&dir) {
            let (a, b) = tokio::join!(store.save("token-a"), store.save("token-b"));
            a.unwrap();
            b.unwrap();

            let loaded = store.load().await.unwrap();
            assert!(matches!(loaded.as_deref(), Some("token-a") | Some("token-b")));

            let (saved, deleted) = tokio::join!(store.save("token-c"), store.delete());
            saved.unwrap();
            deleted.unwrap();
        }
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let store = EncryptedSecretStore::new(
            dir.path().join("secret.bin"),
            dir.path().join("key.bin"),
            dir.path().join("salt.txt"),
        );

        let held = store.acquire_lock().await.unwrap();
        let started = Instant::now();
        assert!(matches!(
            store.save("token").await,
            Err(VaultError::LockTimeout)
        ));
        assert!(started.elapsed() >= LOCK_TIMEOUT - LOCK_RETRY_MAX);

        drop(held);
        store.save("token").await.unwrap();
    }

    #[test]
    fn test_derived_key_is_64_hex_bytes() {
        let key = derive_key(&[1u8; KEY_LEN], "salt");
        assert_eq!(key.len(), crypto::KEY_SIZE);
        assert!(key.iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(*key, *derive_key(&[1u8; KEY_LEN], "salt"));
        assert_ne!(*key, *derive_key(&[1u8; KEY_LEN], "other salt"));
    }

    #[test]
    fn test_salt_shape() {
        let salt = generate_salt().unwrap();
        // base64 of 128 bytes is 172 chars, then "XXX-XXX", then a 36 char uuid
        assert_eq!(salt.len(), 172 + 7 + 36);
        assert_eq!(&salt[175..176], "-");
        assert_ne!(salt, generate_salt().unwrap());
    }
}
