//! Encrypted local secret store (C5): a password-derived, scrypt-keyed,
//! authenticated-encryption blob backing the `${secret:path:key}` reference
//! resolver (`reactorcide-secrets-ref`).
//!
//! Storage shape: a base directory holding a 32-byte salt file (`0600`) and
//! a single AES-256-GCM-encrypted blob (`0600`) containing the
//! JSON-serialized `{path: {key: value}}` map. Key derivation is
//! intentionally slow (scrypt, N=2^18, r=8, p=1) so an offline guessing
//! attack against a stolen blob is expensive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reactorcide_types::SecretStoreError;
use regex::Regex;
use scrypt::Params;

const SALT_FILE: &str = "salt";
const BLOB_FILE: &str = "secrets.enc";
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

// scrypt(N=2^18, r=8, p=1): deliberately slow, per the spec.
const SCRYPT_LOG_N: u8 = 18;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9/_-]+$").unwrap());
static KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

type SecretMap = BTreeMap<String, BTreeMap<String, String>>;

/// Handle onto an encrypted secret store rooted at a base directory.
pub struct SecretStore {
    base_dir: PathBuf,
}

impl SecretStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Creates the store (salt file + empty encrypted blob) if absent.
    /// Fails unless `force` when a store already exists at this path.
    pub fn init(&self, password: &str, force: bool) -> Result<(), SecretStoreError> {
        std::fs::create_dir_all(&self.base_dir).map_err(io_err)?;
        let salt_path = self.base_dir.join(SALT_FILE);
        let blob_path = self.base_dir.join(BLOB_FILE);

        if (salt_path.exists() || blob_path.exists()) && !force {
            return Err(SecretStoreError::Io(format!(
                "secret store already initialized at {}",
                self.base_dir.display()
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        write_private(&salt_path, &salt)?;

        self.write_map(&SecretMap::new(), password, &salt)
    }

    pub fn get(&self, path: &str, key: &str, password: &str) -> Result<Option<String>, SecretStoreError> {
        validate_path(path)?;
        validate_key(key)?;
        let map = self.read_map(password)?;
        Ok(map.get(path).and_then(|keys| keys.get(key)).cloned())
    }

    pub fn set(&self, path: &str, key: &str, value: &str, password: &str) -> Result<(), SecretStoreError> {
        validate_path(path)?;
        validate_key(key)?;
        let mut map = self.read_map(password)?;
        map.entry(path.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        let salt = self.read_salt()?;
        self.write_map(&map, password, &salt)
    }

    /// Removes `key` from `path`; also removes `path` itself if it has no
    /// keys left, so `list_paths` doesn't accumulate empty entries. Returns
    /// whether anything was removed.
    pub fn delete(&self, path: &str, key: &str, password: &str) -> Result<bool, SecretStoreError> {
        validate_path(path)?;
        validate_key(key)?;
        let mut map = self.read_map(password)?;
        let removed = if let Some(keys) = map.get_mut(path) {
            let removed = keys.remove(key).is_some();
            if keys.is_empty() {
                map.remove(path);
            }
            removed
        } else {
            false
        };
        if removed {
            let salt = self.read_salt()?;
            self.write_map(&map, password, &salt)?;
        }
        Ok(removed)
    }

    pub fn list_keys(&self, path: &str, password: &str) -> Result<Vec<String>, SecretStoreError> {
        validate_path(path)?;
        let map = self.read_map(password)?;
        Ok(map.get(path).map(|keys| keys.keys().cloned().collect()).unwrap_or_default())
    }

    pub fn list_paths(&self, password: &str) -> Result<Vec<String>, SecretStoreError> {
        let map = self.read_map(password)?;
        Ok(map.keys().cloned().collect())
    }

    fn read_salt(&self) -> Result<[u8; SALT_SIZE], SecretStoreError> {
        let bytes = std::fs::read(self.base_dir.join(SALT_FILE)).map_err(io_err)?;
        bytes
            .try_into()
            .map_err(|_| SecretStoreError::MalformedBlob("salt file has wrong length".into()))
    }

    fn read_map(&self, password: &str) -> Result<SecretMap, SecretStoreError> {
        let blob_path = self.base_dir.join(BLOB_FILE);
        if !blob_path.exists() {
            return Err(SecretStoreError::Io(format!(
                "secret store not initialized at {}",
                self.base_dir.display()
            )));
        }
        let salt = self.read_salt()?;
        let encoded = std::fs::read_to_string(&blob_path).map_err(io_err)?;
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| SecretStoreError::MalformedBlob(e.to_string()))?;
        if raw.len() < NONCE_SIZE {
            return Err(SecretStoreError::MalformedBlob("blob too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let key = derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretStoreError::MalformedBlob(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretStoreError::InvalidPassword)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| SecretStoreError::MalformedBlob(e.to_string()))
    }

    fn write_map(&self, map: &SecretMap, password: &str, salt: &[u8; SALT_SIZE]) -> Result<(), SecretStoreError> {
        let plaintext = serde_json::to_vec(map)
            .map_err(|e| SecretStoreError::MalformedBlob(e.to_string()))?;
        let key = derive_key(password, salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretStoreError::MalformedBlob(e.to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| SecretStoreError::MalformedBlob(e.to_string()))?;

        let mut raw = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&nonce_bytes);
        raw.extend_from_slice(&ciphertext);
        write_private(&self.base_dir.join(BLOB_FILE), BASE64.encode(&raw).as_bytes())
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_SIZE)
        .expect("fixed scrypt parameters are always valid");
    let mut out = [0u8; KEY_SIZE];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut out)
        .expect("fixed-size output buffer always matches params");
    out
}

fn validate_path(path: &str) -> Result<(), SecretStoreError> {
    if PATH_RE.is_match(path) {
        Ok(())
    } else {
        Err(SecretStoreError::InvalidPathOrKey(path.to_string()))
    }
}

fn validate_key(key: &str) -> Result<(), SecretStoreError> {
    if KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(SecretStoreError::InvalidPathOrKey(key.to_string()))
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), SecretStoreError> {
    std::fs::write(path, contents).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> SecretStoreError {
    SecretStoreError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("correct horse", false).unwrap();
        store.set("ci/prod", "api_key", "sk-123", "correct horse").unwrap();

        let value = store.get("ci/prod", "api_key", "correct horse").unwrap();
        assert_eq!(value, Some("sk-123".to_string()));
    }

    #[test]
    fn get_missing_key_is_none() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        assert_eq!(store.get("ci/prod", "missing", "pw").unwrap(), None);
    }

    #[test]
    fn wrong_password_fails_closed() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("right", false).unwrap();
        store.set("p", "k", "v", "right").unwrap();

        let err = store.get("p", "k", "wrong").unwrap_err();
        assert!(matches!(err, SecretStoreError::InvalidPassword));
    }

    #[test]
    fn init_without_force_refuses_to_clobber() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        assert!(store.init("pw", false).is_err());
        assert!(store.init("pw", true).is_ok());
    }

    #[test]
    fn invalid_path_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        let err = store.set("bad path!", "k", "v", "pw").unwrap_err();
        assert!(matches!(err, SecretStoreError::InvalidPathOrKey(_)));
    }

    #[test]
    fn invalid_key_rejects_slash() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        let err = store.set("p", "has/slash", "v", "pw").unwrap_err();
        assert!(matches!(err, SecretStoreError::InvalidPathOrKey(_)));
    }

    #[test]
    fn delete_removes_key_and_empty_parent_path() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        store.set("p", "only", "v", "pw").unwrap();

        assert!(store.delete("p", "only", "pw").unwrap());
        assert!(store.list_paths("pw").unwrap().is_empty());
    }

    #[test]
    fn delete_missing_returns_false() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        assert!(!store.delete("p", "missing", "pw").unwrap());
    }

    #[test]
    fn list_keys_and_paths_reflect_contents() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        store.set("a", "k1", "v1", "pw").unwrap();
        store.set("a", "k2", "v2", "pw").unwrap();
        store.set("b", "k3", "v3", "pw").unwrap();

        let mut paths = store.list_paths("pw").unwrap();
        paths.sort();
        assert_eq!(paths, vec!["a".to_string(), "b".to_string()]);

        let mut keys = store.list_keys("a", "pw").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn blob_and_salt_files_are_private() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let salt_mode = std::fs::metadata(td.path().join(SALT_FILE)).unwrap().permissions().mode() & 0o777;
            let blob_mode = std::fs::metadata(td.path().join(BLOB_FILE)).unwrap().permissions().mode() & 0o777;
            assert_eq!(salt_mode, 0o600);
            assert_eq!(blob_mode, 0o600);
        }
    }

    #[test]
    fn encrypting_same_plaintext_twice_differs_by_nonce() {
        let td = tempfile::tempdir().unwrap();
        let store = SecretStore::new(td.path());
        store.init("pw", false).unwrap();
        store.set("p", "k", "v", "pw").unwrap();
        let blob1 = std::fs::read(td.path().join(BLOB_FILE)).unwrap();
        store.set("p", "k", "v", "pw").unwrap();
        let blob2 = std::fs::read(td.path().join(BLOB_FILE)).unwrap();
        assert_ne!(blob1, blob2);
    }
}
