//! Filesystem barrier sealing every value with ChaCha20-Poly1305.
//!
//! Each key maps to one file under the root directory. The file holds
//! `nonce || ciphertext || tag`, and the storage key is bound as associated
//! data so a sealed value only opens under the key it was written to.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};

use super::Barrier;

/// Length of the barrier key in bytes.
pub const BARRIER_KEY_LEN: usize = 32;

/// Encrypted, file-per-key barrier.
pub struct FileBarrier {
    root: PathBuf,
    key: LessSafeKey,
    rng: SystemRandom,
}

impl FileBarrier {
    /// Open a barrier rooted at `root`, creating the directory if needed.
    pub fn open(root: &Path, key: &[u8; BARRIER_KEY_LEN]) -> BrokerResult<Self> {
        fs::create_dir_all(root).map_err(|e| {
            BrokerError::storage(format!(
                "failed to create barrier directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let unbound = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| BrokerError::storage("invalid barrier key"))?;

        debug!(path = %root.display(), "File barrier opened");

        Ok(Self {
            root: root.to_path_buf(),
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Load the barrier key, creating a fresh random key if the file is absent.
    ///
    /// An existing key file must be exactly 32 bytes and must not be
    /// readable by group or others.
    pub fn load_or_create_key(path: &Path) -> BrokerResult<[u8; BARRIER_KEY_LEN]> {
        match fs::metadata(path) {
            Ok(metadata) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = metadata.permissions().mode();
                    if mode & 0o077 != 0 {
                        return Err(BrokerError::Settings {
                            message: format!(
                                "barrier key file {} has insecure permissions {:04o}, expected 0600 or 0400",
                                path.display(),
                                mode & 0o777
                            ),
                        });
                    }
                }
                #[cfg(not(unix))]
                let _ = metadata;

                let bytes = fs::read(path)?;
                bytes.as_slice().try_into().map_err(|_| BrokerError::Settings {
                    message: format!(
                        "barrier key file {} must hold exactly {} bytes, found {}",
                        path.display(),
                        BARRIER_KEY_LEN,
                        bytes.len()
                    ),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; BARRIER_KEY_LEN];
                SystemRandom::new()
                    .fill(&mut key)
                    .map_err(|_| BrokerError::storage("failed to generate barrier key"))?;

                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                write_private(path, &key)?;
                debug!(path = %path.display(), "Generated new barrier key");
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn file_for(&self, key: &str) -> BrokerResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(BrokerError::storage(format!("invalid storage key '{}'", key)));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn seal(&self, key: &str, value: &[u8]) -> BrokerResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| BrokerError::storage("failed to generate nonce"))?;

        let mut in_out = value.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(key.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| BrokerError::storage(format!("failed to seal '{}'", key)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    fn open_sealed(&self, key: &str, mut sealed: Vec<u8>) -> BrokerResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(BrokerError::storage(format!("value at '{}' is truncated", key)));
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&sealed[..NONCE_LEN]);

        let plaintext_len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(key.as_bytes()),
                &mut sealed[NONCE_LEN..],
            )
            .map_err(|_| BrokerError::storage(format!("failed to open value at '{}'", key)))?
            .len();

        Ok(sealed[NONCE_LEN..NONCE_LEN + plaintext_len].to_vec())
    }
}

impl Barrier for FileBarrier {
    fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let path = self.file_for(key)?;
        match fs::read(&path) {
            Ok(sealed) => self.open_sealed(key, sealed).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BrokerError::storage(format!("failed to read '{}': {}", key, e))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> BrokerResult<()> {
        let path = self.file_for(key)?;
        let sealed = self.seal(key, value)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BrokerError::storage(format!("failed to write '{}': {}", key, e)))?;
        }

        // Replace atomically so readers never see a half-written value.
        let tmp = path.with_extension("tmp");
        write_private(&tmp, &sealed)
            .and_then(|_| fs::rename(&tmp, &path).map_err(BrokerError::from))
            .map_err(|e| BrokerError::storage(format!("failed to write '{}': {}", key, e)))
    }

    fn delete(&self, key: &str) -> BrokerResult<()> {
        let path = self.file_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerError::storage(format!("failed to delete '{}': {}", key, e))),
        }
    }

    fn list(&self, prefix: &str) -> BrokerResult<Vec<String>> {
        let dir_key = prefix.trim_end_matches('/');
        let dir = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.file_for(dir_key)?
        };

        let read_dir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BrokerError::storage(format!(
                    "failed to list '{}': {}",
                    prefix, e
                )))
            }
        };

        let mut keys = Vec::new();
        for entry in read_dir {
            let entry =
                entry.map_err(|e| BrokerError::storage(format!("failed to list '{}': {}", prefix, e)))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_file && !name.ends_with(".tmp") {
                keys.push(format!("{}{}", prefix, name));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn write_private(path: &Path, data: &[u8]) -> BrokerResult<()> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_barrier(dir: &TempDir) -> FileBarrier {
        FileBarrier::open(&dir.path().join("data"), &[7u8; BARRIER_KEY_LEN]).unwrap()
    }

    #[test]
    fn test_values_are_sealed_on_disk() {
        let dir = TempDir::new().unwrap();
        let barrier = test_barrier(&dir);

        barrier.put("core/audit/abc", b"plaintext-record").unwrap();

        let raw = fs::read(dir.path().join("data/core/audit/abc")).unwrap();
        assert!(!raw.windows(9).any(|w| w == b"plaintext"));
        assert_eq!(
            barrier.get("core/audit/abc").unwrap().as_deref(),
            Some(&b"plaintext-record"[..])
        );
    }

    #[test]
    fn test_value_bound_to_its_key() {
        let dir = TempDir::new().unwrap();
        let barrier = test_barrier(&dir);
        barrier.put("a/one", b"secret").unwrap();

        // Move the sealed blob under another key: it must not open.
        fs::copy(dir.path().join("data/a/one"), dir.path().join("data/a/two")).unwrap();
        assert!(matches!(barrier.get("a/two"), Err(BrokerError::Storage { .. })));
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let dir = TempDir::new().unwrap();
        test_barrier(&dir).put("a/one", b"secret").unwrap();

        let other = FileBarrier::open(&dir.path().join("data"), &[9u8; BARRIER_KEY_LEN]).unwrap();
        assert!(other.get("a/one").is_err());
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let barrier = test_barrier(&dir);
        barrier.put("core/audit/b", b"2").unwrap();
        barrier.put("core/audit/a", b"1").unwrap();
        barrier.put("audit/x/salt", b"s").unwrap();

        assert_eq!(
            barrier.list("core/audit/").unwrap(),
            vec!["core/audit/a", "core/audit/b"]
        );
        assert!(barrier.list("missing/").unwrap().is_empty());

        barrier.delete("core/audit/a").unwrap();
        barrier.delete("core/audit/a").unwrap();
        assert_eq!(barrier.list("core/audit/").unwrap(), vec!["core/audit/b"]);
    }

    #[test]
    fn test_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let barrier = test_barrier(&dir);
        assert!(barrier.put("../escape", b"x").is_err());
        assert!(barrier.get("a//b").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("keys/barrier.key");

        let key = FileBarrier::load_or_create_key(&key_path).unwrap();
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(FileBarrier::load_or_create_key(&key_path).unwrap(), key);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_with_open_permissions_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("barrier.key");
        fs::write(&key_path, [1u8; BARRIER_KEY_LEN]).unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            FileBarrier::load_or_create_key(&key_path),
            Err(BrokerError::Settings { .. })
        ));
    }
}
