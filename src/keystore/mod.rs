//! Filesystem key store.
//!
//! Layout under the root directory:
//! - `<key_id>.key`: the raw key bytes, owner read/write only on Unix
//! - `<key_id>.digest`: `<hash-algorithm>:<hex digest>` recorded at store time
//!
//! A key is published with `hard_link` from a fully written temp file, which
//! fails if the target exists. Concurrent stores of one id therefore have a
//! single winner, across processes too, and readers never see a partial key.
//! The digest record is written to its own temp file before the key is
//! linked and renamed into place right after, so a reader racing a `store`
//! can at most briefly see a key without its digest. `verify_integrity`
//! reports that state as a failure, never as a pass.
//!
//! Operations on one id are serialized in-process. A second `store` fails
//! fast, while `delete` waits for the running operation to finish.
//! There is no in-place update: rotate by `delete` then `store`.

pub mod key_id;
pub mod sealed;

pub use key_id::KeyId;
pub use sealed::SealedKey;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::crypto::aead::AeadAlgorithm;
use crate::crypto::hash::HashAlgorithm;
use crate::crypto::kdf::KdfParams;
use crate::crypto::sensitive::SecretBytes;
use crate::error::{EngineError, Result};

const KEY_EXT: &str = "key";
const DIGEST_EXT: &str = "digest";

pub struct KeyStore {
    root: PathBuf,
    hash: HashAlgorithm,
    in_flight: Mutex<HashSet<KeyId>>,
    released: Condvar,
}

impl KeyStore {
    /// The root directory is created lazily on first `store`.
    pub fn new(root: impl Into<PathBuf>, hash: HashAlgorithm) -> Self {
        Self {
            root: root.into(),
            hash,
            in_flight: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.key_store.root.clone(), config.hash.algorithm)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `key_bytes` under `key_id`. Fails with
    /// [`EngineError::Storage`] if the id is already taken.
    pub fn store(&self, key_id: &str, key_bytes: &[u8]) -> Result<()> {
        let id = KeyId::parse(key_id)?;
        let _claim = self.claim(&id)?;

        fs::create_dir_all(&self.root).map_err(|e| {
            storage_error("store", &id, format!("cannot create {}: {e}", self.root.display()))
        })?;

        let record = format!("{}:{}\n", self.hash, self.hash.digest_hex(key_bytes));
        let digest_tmp = self
            .write_temp(&id, record.as_bytes())
            .map_err(|e| storage_error("store", &id, format!("digest write failed: {e}")))?;
        let key_tmp = match self.write_temp(&id, key_bytes) {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&digest_tmp);
                return Err(storage_error("store", &id, format!("write failed: {e}")));
            }
        };

        let key_path = self.key_path(&id);
        let published = fs::hard_link(&key_tmp, &key_path);
        let _ = fs::remove_file(&key_tmp);
        if let Err(e) = published {
            let _ = fs::remove_file(&digest_tmp);
            return Err(if e.kind() == io::ErrorKind::AlreadyExists {
                storage_error("store", &id, "key_id already exists".into())
            } else {
                storage_error("store", &id, format!("publish failed: {e}"))
            });
        }

        if let Err(e) = fs::rename(&digest_tmp, self.digest_path(&id)) {
            let _ = fs::remove_file(&digest_tmp);
            let _ = fs::remove_file(&key_path);
            return Err(storage_error("store", &id, format!("digest publish failed: {e}")));
        }
        sync_dir(&self.root);

        info!(op = "store", key_id = %id, algorithm = %self.hash, "Key stored");
        Ok(())
    }

    pub fn load(&self, key_id: &str) -> Result<SecretBytes> {
        let id = KeyId::parse(key_id)?;
        let bytes = self.read_key(&id, "load")?;
        debug!(op = "load", key_id = %id, "Key loaded");
        Ok(bytes)
    }

    /// Remove a key and its digest. Returns `false` when nothing was there.
    /// Waits for any in-flight operation on the same id.
    pub fn delete(&self, key_id: &str) -> Result<bool> {
        let id = KeyId::parse(key_id)?;
        let _claim = self.wait_claim(&id);

        let removed = match fs::remove_file(self.key_path(&id)) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(storage_error("delete", &id, e.to_string())),
        };

        match fs::remove_file(self.digest_path(&id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error("delete", &id, e.to_string())),
        }

        if removed {
            info!(op = "delete", key_id = %id, "Key deleted");
        } else {
            info!(op = "delete", key_id = %id, "Key not present, nothing to delete");
        }
        Ok(removed)
    }

    pub fn exists(&self, key_id: &str) -> Result<bool> {
        let id = KeyId::parse(key_id)?;
        Ok(self.key_path(&id).is_file())
    }

    /// Ids of all stored keys, sorted. A missing root is an empty store.
    pub fn list(&self) -> Result<Vec<KeyId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::Storage(format!("list failed: {e}"))),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXT) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| KeyId::parse(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Hex digest recorded when the key was stored.
    pub fn stored_digest(&self, key_id: &str) -> Result<String> {
        let id = KeyId::parse(key_id)?;
        let (_, digest) = self.read_digest(&id)?;
        Ok(digest)
    }

    /// `true` only if the stored bytes still hash to the recorded digest.
    /// Any failure, including a missing key, is logged and reported as `false`.
    pub fn verify_integrity(&self, key_id: &str) -> bool {
        match self.check_integrity(key_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    op = "verify_integrity",
                    key_id = key_id,
                    error_kind = e.kind(),
                    error = %e,
                    "Integrity check failed"
                );
                false
            }
        }
    }

    /// Like [`Self::verify_integrity`] but reports why:
    /// [`EngineError::NotFound`] for an absent key,
    /// [`EngineError::IntegrityViolation`] for a mismatch or missing digest.
    pub fn check_integrity(&self, key_id: &str) -> Result<()> {
        let id = KeyId::parse(key_id)?;
        let bytes = self.read_key(&id, "verify_integrity")?;
        let (algorithm, expected) = self.read_digest(&id)?;

        let actual = algorithm.digest_hex(bytes.as_bytes());
        if actual != expected {
            return Err(EngineError::IntegrityViolation(format!(
                "{id}: stored {algorithm} digest does not match key contents"
            )));
        }

        debug!(op = "verify_integrity", key_id = %id, algorithm = %algorithm, "Key verified");
        Ok(())
    }

    /// Seal `secret` under `passphrase` and store the sealed form.
    pub fn store_sealed(
        &self,
        key_id: &str,
        secret: &[u8],
        passphrase: &str,
        params: KdfParams,
        aead: AeadAlgorithm,
    ) -> Result<()> {
        SealedKey::seal(secret, passphrase, params, aead)
            .and_then(|sealed| self.store(key_id, &sealed.to_bytes()))
            .map_err(|e| {
                warn!(op = "store_sealed", key_id, error_kind = e.kind(), "Sealed store failed");
                e
            })
    }

    pub fn load_sealed(&self, key_id: &str, passphrase: &str) -> Result<SecretBytes> {
        self.load(key_id)
            .and_then(|blob| SealedKey::from_bytes(blob.as_bytes()))
            .and_then(|sealed| sealed.open(passphrase))
            .map_err(|e| {
                warn!(op = "load_sealed", key_id, error_kind = e.kind(), "Sealed load failed");
                e
            })
    }

    fn key_path(&self, id: &KeyId) -> PathBuf {
        self.root.join(format!("{id}.{KEY_EXT}"))
    }

    fn digest_path(&self, id: &KeyId) -> PathBuf {
        self.root.join(format!("{id}.{DIGEST_EXT}"))
    }

    fn claim(&self, id: &KeyId) -> Result<Claim<'_>> {
        if !self.in_flight.lock().insert(id.clone()) {
            return Err(storage_error(
                "claim",
                id,
                "another operation on this key_id is in progress".into(),
            ));
        }
        Ok(Claim {
            store: self,
            id: id.clone(),
        })
    }

    fn wait_claim(&self, id: &KeyId) -> Claim<'_> {
        let mut set = self.in_flight.lock();
        while set.contains(id) {
            self.released.wait(&mut set);
        }
        set.insert(id.clone());
        Claim {
            store: self,
            id: id.clone(),
        }
    }

    fn read_key(&self, id: &KeyId, op: &'static str) -> Result<SecretBytes> {
        match fs::read(self.key_path(id)) {
            Ok(bytes) => Ok(SecretBytes::new(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(op, key_id = %id, "Key not found");
                Err(EngineError::NotFound(id.to_string()))
            }
            Err(e) => Err(storage_error(op, id, format!("read failed: {e}"))),
        }
    }

    fn read_digest(&self, id: &KeyId) -> Result<(HashAlgorithm, String)> {
        let record = match fs::read_to_string(self.digest_path(id)) {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::IntegrityViolation(format!(
                    "{id}: digest record missing"
                )))
            }
            Err(e) => return Err(storage_error("read_digest", id, e.to_string())),
        };

        let (algorithm, digest) = record.trim().split_once(':').ok_or_else(|| {
            EngineError::IntegrityViolation(format!("{id}: malformed digest record"))
        })?;
        let algorithm: HashAlgorithm = algorithm.parse().map_err(|_| {
            EngineError::IntegrityViolation(format!("{id}: unknown digest algorithm"))
        })?;
        Ok((algorithm, digest.to_string()))
    }

    fn write_temp(&self, id: &KeyId, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.temp_path(id);
        let mut file = private_options().open(&path)?;
        let written = file.write_all(data).and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(path)
    }

    /// Leading `.` keeps temp names out of the key id space.
    fn temp_path(&self, id: &KeyId) -> PathBuf {
        let suffix: u64 = rand::random();
        self.root.join(format!(".{id}.{suffix:016x}.tmp"))
    }
}

/// Releases the in-flight marker for one key_id on drop.
struct Claim<'a> {
    store: &'a KeyStore,
    id: KeyId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.store.in_flight.lock().remove(&self.id);
        self.store.released.notify_all();
    }
}

fn private_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn storage_error(op: &'static str, id: &KeyId, message: String) -> EngineError {
    warn!(op, key_id = %id, error_kind = "storage", "{message}");
    EngineError::Storage(format!("{id}: {message}"))
}
