/// Hash/integrity service.
///
/// Integrity fingerprints are 512-bit digests rendered as lowercase hex:
/// - Key store verification (digest recorded at store time)
/// - Content addressing for callers
///
/// BLAKE3 derive-key mode is used separately for domain-separated subkeys
/// (KEM shared secret to wrapping key), never for fingerprints.
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Sha512;
use sha3::{Digest, Sha3_512};

use crate::error::{EngineError, Result};

/// Read size for streaming inputs.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Length of a 512-bit digest in hex characters.
pub const DIGEST_HEX_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha3-512")]
    Sha3_512,
    #[serde(rename = "sha-512")]
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha3_512 => "sha3-512",
            Self::Sha512 => "sha-512",
        }
    }

    /// One-shot digest of `data` as lowercase hex.
    pub fn digest_hex(&self, data: &[u8]) -> String {
        let mut hasher = IntegrityHasher::new(*self);
        hasher.update(data);
        hasher.finalize_hex()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha3-512" => Ok(Self::Sha3_512),
            "sha-512" => Ok(Self::Sha512),
            other => Err(EngineError::Validation(format!(
                "Unknown hash algorithm: {other}"
            ))),
        }
    }
}

/// Incremental hasher. Feeding the same bytes in any split produces the
/// same digest as [`HashAlgorithm::digest_hex`].
pub struct IntegrityHasher {
    inner: Inner,
}

enum Inner {
    Sha3(Sha3_512),
    Sha2(Sha512),
}

impl IntegrityHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner = match algorithm {
            HashAlgorithm::Sha3_512 => Inner::Sha3(Sha3_512::new()),
            HashAlgorithm::Sha512 => Inner::Sha2(Sha512::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha3(h) => h.update(data),
            Inner::Sha2(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self.inner {
            Inner::Sha3(h) => hex::encode(h.finalize()),
            Inner::Sha2(h) => hex::encode(h.finalize()),
        }
    }
}

/// SHA3-512 digest of `data`, hex encoded.
pub fn hash(data: &[u8]) -> String {
    HashAlgorithm::Sha3_512.digest_hex(data)
}

/// Digest everything `reader` yields, [`CHUNK_SIZE`] bytes at a time.
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> io::Result<String> {
    let mut hasher = IntegrityHasher::new(algorithm);
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Digest of a file's contents, streamed.
pub fn hash_file(algorithm: HashAlgorithm, path: impl AsRef<Path>) -> Result<String> {
    let file = File::open(path.as_ref())?;
    Ok(hash_reader(algorithm, file)?)
}

/// Derive a 32-byte subkey with BLAKE3's key derivation mode.
/// `context` must be a hardcoded string unique to the usage.
pub fn derive_subkey(context: &str, ikm: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, ikm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_hash_deterministic() {
        let data = b"hello qsafe";
        assert_eq!(hash(data), hash(data));
        assert_eq!(hash(data).len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(hash(b"hello"), hash(b"world"));
    }

    #[test]
    fn test_sha3_512_known_vector() {
        // SHA3-512("abc"), FIPS 202 example
        assert_eq!(
            hash(b"abc"),
            "b751850b1a57168a5693cd924b6b096e08f621827444f70d884f5d0240d2712e\
             10e116e9192af3c91a7ec57647e3934057340b4cf408d5a56592f8274eec53f0"
        );
    }

    #[test]
    fn test_algorithms_differ() {
        let data = b"same input";
        assert_ne!(
            HashAlgorithm::Sha3_512.digest_hex(data),
            HashAlgorithm::Sha512.digest_hex(data)
        );
        assert_eq!(HashAlgorithm::Sha512.digest_hex(data).len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 517)).map(|i| (i % 251) as u8).collect();

        for algorithm in [HashAlgorithm::Sha3_512, HashAlgorithm::Sha512] {
            let one_shot = algorithm.digest_hex(&data);

            let mut hasher = IntegrityHasher::new(algorithm);
            for chunk in data.chunks(CHUNK_SIZE) {
                hasher.update(chunk);
            }
            assert_eq!(hasher.finalize_hex(), one_shot);

            let streamed = hash_reader(algorithm, Cursor::new(&data)).unwrap();
            assert_eq!(streamed, one_shot);
        }
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data = vec![0x5Au8; 20_000];
        std::fs::write(&path, &data).unwrap();

        let digest = hash_file(HashAlgorithm::Sha3_512, &path).unwrap();
        assert_eq!(digest, hash(&data));
    }

    #[test]
    fn test_hash_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = hash_file(HashAlgorithm::Sha3_512, dir.path().join("nope"));
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("sha3-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha3_512);
        assert_eq!("sha-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_derive_subkey() {
        let k1 = derive_subkey("qsafe test context", b"input");
        let k2 = derive_subkey("qsafe test context", b"input");
        assert_eq!(k1, k2);

        let k3 = derive_subkey("different context", b"input");
        assert_ne!(k1, k3);
    }
}
