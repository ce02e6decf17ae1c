//! Cryptographic primitives.
//!
//! - `hash`: SHA3-512 / SHA-512 integrity digests
//! - `aead`: AES-256-GCM / XChaCha20-Poly1305 with detached tags
//! - `kdf`: PBKDF2-HMAC-SHA256 / Argon2id passphrase derivation
//! - `kem`: ML-KEM-768 key encapsulation, optionally combined with X25519
//! - `sensitive`: zeroize-on-drop key containers

pub mod aead;
pub mod hash;
pub mod kdf;
pub mod kem;
pub mod sensitive;
