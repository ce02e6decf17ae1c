//! Property-based tests. Ciphertexts are randomized, so these check
//! behaviour rather than bytes.

use proptest::prelude::*;
use qsafe::crypto::hash::{hash_reader, IntegrityHasher, CHUNK_SIZE};
use qsafe::crypto::kdf::KdfParams;
use qsafe::{
    AeadAlgorithm, HashAlgorithm, HybridEngine, HybridEnvelope, KemAlgorithm, KeyDerivation,
    SymmetricCipher, SymmetricKey,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// decrypt(encrypt(x)) == x for every KEM and AEAD pairing.
    #[test]
    fn prop_hybrid_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        hybrid_kem in any::<bool>(),
        xchacha in any::<bool>(),
    ) {
        let kem = if hybrid_kem { KemAlgorithm::MlKem768X25519 } else { KemAlgorithm::MlKem768 };
        let aead = if xchacha { AeadAlgorithm::XChaCha20Poly1305 } else { AeadAlgorithm::Aes256Gcm };
        let engine = HybridEngine::new(kem.provider(), SymmetricCipher::new(aead));
        let kp = engine.kem().generate_keypair().unwrap();

        let envelope = engine.hybrid_encrypt(&data, &kp.public_key, Some("recipient")).unwrap();
        prop_assert_eq!(engine.hybrid_decrypt(&envelope, kp.private_key()).unwrap(), data.clone());

        // Both encodings carry everything needed to decrypt.
        let binary = HybridEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(engine.hybrid_decrypt(&binary, kp.private_key()).unwrap(), data.clone());
        let json = HybridEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        prop_assert_eq!(engine.hybrid_decrypt(&json, kp.private_key()).unwrap(), data);
    }

    #[test]
    fn prop_symmetric_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        aad in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let key = SymmetricKey::generate();
        for aead in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::XChaCha20Poly1305] {
            let cipher = SymmetricCipher::new(aead);
            let payload = cipher.encrypt_with_aad(&data, &aad, &key).unwrap();
            prop_assert_eq!(payload.nonce.len(), aead.nonce_len());
            prop_assert_eq!(cipher.decrypt_with_aad(&payload, &aad, &key).unwrap(), data.clone());
        }
    }

    /// Streaming in arbitrary splits equals one-shot hashing.
    #[test]
    fn prop_streaming_hash_matches_one_shot(
        data in prop::collection::vec(any::<u8>(), 0..(3 * CHUNK_SIZE)),
        split in any::<prop::sample::Index>(),
    ) {
        for algorithm in [HashAlgorithm::Sha3_512, HashAlgorithm::Sha512] {
            let cut = split.index(data.len() + 1);
            let mut hasher = IntegrityHasher::new(algorithm);
            hasher.update(&data[..cut]);
            hasher.update(&data[cut..]);

            let expected = algorithm.digest_hex(&data);
            prop_assert_eq!(hasher.finalize_hex(), expected.clone());
            prop_assert_eq!(hash_reader(algorithm, data.as_slice()).unwrap(), expected);
        }
    }

    #[test]
    fn prop_kdf_deterministic(
        passphrase in "[a-zA-Z0-9 ]{1,32}",
        salt in prop::array::uniform16(any::<u8>()),
    ) {
        let kdf = KeyDerivation::new(KdfParams::pbkdf2(1_000).unwrap()).unwrap();
        let a = kdf.derive(&passphrase, Some(&salt)).unwrap();
        let b = kdf.derive(&passphrase, Some(&salt)).unwrap();
        prop_assert_eq!(&a.key, &b.key);

        let mut other_salt = salt;
        other_salt[0] ^= 0x01;
        let c = kdf.derive(&passphrase, Some(&other_salt)).unwrap();
        prop_assert_ne!(&a.key, &c.key);
    }
}
