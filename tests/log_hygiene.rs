//! Captures every tracing event emitted during a full key lifecycle and
//! checks that no secret ends up in the output.

use std::io;
use std::sync::{Arc, Mutex};

use qsafe::crypto::kdf::KdfParams;
use qsafe::crypto::kem::PublicKey;
use qsafe::{
    AeadAlgorithm, HashAlgorithm, HybridEngine, KemAlgorithm, KeyDerivation, KeyStore,
    SymmetricCipher,
};
use tracing::Level;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn capturing_subscriber(capture: &Capture) -> impl tracing::Subscriber + Send + Sync {
    let writer = capture.clone();
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish()
}

fn warn_lines<'a>(logs: &'a str, op: &str) -> Vec<&'a str> {
    let quoted = format!("op=\"{op}\"");
    let bare = format!("op={op} ");
    logs.lines()
        .filter(|l| l.contains("WARN") && (l.contains(&quoted) || l.contains(&bare)))
        .collect()
}

#[test]
fn no_secrets_in_logs() {
    const PASSPHRASE: &str = "hunter2-but-longer";

    let capture = Capture::default();
    let subscriber = capturing_subscriber(&capture);

    let dir = tempfile::tempdir().unwrap();
    let mut secrets: Vec<String> = Vec::new();

    tracing::subscriber::with_default(subscriber, || {
        let engine = HybridEngine::new(
            KemAlgorithm::MlKem768X25519.provider(),
            SymmetricCipher::new(AeadAlgorithm::Aes256Gcm),
        );
        let store = KeyStore::new(dir.path(), HashAlgorithm::Sha3_512);
        let kdf_params = KdfParams::pbkdf2(1_000).unwrap();

        let kp = engine.kem().generate_keypair().unwrap();
        secrets.push(hex::encode(&kp.private_key().as_bytes()[..32]));

        store
            .store_sealed("alice", kp.private_key().as_bytes(), PASSPHRASE, kdf_params, AeadAlgorithm::Aes256Gcm)
            .unwrap();
        assert!(store.verify_integrity("alice"));
        assert!(store.load_sealed("alice", "not the passphrase").is_err());

        let envelope = engine
            .hybrid_encrypt(b"top secret plaintext", &kp.public_key, Some("alice"))
            .unwrap();
        let other = engine.kem().generate_keypair().unwrap();
        assert!(engine.hybrid_decrypt(&envelope, other.private_key()).is_err());
        engine.hybrid_decrypt(&envelope, kp.private_key()).unwrap();

        let (shared, encapsulated) = engine.establish_key(&kp.public_key).unwrap();
        secrets.push(hex::encode(shared.as_bytes()));
        engine.accept_key(&encapsulated, kp.private_key()).unwrap();

        let derived = KeyDerivation::new(kdf_params)
            .unwrap()
            .derive(PASSPHRASE, None)
            .unwrap();
        secrets.push(hex::encode(derived.key.as_bytes()));
        assert!(format!("{derived:?}").contains("REDACTED"));

        store.delete("alice").unwrap();
        store.delete("alice").unwrap();
    });

    let logs = capture.contents();
    assert!(logs.contains("op=\"store\"") || logs.contains("op=store"), "{logs}");
    assert!(logs.contains("hybrid_decrypt"), "{logs}");
    assert!(logs.contains("key_id"), "{logs}");

    assert!(!logs.contains(PASSPHRASE));
    assert!(!logs.contains("not the passphrase"));
    assert!(!logs.contains("top secret plaintext"));
    for secret in &secrets {
        assert!(!logs.contains(secret.as_str()));
    }
}

#[test]
fn failures_are_logged_with_their_kind() {
    const PASSPHRASE: &str = "correct horse battery";

    let capture = Capture::default();
    let subscriber = capturing_subscriber(&capture);
    let dir = tempfile::tempdir().unwrap();

    tracing::subscriber::with_default(subscriber, || {
        let engine = HybridEngine::new(
            KemAlgorithm::MlKem768.provider(),
            SymmetricCipher::new(AeadAlgorithm::Aes256Gcm),
        );
        let other = HybridEngine::new(
            KemAlgorithm::MlKem768.provider(),
            SymmetricCipher::new(AeadAlgorithm::XChaCha20Poly1305),
        );
        let store = KeyStore::new(dir.path(), HashAlgorithm::Sha3_512);
        let kdf_params = KdfParams::pbkdf2(1_000).unwrap();

        let short_key = PublicKey::from_bytes(&[7u8; 10]);
        assert!(engine.hybrid_encrypt(b"payload", &short_key, Some("bob")).is_err());

        let kp = engine.kem().generate_keypair().unwrap();
        let envelope = engine
            .hybrid_encrypt(b"payload", &kp.public_key, Some("carol"))
            .unwrap();
        assert!(other.hybrid_decrypt(&envelope, kp.private_key()).is_err());

        assert!(KeyDerivation::new(kdf_params).unwrap().derive("", None).is_err());

        store
            .store_sealed("dave", b"sealed secret", PASSPHRASE, kdf_params, AeadAlgorithm::Aes256Gcm)
            .unwrap();
        assert!(store.load_sealed("dave", "wrong passphrase").is_err());
        assert!(store.load_sealed("nobody", PASSPHRASE).is_err());
    });

    let logs = capture.contents();

    let encrypt = warn_lines(&logs, "hybrid_encrypt");
    assert_eq!(encrypt.len(), 1, "{logs}");
    assert!(encrypt[0].contains("error_kind=\"validation\""), "{logs}");
    assert!(encrypt[0].contains("bob"), "{logs}");

    let decrypt = warn_lines(&logs, "hybrid_decrypt");
    assert_eq!(decrypt.len(), 1, "{logs}");
    assert!(decrypt[0].contains("error_kind=\"validation\""), "{logs}");
    assert!(decrypt[0].contains("carol"), "{logs}");

    let derive = warn_lines(&logs, "derive");
    assert_eq!(derive.len(), 1, "{logs}");
    assert!(derive[0].contains("error_kind=\"validation\""), "{logs}");

    let open = warn_lines(&logs, "open_sealed");
    assert!(
        open.iter().any(|l| l.contains("error_kind=\"authentication\"")),
        "{logs}"
    );

    let load = warn_lines(&logs, "load_sealed");
    assert_eq!(load.len(), 2, "{logs}");
    assert!(
        load.iter()
            .any(|l| l.contains("dave") && l.contains("error_kind=\"authentication\"")),
        "{logs}"
    );
    assert!(
        load.iter()
            .any(|l| l.contains("nobody") && l.contains("error_kind=\"not_found\"")),
        "{logs}"
    );

    assert!(!logs.contains(PASSPHRASE));
    assert!(!logs.contains("wrong passphrase"));
    assert!(!logs.contains("sealed secret"));
}
