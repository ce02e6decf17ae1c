/// Hybrid envelope and its two encodings.
///
/// Binary format (storage):
/// ```text
/// magic "QSHE"(4) | version(1) | kem_id(1) | aead_id(1)
/// | key_id_len(2 LE) | key_id | nonce_len(1) | nonce | tag(16)
/// | encapsulated_key_len(4 LE) | encapsulated_key | ciphertext
/// ```
///
/// JSON (interchange): same fields, byte strings base64 encoded.
///
/// The envelope never carries private key material. `key_id` is only a
/// reference the recipient uses to find their own private key.
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::aead::{AeadAlgorithm, EncryptedPayload, TAG_LEN};
use crate::crypto::kem::KemAlgorithm;
use crate::error::{EngineError, Result};

pub const ENVELOPE_MAGIC: &[u8; 4] = b"QSHE";
pub const ENVELOPE_VERSION: u8 = 0x01;
pub const MAX_KEY_ID_LEN: usize = u16::MAX as usize;

const FIXED_HEADER_LEN: usize = 4 + 1 + 1 + 1 + 2;

/// Domain separator for the associated data bound into every envelope.
const ENVELOPE_AAD_PREFIX: &[u8] = b"qsafe-hybrid-envelope";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridEnvelope {
    pub version: u8,
    pub kem: KemAlgorithm,
    pub aead: AeadAlgorithm,
    /// Reference to the recipient's key pair (never the key itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64_tag")]
    pub tag: [u8; TAG_LEN],
    #[serde(with = "b64")]
    pub encapsulated_key: Vec<u8>,
}

impl HybridEnvelope {
    /// Split out the symmetric part for the AEAD layer.
    pub fn payload(&self) -> EncryptedPayload {
        EncryptedPayload {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            tag: self.tag,
        }
    }

    /// Associated data authenticated alongside the ciphertext: version,
    /// algorithm identifiers and the recipient key reference.
    pub fn associated_data(
        version: u8,
        kem: KemAlgorithm,
        aead: AeadAlgorithm,
        key_id: Option<&str>,
    ) -> Vec<u8> {
        let key_id = key_id.unwrap_or("").as_bytes();
        let mut aad = Vec::with_capacity(ENVELOPE_AAD_PREFIX.len() + 5 + key_id.len());
        aad.extend_from_slice(ENVELOPE_AAD_PREFIX);
        aad.push(version);
        aad.push(kem.id());
        aad.push(aead.id());
        aad.extend_from_slice(&(key_id.len() as u16).to_le_bytes());
        aad.extend_from_slice(key_id);
        aad
    }

    pub(crate) fn aad(&self) -> Vec<u8> {
        Self::associated_data(self.version, self.kem, self.aead, self.key_id.as_deref())
    }

    /// Serialize to the length-prefixed binary format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let key_id = self.key_id.as_deref().unwrap_or("").as_bytes();
        if key_id.len() > MAX_KEY_ID_LEN {
            return Err(EngineError::Serialization(format!(
                "key_id too long: {} bytes",
                key_id.len()
            )));
        }
        let nonce_len = u8::try_from(self.nonce.len())
            .map_err(|_| EngineError::Serialization("nonce too long".into()))?;
        let ek_len = u32::try_from(self.encapsulated_key.len())
            .map_err(|_| EngineError::Serialization("encapsulated key too long".into()))?;

        let mut out = Vec::with_capacity(
            FIXED_HEADER_LEN
                + key_id.len()
                + 1
                + self.nonce.len()
                + TAG_LEN
                + 4
                + self.encapsulated_key.len()
                + self.ciphertext.len(),
        );
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(self.version);
        out.push(self.kem.id());
        out.push(self.aead.id());
        out.extend_from_slice(&(key_id.len() as u16).to_le_bytes());
        out.extend_from_slice(key_id);
        out.push(nonce_len);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&ek_len.to_le_bytes());
        out.extend_from_slice(&self.encapsulated_key);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    /// Parse the binary format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);

        if reader.take(4)? != ENVELOPE_MAGIC {
            return Err(EngineError::Serialization("Not a qsafe envelope".into()));
        }
        let version = reader.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(EngineError::Serialization(format!(
                "Unsupported envelope version: {version}"
            )));
        }
        let kem = KemAlgorithm::from_id(reader.u8()?)?;
        let aead = AeadAlgorithm::from_id(reader.u8()?)?;

        let key_id_len = u16::from_le_bytes(reader.array::<2>()?) as usize;
        let key_id = match key_id_len {
            0 => None,
            n => Some(
                String::from_utf8(reader.take(n)?.to_vec())
                    .map_err(|_| EngineError::Serialization("key_id is not UTF-8".into()))?,
            ),
        };

        let nonce_len = reader.u8()? as usize;
        let nonce = reader.take(nonce_len)?.to_vec();
        let tag = reader.array::<TAG_LEN>()?;

        let ek_len = u32::from_le_bytes(reader.array::<4>()?) as usize;
        let encapsulated_key = reader.take(ek_len)?.to_vec();
        let ciphertext = reader.rest().to_vec();

        Ok(Self {
            version,
            kem,
            aead,
            key_id,
            ciphertext,
            nonce,
            tag,
            encapsulated_key,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Serialization(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(EngineError::Serialization(format!(
                "Unsupported envelope version: {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                EngineError::Serialization(format!(
                    "Envelope truncated at offset {} (need {n} more bytes)",
                    self.offset
                ))
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }
}

mod b64 {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_tag {
    use super::{BASE64, TAG_LEN};
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tag: &[u8; TAG_LEN], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(tag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; TAG_LEN], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("tag must be {TAG_LEN} bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn sample(key_id: Option<&str>) -> HybridEnvelope {
        HybridEnvelope {
            version: ENVELOPE_VERSION,
            kem: KemAlgorithm::MlKem768,
            aead: AeadAlgorithm::Aes256Gcm,
            key_id: key_id.map(str::to_string),
            ciphertext: vec![0xEE; 1000],
            nonce: vec![0xCC; 12],
            tag: [0xDD; TAG_LEN],
            encapsulated_key: vec![0xAA; 1136],
        }
    }

    #[test]
    fn test_binary_roundtrip() {
        for key_id in [None, Some("alice-2024")] {
            let envelope = sample(key_id);
            let parsed = HybridEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
            assert_eq!(parsed, envelope);
        }
    }

    #[test]
    fn test_empty_ciphertext_roundtrip() {
        let mut envelope = sample(Some("k"));
        envelope.ciphertext.clear();
        let parsed = HybridEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert!(parsed.ciphertext.is_empty());
    }

    #[test]
    fn test_json_uses_base64_fields() {
        let envelope = sample(Some("alice"));
        let json = envelope.to_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["kem"], "ml-kem-768");
        assert_eq!(value["aead"], "aes-256-gcm");
        assert_eq!(value["key_id"], "alice");
        assert_eq!(value["tag"], BASE64.encode([0xDD; TAG_LEN]));
        assert!(value.get("private_key").is_none());

        assert_eq!(HybridEnvelope::from_json(&json).unwrap(), envelope);
    }

    #[test]
    fn test_json_bad_tag_length() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample(None).to_json().unwrap()).unwrap();
        value["tag"] = serde_json::Value::String(BASE64.encode([0u8; 4]));
        assert!(HybridEnvelope::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = sample(Some("alice")).to_bytes().unwrap();
        for len in [0, 3, 8, FIXED_HEADER_LEN + 2, FIXED_HEADER_LEN + 5 + 12 + 8] {
            assert!(
                matches!(HybridEnvelope::from_bytes(&bytes[..len]), Err(EngineError::Serialization(_))),
                "len {len}"
            );
        }
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = sample(None).to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(HybridEnvelope::from_bytes(&bytes).is_err());

        let mut bytes = sample(None).to_bytes().unwrap();
        bytes[4] = 0xFF;
        assert!(HybridEnvelope::from_bytes(&bytes).is_err());

        let mut bytes = sample(None).to_bytes().unwrap();
        bytes[5] = 0x7F; // unknown KEM id
        assert!(HybridEnvelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_associated_data_binds_key_id() {
        let a = HybridEnvelope::associated_data(
            ENVELOPE_VERSION,
            KemAlgorithm::MlKem768,
            AeadAlgorithm::Aes256Gcm,
            Some("alice"),
        );
        let b = HybridEnvelope::associated_data(
            ENVELOPE_VERSION,
            KemAlgorithm::MlKem768,
            AeadAlgorithm::Aes256Gcm,
            Some("bob"),
        );
        assert_ne!(a, b);
        assert_eq!(sample(Some("alice")).aad(), a);
    }
}
