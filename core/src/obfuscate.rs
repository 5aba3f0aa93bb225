//! Reversible encoding for credentials stored in the configuration file.
//!
//! The key is compiled into the binary, so anyone holding the binary can
//! decode the value. This only keeps tokens from being readable at a glance.

use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const EMBEDDED_KEY: [u8; 32] = *b"offsite.credential.obfuscation.k";
const NONCE_LEN: usize = 12;

struct Obfuscator {
    cipher: ChaCha20Poly1305,
}

impl Obfuscator {
    fn new() -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&EMBEDDED_KEY)),
        }
    }

    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Obfuscation(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        if encoded.len() < NONCE_LEN {
            return Err(Error::Obfuscation("Encoded value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = encoded.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Obfuscation(e.to_string()))
    }
}

/// Encodes `secret` into the stored (base64) form.
pub fn obfuscate(secret: &str) -> Result<String> {
    let encoded = Obfuscator::new().encode(secret.as_bytes())?;
    Ok(STANDARD.encode(encoded))
}

/// Decodes a value produced by [`obfuscate`].
pub fn reveal(stored: &str) -> Result<String> {
    let raw = STANDARD
        .decode(stored.trim())
        .map_err(|e| Error::Obfuscation(format!("Invalid base64: {}", e)))?;
    let plain = Obfuscator::new().decode(&raw)?;
    String::from_utf8(plain).map_err(|e| Error::Obfuscation(e.to_string()))
}

/// A secret held in its encoded form until the moment it is sent.
#[derive(Clone, PartialEq, Eq)]
pub struct ObfuscatedSecret(String);

impl ObfuscatedSecret {
    /// Wraps an already-encoded value, checking that it decodes.
    pub fn from_stored(stored: impl Into<String>) -> Result<Self> {
        let stored = stored.into();
        reveal(&stored)?;
        Ok(Self(stored))
    }

    pub fn from_plain(secret: &str) -> Result<Self> {
        Ok(Self(obfuscate(secret)?))
    }

    pub fn reveal(&self) -> Result<String> {
        reveal(&self.0)
    }

    pub fn stored(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObfuscatedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObfuscatedSecret(..)")
    }
}

impl Serialize for ObfuscatedSecret {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ObfuscatedSecret {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObfuscatedSecret::from_stored(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obfuscation_roundtrip() {
        let stored = obfuscate("sl.refresh-token-value").unwrap();
        assert_ne!(stored, "sl.refresh-token-value");
        assert_eq!(reveal(&stored).unwrap(), "sl.refresh-token-value");
    }

    #[test]
    fn test_tampered_value_is_rejected() {
        let stored = obfuscate("secret").unwrap();
        let mut raw = STANDARD.decode(&stored).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(reveal(&STANDARD.encode(raw)).is_err());
        assert!(reveal("not base64!").is_err());
    }

    #[test]
    fn test_secret_debug_does_not_leak() {
        let secret = ObfuscatedSecret::from_plain("hunter2").unwrap();
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.reveal().unwrap(), "hunter2");
    }
}
