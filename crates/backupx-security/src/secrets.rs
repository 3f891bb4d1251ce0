//! Secret codec for stored credentials.
//!
//! Project passwords and the object-storage secret key are kept in the
//! config file encrypted under one installation-wide key material string:
//! 64 hex chars of AES-256 key followed by 24 hex chars of nonce (88 total).
//!
//! Ciphertext layout: base64(message nonce (12 bytes) || AES-256-GCM output).
//! The key-material nonce is bound into every message as associated data, so
//! a ciphertext only opens under the exact key material that sealed it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use backupx_core::config::Config;
use backupx_core::error::{BackupError, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;

/// Length of the persisted key material string.
pub const KEY_MATERIAL_LEN: usize = 88;
const KEY_HEX_LEN: usize = 64;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Parsed installation-wide key + nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: [u8; 32],
    nonce: [u8; NONCE_LEN],
}

impl KeyMaterial {
    /// Fresh key material from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// Validate and decode an 88-character key material string.
    pub fn parse(encoded: &str) -> Result<Self> {
        if encoded.len() != KEY_MATERIAL_LEN || !encoded.is_ascii() {
            return Err(BackupError::InvalidKeyMaterial(format!(
                "expected {KEY_MATERIAL_LEN} characters, got {}",
                encoded.chars().count()
            )));
        }
        let (key_hex, nonce_hex) = encoded.split_at(KEY_HEX_LEN);

        let mut key = [0u8; 32];
        hex::decode_to_slice(key_hex, &mut key)
            .map_err(|e| BackupError::InvalidKeyMaterial(format!("key half: {e}")))?;
        let mut nonce = [0u8; NONCE_LEN];
        hex::decode_to_slice(nonce_hex, &mut nonce)
            .map_err(|e| BackupError::InvalidKeyMaterial(format!("nonce half: {e}")))?;

        Ok(Self { key, nonce })
    }

    /// Encode as the 88-character persisted form.
    pub fn encode(&self) -> String {
        let mut out = hex::encode(self.key);
        out.push_str(&hex::encode(self.nonce));
        out
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Encrypts and decrypts secrets under one key material. Holds no other
/// state and can be shared freely between tasks.
#[derive(Clone, Debug)]
pub struct SecretCodec {
    material: KeyMaterial,
}

impl SecretCodec {
    pub fn new(material: KeyMaterial) -> Self {
        Self { material }
    }

    /// Build from the persisted 88-character string.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        Ok(Self::new(KeyMaterial::parse(encoded)?))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &self.material.nonce,
                },
            )
            .map_err(|e| BackupError::Security(format!("AES-GCM seal failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let raw = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| BackupError::DecryptionFailed)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(BackupError::DecryptionFailed);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);

        let opened = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &self.material.nonce,
                },
            )
            .map_err(|_| BackupError::DecryptionFailed)?;
        String::from_utf8(opened).map_err(|_| BackupError::DecryptionFailed)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.material.key)
            .map_err(|e| BackupError::InvalidKeyMaterial(e.to_string()))
    }
}

/// Generate a fresh persisted key material string.
pub fn generate() -> String {
    KeyMaterial::generate().encode()
}

/// Encrypt `plaintext` under the persisted key material string.
pub fn encrypt(key_material: &str, plaintext: &str) -> Result<String> {
    SecretCodec::from_encoded(key_material)?.encrypt(plaintext)
}

/// Decrypt `ciphertext` under the persisted key material string.
pub fn decrypt(key_material: &str, ciphertext: &str) -> Result<String> {
    SecretCodec::from_encoded(key_material)?.decrypt(ciphertext)
}

/// Decrypt an optional secret field: empty stays empty.
pub fn reveal(codec: &SecretCodec, stored: &str) -> Result<String> {
    if stored.is_empty() {
        Ok(String::new())
    } else {
        codec.decrypt(stored)
    }
}

/// Prepare a config for saving: create key material on first save and
/// encrypt every secret field still holding plaintext. Fields that already
/// open under the key material are left untouched.
///
/// Returns how many fields were newly encrypted.
pub fn seal_config(config: &mut Config) -> Result<usize> {
    if config.encrypt_key.is_empty() {
        config.encrypt_key = generate();
        tracing::info!("🔑 Generated new key material");
    }
    let codec = SecretCodec::from_encoded(&config.encrypt_key)?;

    let mut sealed = 0;
    for project in config.projects.iter_mut() {
        if seal_field(&codec, &mut project.password)? {
            tracing::debug!("Encrypted password of project '{}'", project.name);
            sealed += 1;
        }
    }
    if seal_field(&codec, &mut config.s3.secret_key)? {
        tracing::debug!("Encrypted object storage secret key");
        sealed += 1;
    }
    Ok(sealed)
}

fn seal_field(codec: &SecretCodec, field: &mut String) -> Result<bool> {
    if field.is_empty() || codec.decrypt(field).is_ok() {
        return Ok(false);
    }
    *field = codec.encrypt(field)?;
    Ok(true)
}
