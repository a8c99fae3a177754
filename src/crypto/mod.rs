//! Crypto layer
//!
//! Authenticated payload encryption: AES-256-CTR for confidentiality,
//! HMAC (SHA-256 or SHA-512) for integrity, with both keys derived from
//! one master key and a random per-payload salt via PBKDF2-SHA256. The
//! on-disk envelope is a Base64-wrapped JSON object:
//!
//! ```text
//! base64(utf8(json({
//!   salt:       base64(16 random bytes),
//!   iv:         base64(16 random bytes),
//!   ciphertext: base64(AES-256-CTR(aes_key, iv, plaintext)),
//!   hmac:       base64(HMAC(hmac_key, base64(ciphertext)))
//! })))
//! ```
//!
//! The HMAC input is the Base64 *string* of the ciphertext, not the raw
//! bytes; both sides of the wire must agree on that. Verification happens
//! before any decryption, and a mismatch is fatal — plaintext is never
//! returned on a bad MAC.
//!
//! Bulk variants derive one key pair and reuse one salt/iv across the
//! whole call. That trades per-item keystream isolation for one PBKDF2
//! per batch, which fits the at-rest threat model here: the items of one
//! bulk call are written together under one master key. Callers that need
//! per-item isolation use the single-payload API.

pub mod keycache;

pub use keycache::{KeyCache, KeyCacheConfig, KeyPair, KEY_SIZE};

use std::time::Duration;

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Sha256, Sha512};

use crate::error::{ErrorCode, Result, StoreError};
use crate::io_util::with_timeout;
use crate::types::Record;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Allowed PBKDF2 iteration range; out-of-range configs are clamped
pub const MIN_ITERATIONS: u32 = 10_000;
pub const MAX_ITERATIONS: u32 = 1_000_000;

/// Integrity algorithm for the envelope MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
    Sha256,
    Sha512,
}

impl Default for HmacAlgorithm {
    fn default() -> Self {
        HmacAlgorithm::Sha256
    }
}

#[derive(Debug, Clone)]
pub struct CryptoConfig {
    /// PBKDF2 iteration count, clamped to the allowed range
    pub iterations: u32,
    pub hmac_algorithm: HmacAlgorithm,
    /// Timeout applied to each key derivation
    pub derive_timeout: Duration,
    pub key_cache: KeyCacheConfig,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            iterations: MIN_ITERATIONS,
            hmac_algorithm: HmacAlgorithm::Sha256,
            derive_timeout: Duration::from_secs(10),
            key_cache: KeyCacheConfig::default(),
        }
    }
}

/// Hands back the master key; may prompt out of band and may fail when
/// authentication is denied. Provided by the embedding application.
pub trait MasterKeyProvider: Send + Sync {
    fn master_key(&self, require_auth: bool) -> Result<String>;
}

/// Keystore abstraction for persisting the master key material
pub trait SecureStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn delete_item(&self, key: &str) -> Result<()>;
}

/// Provider with a fixed key, cached for the session. Fits tests and
/// deployments where the key comes from the environment.
pub struct StaticKeyProvider {
    key: String,
}

impl StaticKeyProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl MasterKeyProvider for StaticKeyProvider {
    fn master_key(&self, _require_auth: bool) -> Result<String> {
        Ok(self.key.clone())
    }
}

/// In-memory keystore for tests
pub struct MemoryKeyStore {
    items: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            items: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureStorage for MemoryKeyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().expect("keystore lock poisoned").get(key).cloned())
    }
    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items
            .lock()
            .expect("keystore lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
    fn delete_item(&self, key: &str) -> Result<()> {
        self.items.lock().expect("keystore lock poisoned").remove(key);
        Ok(())
    }
}

/// The parsed envelope layer (inside the outer Base64)
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    salt: String,
    iv: String,
    ciphertext: String,
    hmac: String,
}

fn clamp_iterations(iterations: u32) -> u32 {
    if iterations < MIN_ITERATIONS || iterations > MAX_ITERATIONS {
        let clamped = iterations.clamp(MIN_ITERATIONS, MAX_ITERATIONS);
        log::warn!(
            "PBKDF2 iteration count {} outside [{}, {}]; clamping to {}",
            iterations,
            MIN_ITERATIONS,
            MAX_ITERATIONS,
            clamped
        );
        clamped
    } else {
        iterations
    }
}

fn random_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn compute_hmac(algorithm: HmacAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        HmacAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| {
                StoreError::new(ErrorCode::EncryptFailed, "invalid HMAC key length")
                    .with_details(e.to_string())
            })?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        HmacAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(|e| {
                StoreError::new(ErrorCode::EncryptFailed, "invalid HMAC key length")
                    .with_details(e.to_string())
            })?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

fn verify_hmac(algorithm: HmacAlgorithm, key: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
    let failed = match algorithm {
        HmacAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| {
                StoreError::new(ErrorCode::DecryptFailed, "invalid HMAC key length")
                    .with_details(e.to_string())
            })?;
            mac.update(data);
            mac.verify_slice(expected).is_err()
        }
        HmacAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(|e| {
                StoreError::new(ErrorCode::DecryptFailed, "invalid HMAC key length")
                    .with_details(e.to_string())
            })?;
            mac.update(data);
            mac.verify_slice(expected).is_err()
        }
    };
    if failed {
        return Err(StoreError::new(
            ErrorCode::HmacMismatch,
            "payload integrity check failed",
        )
        .with_suggestion("the payload was tampered with or the master key is wrong"));
    }
    Ok(())
}

fn decode_field(payload: &str, field: &str) -> Result<Vec<u8>> {
    base64::decode(payload).map_err(|e| {
        StoreError::new(
            ErrorCode::DecryptFailed,
            format!("envelope field '{}' is not valid base64", field),
        )
        .with_cause(e)
    })
}

/// Authenticated encryption service with a derived-key cache
pub struct CryptoService {
    config: CryptoConfig,
    key_cache: KeyCache,
}

impl CryptoService {
    pub fn new(mut config: CryptoConfig) -> Self {
        config.iterations = clamp_iterations(config.iterations);
        let key_cache = KeyCache::new(config.key_cache.clone());
        Self { config, key_cache }
    }

    /// PBKDF2-SHA256 to 2x key size, split `aes_key | hmac_key`. Cached.
    fn derive_pair(&self, master_key: &str, salt: &[u8]) -> Result<KeyPair> {
        let iterations = self.config.iterations;
        self.key_cache.get_or_derive(master_key, salt, iterations, || {
            let master = master_key.as_bytes().to_vec();
            let salt = salt.to_vec();
            with_timeout("key derivation", self.config.derive_timeout, move || {
                let mut output = [0u8; KEY_SIZE * 2];
                pbkdf2::pbkdf2_hmac::<Sha256>(&master, &salt, iterations, &mut output);

                let mut aes_key = [0u8; KEY_SIZE];
                let mut hmac_key = [0u8; KEY_SIZE];
                aes_key.copy_from_slice(&output[..KEY_SIZE]);
                hmac_key.copy_from_slice(&output[KEY_SIZE..]);
                Ok(KeyPair { aes_key, hmac_key })
            })
            .map_err(|e| {
                StoreError::new(ErrorCode::KeyDeriveFailed, "PBKDF2 derivation failed").with_cause(e)
            })
        })
    }

    fn seal(&self, plaintext: &[u8], pair: &KeyPair, salt: &[u8; 16], iv: &[u8; 16]) -> Result<String> {
        let mut buffer = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new(&pair.aes_key.into(), &(*iv).into());
        cipher.apply_keystream(&mut buffer);

        let ciphertext_b64 = base64::encode(&buffer);
        let tag = compute_hmac(
            self.config.hmac_algorithm,
            &pair.hmac_key,
            ciphertext_b64.as_bytes(),
        )?;

        let envelope = Envelope {
            salt: base64::encode(salt),
            iv: base64::encode(iv),
            ciphertext: ciphertext_b64,
            hmac: base64::encode(tag),
        };
        let json = serde_json::to_string(&envelope).map_err(|e| {
            StoreError::new(ErrorCode::EncryptFailed, "failed to serialize envelope").with_cause(e)
        })?;
        Ok(base64::encode(json.as_bytes()))
    }

    /// Encrypt a UTF-8 payload into the Base64 envelope
    pub fn encrypt(&self, plaintext: &str, master_key: &str) -> Result<String> {
        let salt = random_bytes();
        let iv = random_bytes();
        let pair = self.derive_pair(master_key, &salt)?;
        self.seal(plaintext.as_bytes(), &pair, &salt, &iv)
    }

    /// Verify and decrypt an envelope. HMAC runs first; a mismatch never
    /// yields plaintext.
    pub fn decrypt(&self, payload: &str, master_key: &str) -> Result<String> {
        let outer = decode_field(payload.trim(), "payload")?;
        let json = String::from_utf8(outer).map_err(|e| {
            StoreError::new(ErrorCode::DecryptFailed, "envelope is not UTF-8").with_cause(e)
        })?;
        let envelope: Envelope = serde_json::from_str(&json).map_err(|e| {
            StoreError::new(ErrorCode::DecryptFailed, "envelope is not a valid JSON object")
                .with_cause(e)
        })?;

        let salt = decode_field(&envelope.salt, "salt")?;
        let iv_bytes = decode_field(&envelope.iv, "iv")?;
        let iv: [u8; 16] = iv_bytes.as_slice().try_into().map_err(|_| {
            StoreError::new(ErrorCode::DecryptFailed, "IV must be 16 bytes")
        })?;
        let expected_tag = decode_field(&envelope.hmac, "hmac")?;

        let pair = self.derive_pair(master_key, &salt)?;
        verify_hmac(
            self.config.hmac_algorithm,
            &pair.hmac_key,
            envelope.ciphertext.as_bytes(),
            &expected_tag,
        )?;

        let mut buffer = decode_field(&envelope.ciphertext, "ciphertext")?;
        let mut cipher = Aes256Ctr::new(&pair.aes_key.into(), &iv.into());
        cipher.apply_keystream(&mut buffer);

        String::from_utf8(buffer).map_err(|e| {
            StoreError::new(ErrorCode::DecryptFailed, "decrypted payload is not UTF-8")
                .with_cause(e)
        })
    }

    /// Encrypt many payloads with one derived pair and one salt/iv
    pub fn encrypt_bulk(&self, items: &[String], master_key: &str) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let salt = random_bytes();
        let iv = random_bytes();
        let pair = self.derive_pair(master_key, &salt)?;
        items
            .iter()
            .map(|item| self.seal(item.as_bytes(), &pair, &salt, &iv))
            .collect()
    }

    /// Decrypt many envelopes; the key cache amortizes the derivations
    pub fn decrypt_bulk(&self, payloads: &[String], master_key: &str) -> Result<Vec<String>> {
        payloads
            .iter()
            .map(|payload| self.decrypt(payload, master_key))
            .collect()
    }

    /// Encrypt the listed fields of a record in place (every field when
    /// the list is empty, `id` excepted so lookups keep working)
    pub fn encrypt_fields(
        &self,
        record: &Record,
        fields: &[String],
        master_key: &str,
    ) -> Result<Record> {
        let mut out = record.clone();
        for field in Self::target_fields(record, fields) {
            if let Some(value) = record.get(&field) {
                let plaintext = serde_json::to_string(value).map_err(|e| {
                    StoreError::new(
                        ErrorCode::EncryptFailed,
                        format!("field '{}' cannot be serialized", field),
                    )
                    .with_cause(e)
                })?;
                out.insert(field, Value::String(self.encrypt(&plaintext, master_key)?));
            }
        }
        Ok(out)
    }

    /// Reverse of [`encrypt_fields`]
    pub fn decrypt_fields(
        &self,
        record: &Record,
        fields: &[String],
        master_key: &str,
    ) -> Result<Record> {
        let mut out = record.clone();
        for field in Self::target_fields(record, fields) {
            if let Some(Value::String(payload)) = record.get(&field) {
                let plaintext = self.decrypt(payload, master_key)?;
                let value: Value = serde_json::from_str(&plaintext).map_err(|e| {
                    StoreError::new(
                        ErrorCode::DecryptFailed,
                        format!("field '{}' did not decrypt to JSON", field),
                    )
                    .with_cause(e)
                })?;
                out.insert(field, value);
            }
        }
        Ok(out)
    }

    /// Field-level encryption across records with one shared derivation
    pub fn encrypt_fields_bulk(
        &self,
        records: &[Record],
        fields: &[String],
        master_key: &str,
    ) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let salt = random_bytes();
        let iv = random_bytes();
        let pair = self.derive_pair(master_key, &salt)?;

        records
            .iter()
            .map(|record| {
                let mut out = record.clone();
                for field in Self::target_fields(record, fields) {
                    if let Some(value) = record.get(&field) {
                        let plaintext = serde_json::to_string(value).map_err(|e| {
                            StoreError::new(
                                ErrorCode::EncryptFailed,
                                format!("field '{}' cannot be serialized", field),
                            )
                            .with_cause(e)
                        })?;
                        out.insert(
                            field,
                            Value::String(self.seal(plaintext.as_bytes(), &pair, &salt, &iv)?),
                        );
                    }
                }
                Ok(out)
            })
            .collect()
    }

    /// Reverse of [`encrypt_fields_bulk`]
    pub fn decrypt_fields_bulk(
        &self,
        records: &[Record],
        fields: &[String],
        master_key: &str,
    ) -> Result<Vec<Record>> {
        records
            .iter()
            .map(|record| self.decrypt_fields(record, fields, master_key))
            .collect()
    }

    fn target_fields(record: &Record, fields: &[String]) -> Vec<String> {
        if fields.is_empty() {
            record.keys().filter(|k| *k != "id").cloned().collect()
        } else {
            fields.to_vec()
        }
    }

    /// Cancel the key-cache janitor and drop cached keys
    pub fn shutdown(&self) {
        self.key_cache.shutdown();
    }
}
