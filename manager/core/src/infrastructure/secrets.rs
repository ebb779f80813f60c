// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Secret Key Store
//!
//! RSA keypair used to encrypt secrets embedded in templates. The pair is
//! loaded once (PEM file, or generated and written back when the file is
//! missing) and published behind an [`ArcSwap`]; readers never block.
//! Rotations are serialised by a mutex and bump [`SecretKeyStore::version`].
//!
//! Ciphertexts are PKCS#1 v1.5 encrypted and base64-encoded.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Process-wide encryption key

use crate::domain::error::{codes, AxError, AxResult};
use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_KEY_BITS: usize = 2048;

struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    version: u64,
}

impl KeyPair {
    fn new(private: RsaPrivateKey, version: u64) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public, version }
    }
}

pub struct SecretKeyStore {
    current: ArcSwap<KeyPair>,
    rotation: Mutex<()>,
    path: Option<PathBuf>,
    bits: usize,
}

impl SecretKeyStore {
    /// Load the key at `path`, or generate one (and persist it to `path`
    /// when given).
    pub fn load(path: Option<&Path>) -> AxResult<Self> {
        Self::load_with_bits(path, DEFAULT_KEY_BITS)
    }

    pub fn load_with_bits(path: Option<&Path>, bits: usize) -> AxResult<Self> {
        let private = match path {
            Some(p) if p.exists() => {
                let pem = std::fs::read_to_string(p)
                    .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, format!("Failed to read {}", p.display())))?;
                let key = parse_pem(&pem)?;
                info!("Loaded secret key from {}", p.display());
                key
            }
            _ => {
                let key = generate(bits)?;
                match path {
                    Some(p) => write_pem(p, &key)?,
                    None => warn!("No secret key path configured, using an ephemeral key"),
                }
                key
            }
        };
        Ok(Self {
            current: ArcSwap::from_pointee(KeyPair::new(private, 1)),
            rotation: Mutex::new(()),
            path: path.map(Path::to_path_buf),
            bits,
        })
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Replace the keypair. Data encrypted under the previous key can no
    /// longer be decrypted.
    pub fn rotate(&self) -> AxResult<u64> {
        let _guard = self.rotation.lock();
        let key = generate(self.bits)?;
        if let Some(p) = &self.path {
            write_pem(p, &key)?;
        }
        let version = self.version() + 1;
        self.current.store(Arc::new(KeyPair::new(key, version)));
        info!("Rotated secret key to version {}", version);
        Ok(version)
    }

    pub fn encrypt(&self, plaintext: &str) -> AxResult<String> {
        let pair = self.current.load();
        let cipher = pair
            .public
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext.as_bytes())
            .map_err(|e| AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, "Failed to encrypt secret"))?;
        Ok(STANDARD.encode(cipher))
    }

    pub fn decrypt(&self, ciphertext: &str) -> AxResult<String> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, "Secret is not base64"))?;
        let plain = self
            .current
            .load()
            .private
            .decrypt(Pkcs1v15Encrypt, &raw)
            .map_err(|e| AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, "Failed to decrypt secret"))?;
        String::from_utf8(plain)
            .map_err(|e| AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, "Secret is not valid UTF-8"))
    }
}

fn generate(bits: usize) -> AxResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Failed to generate secret key"))
}

fn parse_pem(pem: &str) -> AxResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Secret key is not a PEM RSA private key"))
}

fn write_pem(path: &Path, key: &RsaPrivateKey) -> AxResult<()> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Failed to encode secret key"))?;
    std::fs::write(path, pem.as_bytes())
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, format!("Failed to write {}", path.display())))?;
    info!("Wrote secret key to {}", path.display());
    Ok(())
}
