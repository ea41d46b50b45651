// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Encrypted-at-rest named credential storage.
//!
//! A single file, owner-only (0o600), holding a salt and a base64 payload.
//! The payload is the JSON map of names to values XOR-ed with a keystream
//! derived from the operator passphrase: `block_i = SHA-256(key ‖ i)` where
//! `key = SHA-256(passphrase ‖ salt)`.  The file is rewritten whole on every
//! mutation; there is no partial-update path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SecurityError;

#[derive(Serialize, Deserialize)]
struct SecretFile {
    salt: String,
    payload: String,
}

#[derive(Debug)]
pub struct SecretStore {
    path: PathBuf,
    key: [u8; 32],
    salt: [u8; 16],
    entries: BTreeMap<String, String>,
}

impl SecretStore {
    /// Open (or create) the store at `path`, unlocking with `passphrase`.
    /// A wrong passphrase surfaces as a decode error, not garbage entries.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, SecurityError> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| SecurityError::Secret(format!("read: {e}")))?;
            let file: SecretFile = serde_json::from_str(&text)
                .map_err(|e| SecurityError::Secret(format!("parse: {e}")))?;
            let salt_vec = hex::decode(&file.salt)
                .map_err(|e| SecurityError::Secret(format!("salt: {e}")))?;
            let mut salt = [0u8; 16];
            if salt_vec.len() != 16 {
                return Err(SecurityError::Secret("salt length".into()));
            }
            salt.copy_from_slice(&salt_vec);

            let key = derive_key(passphrase, &salt);
            let cipher = base64::engine::general_purpose::STANDARD
                .decode(&file.payload)
                .map_err(|e| SecurityError::Secret(format!("payload: {e}")))?;
            let plain = xor_keystream(&cipher, &key);
            let entries: BTreeMap<String, String> = serde_json::from_slice(&plain)
                .map_err(|_| SecurityError::Secret("wrong passphrase or corrupt store".into()))?;

            Ok(Self {
                path: path.to_path_buf(),
                key,
                salt,
                entries,
            })
        } else {
            let mut salt = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            let key = derive_key(passphrase, &salt);
            let store = Self {
                path: path.to_path_buf(),
                key,
                salt,
                entries: BTreeMap::new(),
            };
            store.persist()?;
            Ok(store)
        }
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<(), SecurityError> {
        self.entries.insert(name.to_string(), value.to_string());
        self.persist()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn delete(&mut self, name: &str) -> Result<bool, SecurityError> {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Names only — values never leave the store in bulk.
    pub fn list_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), SecurityError> {
        let plain = serde_json::to_vec(&self.entries)
            .map_err(|e| SecurityError::Secret(format!("encode: {e}")))?;
        let cipher = xor_keystream(&plain, &self.key);
        let file = SecretFile {
            salt: hex::encode(self.salt),
            payload: base64::engine::general_purpose::STANDARD.encode(cipher),
        };
        let text = serde_json::to_string_pretty(&file)
            .map_err(|e| SecurityError::Secret(format!("encode: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SecurityError::Secret(format!("mkdir: {e}")))?;
        }
        std::fs::write(&self.path, text)
            .map_err(|e| SecurityError::Secret(format!("write: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SecurityError::Secret(format!("chmod: {e}")))?;
        }

        Ok(())
    }
}

fn derive_key(passphrase: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(salt);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn xor_keystream(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut block_index: u64 = 0;
    let mut block = keystream_block(key, block_index);
    for (i, byte) in data.iter().enumerate() {
        let offset = i % 32;
        if i > 0 && offset == 0 {
            block_index += 1;
            block = keystream_block(key, block_index);
        }
        out.push(byte ^ block[offset]);
    }
    out
}

fn keystream_block(key: &[u8; 32], index: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(index.to_le_bytes());
    let mut block = [0u8; 32];
    block.copy_from_slice(&hasher.finalize());
    block
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
