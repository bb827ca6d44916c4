// src/signature/signing.rs

//! Developer and store signing keys
//!
//! A key pair is kept on disk as two YAML streams shaped like the other
//! installer metadata: a format header followed by the key document.
//!
//! ```yaml
//! ---
//! formatType: am-secret-key
//! formatVersion: 1
//! ---
//! name: store
//! secretKey: <64 hex digits>
//! ```
//!
//! The public half uses `am-public-key` and a base64 `publicKey`, the same
//! encoding `trusted_keys` takes in the installer configuration.

use super::verify::{KeyEndorsement, PackageSignature};
use crate::error::{Error, Result};
use crate::yaml;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{SECRET_KEY_LENGTH, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::debug;

const SECRET_KEY_FORMAT: &str = "am-secret-key";
const PUBLIC_KEY_FORMAT: &str = "am-public-key";
const KEY_FORMAT_VERSION: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretKeyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    secret_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    public_key: String,
}

/// An Ed25519 key that signs package digests
pub struct SigningKeyPair {
    signing_key: SigningKey,
    key_id: Option<String>,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            key_id: None,
        }
    }

    /// Name the key; the name travels with every signature it makes
    pub fn with_key_id(mut self, id: &str) -> Self {
        self.key_id = Some(id.to_string());
        self
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The public key as listed in `trusted_keys`
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().as_bytes())
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Sign a package digest
    pub fn sign(&self, digest: &[u8]) -> PackageSignature {
        PackageSignature {
            algorithm: "ed25519".to_string(),
            signature: BASE64.encode(self.signing_key.sign(digest).to_bytes()),
            public_key: self.public_key_base64(),
            key_id: self.key_id.clone(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            endorsement: None,
        }
    }

    /// Sign a package digest and attach the link to a trusted key
    pub fn sign_endorsed(&self, digest: &[u8], endorsement: KeyEndorsement) -> PackageSignature {
        let mut signature = self.sign(digest);
        signature.endorsement = Some(endorsement);
        signature
    }

    /// Vouch for `key`, so that signatures made with it chain up to this key
    pub fn endorse(&self, key: &VerifyingKey) -> KeyEndorsement {
        KeyEndorsement {
            public_key: self.public_key_base64(),
            signature: BASE64.encode(self.signing_key.sign(key.as_bytes()).to_bytes()),
            key_id: self.key_id.clone(),
        }
    }

    /// Write the secret key (mode 0600) and the public key
    ///
    /// Existing files are replaced.
    pub fn write_key_files(&self, secret_path: &Path, public_path: &Path) -> Result<()> {
        let secret = SecretKeyDocument {
            name: self.key_id.clone(),
            secret_key: hex::encode(self.signing_key.to_bytes()),
        };
        let text = yaml::to_documents(&[
            yaml::format_header(SECRET_KEY_FORMAT, KEY_FORMAT_VERSION),
            serde_yaml::to_value(&secret)?,
        ])?;

        // Created 0600; a leftover file may carry wider permissions
        let _ = fs::remove_file(secret_path);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(secret_path)
            .map_err(|e| key_file_error("write", secret_path, e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| key_file_error("write", secret_path, e))?;

        let public = PublicKeyDocument {
            name: self.key_id.clone(),
            public_key: self.public_key_base64(),
        };
        let text = yaml::to_documents(&[
            yaml::format_header(PUBLIC_KEY_FORMAT, KEY_FORMAT_VERSION),
            serde_yaml::to_value(&public)?,
        ])?;
        fs::write(public_path, text).map_err(|e| key_file_error("write", public_path, e))?;

        debug!(
            "Wrote key pair {} to {} and {}",
            self.key_id.as_deref().unwrap_or("<unnamed>"),
            secret_path.display(),
            public_path.display()
        );
        Ok(())
    }

    /// Read a key pair back from its secret key file
    pub fn read_secret_key_file(path: &Path) -> Result<Self> {
        let document: SecretKeyDocument = read_key_document(path, SECRET_KEY_FORMAT)?;
        let bytes: [u8; SECRET_KEY_LENGTH] = hex::decode(document.secret_key.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                Error::ParseError(format!(
                    "{}: secretKey must be {} hex encoded bytes",
                    path.display(),
                    SECRET_KEY_LENGTH
                ))
            })?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
            key_id: document.name,
        })
    }
}

/// Read the base64 public key from a public key file
pub fn read_public_key_file(path: &Path) -> Result<String> {
    let document: PublicKeyDocument = read_key_document(path, PUBLIC_KEY_FORMAT)?;
    let key = document.public_key.trim();
    match BASE64.decode(key) {
        Ok(bytes) if bytes.len() == 32 => Ok(key.to_string()),
        _ => Err(Error::ParseError(format!(
            "{}: publicKey is not a base64 ed25519 key",
            path.display()
        ))),
    }
}

fn read_key_document<T: serde::de::DeserializeOwned>(path: &Path, format_type: &str) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| key_file_error("read", path, e))?;
    let documents = yaml::parse_documents(&content)?;
    let [header, document] = documents.as_slice() else {
        return Err(Error::ParseError(format!(
            "{}: a key file holds exactly two YAML documents, found {}",
            path.display(),
            documents.len()
        )));
    };
    yaml::check_format_header(header, format_type, KEY_FORMAT_VERSION)?;
    serde_yaml::from_value(document.clone())
        .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
}

fn key_file_error(action: &str, path: &Path, err: std::io::Error) -> Error {
    Error::IoError(format!("could not {} key file {}: {}", action, path.display(), err))
}
