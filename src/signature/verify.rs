// src/signature/verify.rs
//! Package signature verification
//!
//! Developer and store signatures are detached Ed25519 signatures over the
//! package digest. A signature is accepted if its key is in the chain of
//! trust, or if it carries an endorsement made by a key in the chain.

use crate::error::{Error, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use thiserror::Error;

/// Verification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Package is not signed")]
    NotSigned,

    #[error("Invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Trust policy violation: {0}")]
    TrustViolation(String),
}

/// A trusted key vouching for the key that made a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEndorsement {
    /// Base64-encoded public key of the endorser
    pub public_key: String,
    /// Base64-encoded signature of the endorser over the endorsed public key
    pub signature: String,
    #[serde(default)]
    pub key_id: Option<String>,
}

/// Signature data stored in a package footer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSignature {
    /// Signature algorithm (currently only "ed25519")
    pub algorithm: String,
    /// Base64-encoded signature bytes
    pub signature: String,
    /// Base64-encoded public key
    pub public_key: String,
    /// Optional key identifier (fingerprint or name)
    #[serde(default)]
    pub key_id: Option<String>,
    /// Timestamp when signed (RFC 3339)
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Link from the signing key to a trusted key
    #[serde(default)]
    pub endorsement: Option<KeyEndorsement>,
}

impl PackageSignature {
    /// Encode for embedding in a package footer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::SystemError(format!("could not encode signature: {}", e)))
    }

    /// Decode a footer signature blob
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, VerifyError> {
        serde_json::from_slice(data)
            .map_err(|e| VerifyError::InvalidSignatureFormat(format!("not a signature: {}", e)))
    }
}

/// The set of public keys signatures must chain up to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainOfTrust {
    /// Trusted public keys (base64-encoded)
    pub trusted_keys: Vec<String>,
}

impl ChainOfTrust {
    pub fn new(trusted_keys: Vec<String>) -> Self {
        Self { trusted_keys }
    }

    /// Build the chain from `trusted_keys` configuration entries
    ///
    /// An entry is either an inline base64 public key or the path of a
    /// public key file written by `SigningKeyPair::write_key_files`.
    pub fn from_config_entries(entries: &[String]) -> Result<Self> {
        let trusted_keys = entries
            .iter()
            .map(|entry| {
                if decode_key(entry).is_ok() {
                    Ok(entry.clone())
                } else {
                    super::signing::read_public_key_file(Path::new(entry))
                }
            })
            .collect::<Result<_>>()?;
        Ok(Self { trusted_keys })
    }

    pub fn is_empty(&self) -> bool {
        self.trusted_keys.is_empty()
    }

    pub fn is_trusted(&self, public_key: &str) -> bool {
        self.trusted_keys.iter().any(|k| k == public_key)
    }
}

fn decode_key(encoded: &str) -> std::result::Result<VerifyingKey, VerifyError> {
    let key_bytes = BASE64
        .decode(encoded)
        .map_err(|e| VerifyError::InvalidSignatureFormat(format!("Invalid public key base64: {}", e)))?;

    VerifyingKey::from_bytes(&key_bytes.try_into().map_err(|_| {
        VerifyError::InvalidSignatureFormat("Public key must be 32 bytes".into())
    })?)
    .map_err(|e| VerifyError::InvalidSignatureFormat(format!("Invalid public key: {}", e)))
}

fn decode_signature(encoded: &str) -> std::result::Result<Signature, VerifyError> {
    let sig_bytes = BASE64
        .decode(encoded)
        .map_err(|e| VerifyError::InvalidSignatureFormat(format!("Invalid signature base64: {}", e)))?;

    Signature::from_slice(&sig_bytes)
        .map_err(|e| VerifyError::InvalidSignatureFormat(format!("Invalid signature: {}", e)))
}

/// Verify a signature blob over `digest` against `chain`
pub fn verify_signature(
    digest: &[u8],
    signature_blob: &[u8],
    chain: &ChainOfTrust,
) -> std::result::Result<PackageSignature, VerifyError> {
    if signature_blob.is_empty() {
        return Err(VerifyError::NotSigned);
    }
    let sig = PackageSignature::from_bytes(signature_blob)?;

    if sig.algorithm != "ed25519" {
        return Err(VerifyError::InvalidSignatureFormat(format!(
            "Unsupported algorithm: {}",
            sig.algorithm
        )));
    }

    let signature = decode_signature(&sig.signature)?;
    let verifying_key = decode_key(&sig.public_key)?;

    verifying_key
        .verify_strict(digest, &signature)
        .map_err(|e| VerifyError::SignatureInvalid(format!("Signature verification failed: {}", e)))?;

    if chain.is_empty() {
        return Err(VerifyError::TrustViolation(
            "no trusted keys are configured".to_string(),
        ));
    }
    if chain.is_trusted(&sig.public_key) {
        return Ok(sig);
    }

    let Some(endorsement) = &sig.endorsement else {
        return Err(VerifyError::TrustViolation(format!(
            "Key not trusted: {:?}",
            sig.key_id
        )));
    };
    if !chain.is_trusted(&endorsement.public_key) {
        return Err(VerifyError::TrustViolation(format!(
            "Endorsing key not trusted: {:?}",
            endorsement.key_id
        )));
    }

    let endorser = decode_key(&endorsement.public_key)?;
    let endorsement_signature = decode_signature(&endorsement.signature)?;
    endorser
        .verify_strict(verifying_key.as_bytes(), &endorsement_signature)
        .map_err(|e| VerifyError::TrustViolation(format!("Invalid key endorsement: {}", e)))?;

    Ok(sig)
}

/// Digest a store signature is made over when it is bound to one device:
/// HMAC-SHA256 keyed with the hardware id over the package digest
pub fn hardware_bound_digest(hardware_id: &str, digest: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(hardware_id.as_bytes())
        .map_err(|e| Error::SystemError(format!("invalid hardware id key: {}", e)))?;
    mac.update(digest);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SigningKeyPair;

    const DIGEST: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_trusted_key_accepted() {
        let key = SigningKeyPair::generate().with_key_id("store");
        let chain = ChainOfTrust::new(vec![key.public_key_base64()]);
        let blob = key.sign(DIGEST).to_bytes().unwrap();

        let sig = verify_signature(DIGEST, &blob, &chain).unwrap();
        assert_eq!(sig.key_id.as_deref(), Some("store"));
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let key = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let chain = ChainOfTrust::new(vec![other.public_key_base64()]);
        let blob = key.sign(DIGEST).to_bytes().unwrap();

        assert!(matches!(
            verify_signature(DIGEST, &blob, &chain),
            Err(VerifyError::TrustViolation(_))
        ));
    }

    #[test]
    fn test_empty_chain_rejects() {
        let key = SigningKeyPair::generate();
        let blob = key.sign(DIGEST).to_bytes().unwrap();
        assert!(matches!(
            verify_signature(DIGEST, &blob, &ChainOfTrust::default()),
            Err(VerifyError::TrustViolation(_))
        ));
    }

    #[test]
    fn test_wrong_digest_rejected() {
        let key = SigningKeyPair::generate();
        let chain = ChainOfTrust::new(vec![key.public_key_base64()]);
        let blob = key.sign(DIGEST).to_bytes().unwrap();

        assert!(matches!(
            verify_signature(b"another digest", &blob, &chain),
            Err(VerifyError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_endorsed_key_accepted() {
        let ca = SigningKeyPair::generate().with_key_id("ca");
        let developer = SigningKeyPair::generate().with_key_id("developer");
        let chain = ChainOfTrust::new(vec![ca.public_key_base64()]);

        let endorsement = ca.endorse(&developer.verifying_key());
        let blob = developer
            .sign_endorsed(DIGEST, endorsement)
            .to_bytes()
            .unwrap();
        assert!(verify_signature(DIGEST, &blob, &chain).is_ok());
    }

    #[test]
    fn test_forged_endorsement_rejected() {
        let ca = SigningKeyPair::generate();
        let mallory = SigningKeyPair::generate();
        let developer = SigningKeyPair::generate();
        let chain = ChainOfTrust::new(vec![ca.public_key_base64()]);

        // Endorsed by mallory, but claims to be from the CA
        let mut endorsement = mallory.endorse(&developer.verifying_key());
        endorsement.public_key = ca.public_key_base64();
        let blob = developer
            .sign_endorsed(DIGEST, endorsement)
            .to_bytes()
            .unwrap();
        assert!(matches!(
            verify_signature(DIGEST, &blob, &chain),
            Err(VerifyError::TrustViolation(_))
        ));
    }

    /// Small-order key with a signature that holds for any message
    fn weak_signature_blob() -> (String, Vec<u8>) {
        let mut identity = [0u8; 32];
        identity[0] = 1;
        let mut signature = [0u8; 64];
        signature[0] = 1;
        let public_key = BASE64.encode(identity);
        let blob = PackageSignature {
            algorithm: "ed25519".to_string(),
            signature: BASE64.encode(signature),
            public_key: public_key.clone(),
            key_id: None,
            timestamp: None,
            endorsement: None,
        }
        .to_bytes()
        .unwrap();
        (public_key, blob)
    }

    #[test]
    fn test_weak_key_rejected() {
        let (public_key, blob) = weak_signature_blob();
        let chain = ChainOfTrust::new(vec![public_key]);
        assert!(matches!(
            verify_signature(DIGEST, &blob, &chain),
            Err(VerifyError::SignatureInvalid(_))
        ));
        assert!(matches!(
            verify_signature(b"another digest", &blob, &chain),
            Err(VerifyError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_weak_endorsement_rejected() {
        let (weak_key, _) = weak_signature_blob();
        let developer = SigningKeyPair::generate();
        let chain = ChainOfTrust::new(vec![weak_key.clone()]);

        let mut signature = [0u8; 64];
        signature[0] = 1;
        let endorsement = KeyEndorsement {
            public_key: weak_key,
            signature: BASE64.encode(signature),
            key_id: None,
        };
        let blob = developer
            .sign_endorsed(DIGEST, endorsement)
            .to_bytes()
            .unwrap();
        assert!(matches!(
            verify_signature(DIGEST, &blob, &chain),
            Err(VerifyError::TrustViolation(_))
        ));
    }

    #[test]
    fn test_garbage_and_empty_blobs() {
        let chain = ChainOfTrust::new(vec!["abc".to_string()]);
        assert_eq!(verify_signature(DIGEST, b"", &chain), Err(VerifyError::NotSigned));
        assert!(matches!(
            verify_signature(DIGEST, b"not json", &chain),
            Err(VerifyError::InvalidSignatureFormat(_))
        ));
    }

    #[test]
    fn test_chain_from_config_entries() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let secret = temp_dir.path().join("store.secret");
        let public = temp_dir.path().join("store.public");
        let store = SigningKeyPair::generate();
        store.write_key_files(&secret, &public).unwrap();
        let inline = SigningKeyPair::generate();

        let chain = ChainOfTrust::from_config_entries(&[
            inline.public_key_base64(),
            public.display().to_string(),
        ])
        .unwrap();
        assert!(chain.is_trusted(&inline.public_key_base64()));
        assert!(chain.is_trusted(&store.public_key_base64()));

        let missing = temp_dir.path().join("missing.public").display().to_string();
        assert!(ChainOfTrust::from_config_entries(&[missing]).is_err());
    }

    #[test]
    fn test_hardware_bound_digest() {
        let a = hardware_bound_digest("0815", DIGEST).unwrap();
        let b = hardware_bound_digest("4711", DIGEST).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, hardware_bound_digest("0815", DIGEST).unwrap());
    }
}
