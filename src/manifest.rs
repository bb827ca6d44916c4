// src/manifest.rs

//! Application manifests (`info.yaml`)
//!
//! Only the fields the installer needs are read: id, icon, code, runtime,
//! name, version and capabilities. Everything else in the manifest is left to
//! the application manager.

use crate::error::{Error, Result};
use crate::yaml;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File name of the manifest inside packages and manifest directories
pub const MANIFEST_FILE_NAME: &str = "info.yaml";

const MANIFEST_FORMAT: &str = "am-application";
const MANIFEST_FORMAT_VERSION: u64 = 1;

/// Maximum length of an application or package id
pub const MAX_ID_LENGTH: usize = 150;

/// Check a reverse-DNS style id like `com.example.app`
///
/// At least three parts, each 1-63 characters of `[0-9a-z-]` that neither
/// start nor end with `-`.
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_ID_LENGTH {
        return false;
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return false;
    }

    parts.iter().all(|part| {
        (1..=63).contains(&part.len())
            && !part.starts_with('-')
            && !part.ends_with('-')
            && part
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b == b'-')
    })
}

/// The installer's view of an application manifest
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationManifest {
    pub id: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub name: BTreeMap<String, String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ApplicationManifest {
    /// Parse manifest text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let documents = yaml::parse_documents(content)?;
        if documents.len() != 2 {
            return Err(Error::ParseError(format!(
                "manifest must consist of 2 YAML documents, got {}",
                documents.len()
            )));
        }
        yaml::check_format_header(&documents[0], MANIFEST_FORMAT, MANIFEST_FORMAT_VERSION)?;

        let manifest: Self = serde_yaml::from_value(documents[1].clone())?;
        if !is_valid_dns_name(&manifest.id) {
            return Err(Error::ParseError(format!(
                "manifest has an invalid id: '{}'",
                manifest.id
            )));
        }
        if manifest.icon.contains('/') {
            return Err(Error::ParseError(format!(
                "manifest icon must be a plain file name: '{}'",
                manifest.icon
            )));
        }
        Ok(manifest)
    }

    /// Read and parse a manifest file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::IoError(format!("could not read manifest {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content).map_err(|e| {
            Error::ParseError(format!(
                "could not parse manifest {}: {}",
                path.display(),
                e.message()
            ))
        })
    }

    /// Serialize into manifest text
    pub fn to_yaml(&self) -> Result<String> {
        let body = serde_yaml::to_value(self)?;
        yaml::to_documents(&[
            yaml::format_header(MANIFEST_FORMAT, MANIFEST_FORMAT_VERSION),
            body,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "\
formatType: am-application
formatVersion: 1
---
id: com.pelagicore.test
icon: icon.png
code: test.qml
runtime: qml
name:
  en: Test App
  de: Test-Anwendung
version: 1.0.0
capabilities: [cameraAccess]
applicationProperties:
  ignored: true
";

    #[test]
    fn test_dns_names() {
        assert!(is_valid_dns_name("com.pelagicore.test"));
        assert!(is_valid_dns_name("a.b.c"));
        assert!(is_valid_dns_name("com.example.my-app2"));
        assert!(!is_valid_dns_name("com.example"));
        assert!(!is_valid_dns_name("com.Example.app"));
        assert!(!is_valid_dns_name("com.example.-app"));
        assert!(!is_valid_dns_name("com.example.app-"));
        assert!(!is_valid_dns_name("com..app"));
        assert!(!is_valid_dns_name("com.example.app_1"));
        assert!(!is_valid_dns_name(&format!("com.example.{}", "a".repeat(64))));
        assert!(!is_valid_dns_name(&format!("{}.b.c", "a.".repeat(75))));
        assert!(!is_valid_dns_name(""));
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = ApplicationManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.id, "com.pelagicore.test");
        assert_eq!(manifest.icon, "icon.png");
        assert_eq!(manifest.runtime, "qml");
        assert_eq!(manifest.name.get("de").map(String::as_str), Some("Test-Anwendung"));
        assert_eq!(manifest.capabilities, vec!["cameraAccess".to_string()]);
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ApplicationManifest::from_yaml(MANIFEST).unwrap();
        let text = manifest.to_yaml().unwrap();
        assert_eq!(ApplicationManifest::from_yaml(&text).unwrap(), manifest);
    }

    #[test]
    fn test_wrong_format_rejected() {
        let text = MANIFEST.replace("am-application", "am-package-header");
        assert!(ApplicationManifest::from_yaml(&text).is_err());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let text = MANIFEST.replace("com.pelagicore.test", "Test");
        let err = ApplicationManifest::from_yaml(&text).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn test_icon_path_rejected() {
        let text = MANIFEST.replace("icon: icon.png", "icon: ../icon.png");
        assert!(ApplicationManifest::from_yaml(&text).is_err());
    }
}
