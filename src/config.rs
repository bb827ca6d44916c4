// src/config.rs

//! Installer configuration
//!
//! The installer is configured from a single TOML file. Every field has a
//! sensible default so a minimal file only needs a `[[locations]]` table.
//!
//! ```toml
//! manifest_dir = "/opt/am/manifests"
//! image_mount_dir = "/opt/am/image-mounts"
//! hardware_id = "0815"
//! trusted_keys = ["base64-ed25519-public-key"]
//!
//! [user_id_separation]
//! min_user_id = 20000
//! max_user_id = 20999
//! common_group_id = 20000
//!
//! [privileges]
//! allow_unprivileged_fallback = false
//! drop_privileges = "permanent"
//!
//! [[locations]]
//! id = "internal-0"
//! installation_path = "/opt/am/apps"
//! document_path = "/opt/am/docs"
//! is_default = true
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Range of uids handed out to installed applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UserIdSeparation {
    pub min_user_id: u32,
    pub max_user_id: u32,
    pub common_group_id: u32,
}

/// How the controller process gives up root after forking the helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPrivileges {
    /// Real, effective and saved ids are all set to the user
    #[default]
    Permanent,
    /// The saved uid stays 0 (auto-tests only)
    Regainable,
}

/// Privilege separation settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Capabilities the helper keeps, by kernel name (`CAP_SYS_ADMIN`, ...)
    pub capabilities: Vec<String>,
    /// Run the privileged operations in-process when not started as root
    pub allow_unprivileged_fallback: bool,
    pub drop_privileges: DropPrivileges,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            capabilities: vec![
                "CAP_SYS_ADMIN".to_string(),
                "CAP_CHOWN".to_string(),
                "CAP_FOWNER".to_string(),
                "CAP_DAC_OVERRIDE".to_string(),
            ],
            allow_unprivileged_fallback: false,
            drop_privileges: DropPrivileges::Permanent,
        }
    }
}

/// One configured installation location, before validation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocationConfig {
    pub id: String,
    pub installation_path: String,
    #[serde(default)]
    pub document_path: String,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Complete installer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerConfig {
    /// Root of the per-application manifest directories
    pub manifest_dir: PathBuf,
    /// Where filesystem images on removable media are mounted
    pub image_mount_dir: PathBuf,
    /// Device hardware id, substituted for `@HARDWARE-ID@` and used for
    /// hardware-bound store signatures
    pub hardware_id: String,
    pub development_mode: bool,
    pub allow_unsigned_packages: bool,
    pub security_checks: bool,
    /// Chain of trust: base64 ed25519 public keys or public key file paths
    pub trusted_keys: Vec<String>,
    pub user_id_separation: Option<UserIdSeparation>,
    pub privileges: PrivilegeConfig,
    pub locations: Vec<LocationConfig>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            manifest_dir: PathBuf::from("/opt/am/manifests"),
            image_mount_dir: PathBuf::from("/opt/am/image-mounts"),
            hardware_id: String::new(),
            development_mode: false,
            allow_unsigned_packages: false,
            security_checks: true,
            trusted_keys: Vec::new(),
            user_id_separation: None,
            privileges: PrivilegeConfig::default(),
            locations: Vec::new(),
        }
    }
}

impl InstallerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::IoError(format!(
                "Failed to read configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct ConfigFile {
            #[serde(default)]
            manifest_dir: Option<PathBuf>,
            #[serde(default)]
            image_mount_dir: Option<PathBuf>,
            #[serde(default)]
            hardware_id: String,
            #[serde(default)]
            development_mode: bool,
            #[serde(default)]
            allow_unsigned_packages: bool,
            #[serde(default = "default_true")]
            security_checks: bool,
            #[serde(default)]
            trusted_keys: Vec<String>,
            #[serde(default)]
            user_id_separation: Option<UserIdSeparation>,
            #[serde(default)]
            privileges: PrivilegeConfig,
            #[serde(default)]
            locations: Vec<LocationConfig>,
        }

        let parsed: ConfigFile = toml::from_str(content)?;
        let defaults = Self::default();

        if let Some(sep) = &parsed.user_id_separation
            && sep.min_user_id > sep.max_user_id
        {
            return Err(Error::ParseError(format!(
                "user id range is empty: {} > {}",
                sep.min_user_id, sep.max_user_id
            )));
        }

        Ok(Self {
            manifest_dir: parsed.manifest_dir.unwrap_or(defaults.manifest_dir),
            image_mount_dir: parsed.image_mount_dir.unwrap_or(defaults.image_mount_dir),
            hardware_id: parsed.hardware_id,
            development_mode: parsed.development_mode,
            allow_unsigned_packages: parsed.allow_unsigned_packages,
            security_checks: parsed.security_checks,
            trusted_keys: parsed.trusted_keys,
            user_id_separation: parsed.user_id_separation,
            privileges: parsed.privileges,
            locations: parsed.locations,
        })
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = InstallerConfig::from_toml("").unwrap();
        assert_eq!(config, InstallerConfig::default());
        assert!(config.security_checks);
        assert_eq!(config.privileges.capabilities.len(), 4);
        assert_eq!(config.privileges.drop_privileges, DropPrivileges::Permanent);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            manifest_dir = "/tmp/manifests"
            hardware_id = "0815"
            development_mode = true
            security_checks = false
            trusted_keys = ["abc"]

            [user_id_separation]
            min_user_id = 100
            max_user_id = 200
            common_group_id = 300

            [privileges]
            capabilities = ["CAP_SYS_ADMIN"]
            allow_unprivileged_fallback = true
            drop_privileges = "regainable"

            [[locations]]
            id = "internal-0"
            installation_path = "/tmp/apps"
            document_path = "/tmp/docs"
            is_default = true

            [[locations]]
            id = "removable-0"
            installation_path = "/media/sd/apps"
            mount_point = "/media/sd"
        "#;

        let config = InstallerConfig::from_toml(toml).unwrap();
        assert_eq!(config.manifest_dir, PathBuf::from("/tmp/manifests"));
        assert_eq!(config.image_mount_dir, PathBuf::from("/opt/am/image-mounts"));
        assert!(config.development_mode);
        assert!(!config.security_checks);
        assert_eq!(
            config.user_id_separation,
            Some(UserIdSeparation {
                min_user_id: 100,
                max_user_id: 200,
                common_group_id: 300
            })
        );
        assert!(config.privileges.allow_unprivileged_fallback);
        assert_eq!(config.privileges.drop_privileges, DropPrivileges::Regainable);
        assert_eq!(config.locations.len(), 2);
        assert_eq!(config.locations[1].mount_point.as_deref(), Some("/media/sd"));
    }

    #[test]
    fn test_empty_uid_range_rejected() {
        let toml = r#"
            [user_id_separation]
            min_user_id = 200
            max_user_id = 100
            common_group_id = 300
        "#;
        let err = InstallerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(InstallerConfig::from_toml("locations = 5").is_err());
    }
}
