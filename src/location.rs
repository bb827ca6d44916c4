// src/location.rs

//! Installation locations
//!
//! A location is where application content and documents live: the internal
//! flash (`internal-N`) or a removable medium (`removable-N`). Applications on
//! removable media are stored as filesystem images and are only usable while
//! the medium is mounted.

use crate::config::{InstallerConfig, LocationConfig};
use crate::error::{Error, Result};
use crate::filesystem;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Placeholder replaced with the device hardware id in configured paths
pub const HARDWARE_ID_PLACEHOLDER: &str = "@HARDWARE-ID@";

/// Kind of storage backing a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationType {
    Internal,
    Removable,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Internal => "internal",
            LocationType::Removable => "removable",
        }
    }
}

impl FromStr for LocationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(LocationType::Internal),
            "removable" => Ok(LocationType::Removable),
            other => Err(Error::ParseError(format!(
                "invalid installation location type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated installation location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationLocation {
    location_type: LocationType,
    index: u32,
    installation_path: PathBuf,
    document_path: PathBuf,
    mount_point: Option<PathBuf>,
    is_default: bool,
}

impl InstallationLocation {
    /// Build a location by hand (tests, embedders without a config file)
    pub fn new(
        location_type: LocationType,
        index: u32,
        installation_path: impl Into<PathBuf>,
        document_path: impl Into<PathBuf>,
        mount_point: Option<PathBuf>,
        is_default: bool,
    ) -> Self {
        Self {
            location_type,
            index,
            installation_path: installation_path.into(),
            document_path: document_path.into(),
            mount_point,
            is_default,
        }
    }

    /// `<type>-<index>`
    pub fn id(&self) -> String {
        format!("{}-{}", self.location_type, self.index)
    }

    pub fn location_type(&self) -> LocationType {
        self.location_type
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn installation_path(&self) -> &Path {
        &self.installation_path
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn is_removable(&self) -> bool {
        self.location_type == LocationType::Removable
    }

    /// Internal locations are always valid, removable ones need a mount point
    pub fn is_valid(&self) -> bool {
        !self.installation_path.as_os_str().is_empty()
            && (!self.is_removable() || self.mount_point.is_some())
    }

    /// Whether the location can be used right now
    pub fn is_mounted(&self) -> bool {
        match (&self.location_type, &self.mount_point) {
            (LocationType::Internal, _) => true,
            (LocationType::Removable, Some(mount_point)) => filesystem::is_mounted(mount_point),
            (LocationType::Removable, None) => false,
        }
    }

    /// Total and free bytes on the installation device
    pub fn disk_usage(&self) -> Result<filesystem::DiskUsage> {
        filesystem::disk_usage(&self.installation_path)
    }
}

/// Split `type-index` into its parts
pub fn parse_location_id(id: &str) -> Result<(LocationType, u32)> {
    let (kind, index) = id.rsplit_once('-').ok_or_else(|| {
        Error::ParseError(format!("could not parse installation location id '{}'", id))
    })?;
    let kind: LocationType = kind.parse()?;
    let index = index.parse().map_err(|_| {
        Error::ParseError(format!("could not parse installation location id '{}'", id))
    })?;
    Ok((kind, index))
}

fn substitute(path: &str, hardware_id: &str) -> PathBuf {
    PathBuf::from(path.replace(HARDWARE_ID_PLACEHOLDER, hardware_id))
}

impl InstallationLocation {
    /// Validate one configured location
    pub fn from_config(config: &LocationConfig, hardware_id: &str) -> Result<Self> {
        let (location_type, index) = parse_location_id(&config.id)?;

        let installation_path = substitute(&config.installation_path, hardware_id);
        let document_path = substitute(&config.document_path, hardware_id);
        let mount_point = config
            .mount_point
            .as_deref()
            .map(|mp| substitute(mp, hardware_id));

        if location_type == LocationType::Removable && mount_point.is_none() {
            return Err(Error::ParseError(format!(
                "removable installation location '{}' has no mount point",
                config.id
            )));
        }

        if location_type == LocationType::Internal {
            for dir in [&installation_path, &document_path] {
                if dir.as_os_str().is_empty() {
                    continue;
                }
                fs::create_dir_all(dir).map_err(|e| {
                    Error::ParseError(format!(
                        "could not create directory {} for installation location '{}': {}",
                        dir.display(),
                        config.id,
                        e
                    ))
                })?;
            }
        }

        debug!(
            "Installation location {}: {} (docs {})",
            config.id,
            installation_path.display(),
            document_path.display()
        );

        Ok(Self {
            location_type,
            index,
            installation_path,
            document_path,
            mount_point,
            is_default: config.is_default,
        })
    }
}

/// Validate all configured locations
pub fn parse_locations(config: &InstallerConfig) -> Result<Vec<InstallationLocation>> {
    let mut locations = Vec::with_capacity(config.locations.len());

    for entry in &config.locations {
        let location = InstallationLocation::from_config(entry, &config.hardware_id)?;
        if location.is_default() && locations.iter().any(InstallationLocation::is_default) {
            return Err(Error::ParseError(
                "multiple default installation locations defined".to_string(),
            ));
        }
        if locations
            .iter()
            .any(|l: &InstallationLocation| l.id() == location.id())
        {
            return Err(Error::ParseError(format!(
                "installation location '{}' defined twice",
                location.id()
            )));
        }
        locations.push(location);
    }

    Ok(locations)
}

/// Find a location by id
pub fn find_location<'a>(
    locations: &'a [InstallationLocation],
    id: &str,
) -> Option<&'a InstallationLocation> {
    locations.iter().find(|l| l.id() == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn location_config(id: &str, path: &Path, is_default: bool) -> LocationConfig {
        LocationConfig {
            id: id.to_string(),
            installation_path: path.join("apps").display().to_string(),
            document_path: path.join("docs").display().to_string(),
            mount_point: None,
            is_default,
        }
    }

    #[test]
    fn test_parse_location_id() {
        assert_eq!(
            parse_location_id("internal-0").unwrap(),
            (LocationType::Internal, 0)
        );
        assert_eq!(
            parse_location_id("removable-12").unwrap(),
            (LocationType::Removable, 12)
        );
        assert!(parse_location_id("internal").is_err());
        assert!(parse_location_id("floppy-0").is_err());
        assert!(parse_location_id("internal-x").is_err());
    }

    #[test]
    fn test_internal_location_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config = location_config("internal-0", temp_dir.path(), true);
        let location = InstallationLocation::from_config(&config, "").unwrap();

        assert_eq!(location.id(), "internal-0");
        assert!(location.is_default());
        assert!(location.is_valid());
        assert!(location.is_mounted());
        assert!(temp_dir.path().join("apps").is_dir());
        assert!(temp_dir.path().join("docs").is_dir());
    }

    #[test]
    fn test_hardware_id_substitution() {
        let temp_dir = TempDir::new().unwrap();
        let config = LocationConfig {
            id: "internal-1".to_string(),
            installation_path: format!("{}/@HARDWARE-ID@/apps", temp_dir.path().display()),
            document_path: String::new(),
            mount_point: None,
            is_default: false,
        };
        let location = InstallationLocation::from_config(&config, "0815").unwrap();
        assert_eq!(
            location.installation_path(),
            temp_dir.path().join("0815/apps")
        );
    }

    #[test]
    fn test_multiple_defaults_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = InstallerConfig {
            locations: vec![
                location_config("internal-0", temp_dir.path(), true),
                location_config("internal-1", temp_dir.path(), true),
            ],
            ..Default::default()
        };
        let err = parse_locations(&config).unwrap_err();
        assert_eq!(
            err,
            Error::ParseError("multiple default installation locations defined".to_string())
        );
    }

    #[test]
    fn test_removable_needs_mount_point() {
        let temp_dir = TempDir::new().unwrap();
        let config = location_config("removable-0", temp_dir.path(), false);
        assert!(InstallationLocation::from_config(&config, "").is_err());
    }

    #[test]
    fn test_unmounted_removable_location() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = location_config("removable-0", temp_dir.path(), false);
        config.mount_point = Some(temp_dir.path().join("medium").display().to_string());
        let location = InstallationLocation::from_config(&config, "").unwrap();

        assert!(location.is_removable());
        assert!(location.is_valid());
        assert!(!location.is_mounted());
        // Nothing is created on a removable medium at load time
        assert!(!temp_dir.path().join("apps").exists());
    }

    #[test]
    fn test_find_location() {
        let temp_dir = TempDir::new().unwrap();
        let config = InstallerConfig {
            locations: vec![
                location_config("internal-0", temp_dir.path(), true),
                location_config("internal-1", &temp_dir.path().join("second"), false),
            ],
            ..Default::default()
        };
        let locations = parse_locations(&config).unwrap();
        assert_eq!(find_location(&locations, "internal-1").unwrap().index(), 1);
        assert!(find_location(&locations, "removable-0").is_none());
    }
}
