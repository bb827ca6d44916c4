// src/lib.rs

//! Application package installer
//!
//! Installation transaction engine of an automotive application manager.
//! It turns an untrusted, possibly remote package archive into a verified,
//! atomically visible installation, or leaves the system unchanged.
//!
//! # Architecture
//!
//! - Privilege separation: a forked helper keeps a few capabilities and
//!   performs seven privileged operations for the unprivileged controller
//! - Streaming extraction: packages are gzip tar archives whose SHA-256
//!   digest is computed while they are unpacked
//! - Chain of trust: store and developer signatures over the digest
//! - Atomic switch: staged `<id>+` directories are renamed into place, the
//!   previous version is kept as `<id>-` until the switch is complete
//! - Task queue: one task at a time, acknowledged by the user before commit

pub mod config;
mod error;
pub mod extractor;
pub mod filesystem;
pub mod installer;
pub mod location;
pub mod lock;
pub mod manifest;
pub mod packager;
pub mod registry;
pub mod report;
pub mod scope;
pub mod signature;
pub mod sudo;
pub mod task;
pub mod yaml;

pub use config::InstallerConfig;
pub use error::{Error, ErrorKind, Result};
pub use extractor::{PackageExtractor, PackageSource};
pub use installer::PackageInstaller;
pub use location::{InstallationLocation, LocationType};
pub use manifest::ApplicationManifest;
pub use packager::PackageCreator;
pub use registry::{
    spawn_registry, ApplicationDescriptor, ApplicationRegistry, InstallState, MemoryRegistry,
    RegistryHandle,
};
pub use report::InstallationReport;
pub use task::{InstallerContext, InstallerEvent, TaskState};
