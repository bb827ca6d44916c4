// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use appman_installer::config::{InstallerConfig, LocationConfig};
use appman_installer::signature::SigningKeyPair;
use appman_installer::sudo::SudoClient;
use appman_installer::{
    InstallationReport, InstallerContext, InstallerEvent, MemoryRegistry, PackageCreator,
    PackageInstaller, spawn_registry,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tempfile::TempDir;

pub const APP_ID: &str = "com.example.test";

/// A device root with one internal location
pub struct TestRoot {
    pub temp_dir: TempDir,
}

impl TestRoot {
    pub fn new() -> Self {
        Self {
            temp_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn manifests(&self) -> PathBuf {
        self.path().join("manifests")
    }

    pub fn apps(&self) -> PathBuf {
        self.path().join("apps")
    }

    pub fn docs(&self) -> PathBuf {
        self.path().join("docs")
    }

    /// Configuration accepting unsigned packages
    pub fn config(&self) -> InstallerConfig {
        InstallerConfig {
            manifest_dir: self.manifests(),
            image_mount_dir: self.path().join("image-mounts"),
            allow_unsigned_packages: true,
            locations: vec![LocationConfig {
                id: "internal-0".to_string(),
                installation_path: self.apps().display().to_string(),
                document_path: self.docs().display().to_string(),
                mount_point: None,
                is_default: true,
            }],
            ..Default::default()
        }
    }

    /// Configuration that only accepts packages signed by `keys`
    pub fn signed_config(&self, keys: &[&SigningKeyPair]) -> InstallerConfig {
        InstallerConfig {
            allow_unsigned_packages: false,
            trusted_keys: keys.iter().map(|k| k.public_key_base64()).collect(),
            ..self.config()
        }
    }
}

/// Installer running the privileged operations in-process
pub fn installer(config: InstallerConfig) -> PackageInstaller {
    let registry = spawn_registry(MemoryRegistry::new()).unwrap();
    let context =
        InstallerContext::new(config, registry, Arc::new(SudoClient::fallback())).unwrap();
    PackageInstaller::new(Arc::new(context)).unwrap()
}

pub fn manifest_yaml(id: &str, version: &str) -> String {
    format!(
        "formatType: am-application\nformatVersion: 1\n---\nid: {}\nicon: icon.png\ncode: main.qml\nruntime: qml\nversion: '{}'\nname:\n  en: Test\n",
        id, version
    )
}

/// Application source directory with manifest, icon and code
pub fn write_app_dir(dir: &Path, id: &str, version: &str, code: &str) {
    fs::create_dir_all(dir.join("images")).unwrap();
    fs::write(dir.join("info.yaml"), manifest_yaml(id, version)).unwrap();
    fs::write(dir.join("icon.png"), b"\x89PNG").unwrap();
    fs::write(dir.join("main.qml"), code).unwrap();
    fs::write(dir.join("images/background.png"), b"background").unwrap();
}

/// Build a package from an application directory
pub fn build_package(
    dir: &Path,
    output: &Path,
    id: &str,
    configure: impl FnOnce(PackageCreator) -> PackageCreator,
) -> InstallationReport {
    let mut report = InstallationReport::new(id);
    report.add_files(appman_installer::packager::collect_package_files(dir).unwrap());
    let mut creator = configure(PackageCreator::new(dir, output, report));
    creator.create().unwrap();
    creator.report().clone()
}

/// Build an unsigned package of `APP_ID` in `version`
pub fn unsigned_package(root: &TestRoot, version: &str, code: &str) -> PathBuf {
    let dir = root.path().join(format!("src-{}", version));
    write_app_dir(&dir, APP_ID, version, code);
    let output = root.path().join(format!("test-{}.appkg", version));
    build_package(&dir, &output, APP_ID, |c| c);
    output
}

/// Copy a package entry by entry, letting `edit` change an entry's data
pub fn rewrite_package(input: &Path, output: &Path, mut edit: impl FnMut(&str, &mut Vec<u8>)) {
    use flate2::Compression;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use std::io::Read;

    let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(input).unwrap()));
    let file = fs::File::create(output).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        edit(&name, &mut data);

        // The original header keeps the raw name, including a directory's `/`
        let mut header = entry.header().clone();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Wait for the end of a task, acknowledging it if `accept` is set and
/// canceling it otherwise
///
/// Returns the final event.
pub fn drive_task(
    installer: &PackageInstaller,
    events: &Receiver<InstallerEvent>,
    task_id: &str,
    accept: bool,
) -> InstallerEvent {
    loop {
        let event = events.recv_timeout(Duration::from_secs(30)).unwrap();
        if event.task_id() != task_id {
            continue;
        }
        match event {
            InstallerEvent::BlockingUntilAcknowledge { .. } => {
                if accept {
                    assert!(installer.acknowledge_package_installation(task_id));
                } else {
                    assert!(installer.cancel_task(task_id));
                }
            }
            InstallerEvent::Finished { .. } | InstallerEvent::Failed { .. } => return event,
            _ => {}
        }
    }
}

/// Wait until the queue is empty so task states are final
pub fn wait_idle(installer: &PackageInstaller) {
    for _ in 0..500 {
        if installer.active_task_ids().is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("installer did not become idle");
}

/// Names in a directory, sorted
pub fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
