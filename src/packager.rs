// src/packager.rs

//! Package creation
//!
//! Writes the archive format read by [`crate::extractor`]: header, content in
//! the order of the report's file list, and footers with the digest and the
//! optional developer and store signatures.

use crate::error::{Error, Result};
use crate::extractor::{
    canonical_json, FOOTER_FORMAT, HEADER_FORMAT, METADATA_FORMAT_VERSION, PACKAGE_FOOTER_PREFIX,
    PACKAGE_HEADER_NAME,
};
use crate::manifest::{is_valid_dns_name, ApplicationManifest, MANIFEST_FILE_NAME};
use crate::report::InstallationReport;
use crate::signature::{hardware_bound_digest, SigningKeyPair};
use crate::yaml;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Block size used to estimate the disk space of a package
const BLOCK_SIZE: u64 = 4096;

/// Feeds everything read through it into a digest
struct HashingReader<'a, R> {
    inner: R,
    digest: &'a mut Sha256,
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// Creates a package from a directory
pub struct PackageCreator {
    source_dir: PathBuf,
    output: PathBuf,
    report: InstallationReport,
    developer_key: Option<SigningKeyPair>,
    store_key: Option<(SigningKeyPair, Option<String>)>,
}

impl PackageCreator {
    /// Package the files listed in `report`, relative to `source_dir`
    ///
    /// A digest already set in the report must match the created package.
    pub fn new(source_dir: impl Into<PathBuf>, output: impl Into<PathBuf>, report: InstallationReport) -> Self {
        Self {
            source_dir: source_dir.into(),
            output: output.into(),
            report,
            developer_key: None,
            store_key: None,
        }
    }

    /// Sign the package digest as its developer
    pub fn with_developer_key(mut self, key: SigningKeyPair) -> Self {
        self.developer_key = Some(key);
        self
    }

    /// Sign the package digest as the store, optionally bound to one device
    pub fn with_store_key(mut self, key: SigningKeyPair, hardware_id: Option<String>) -> Self {
        self.store_key = Some((key, hardware_id));
        self
    }

    /// The report, completed with digest and signatures after [`create`](Self::create)
    pub fn report(&self) -> &InstallationReport {
        &self.report
    }

    /// Write the package
    pub fn create(&mut self) -> Result<()> {
        if !is_valid_dns_name(self.report.package_id()) {
            return Err(Error::PackageError(format!(
                "invalid package id '{}'",
                self.report.package_id()
            )));
        }
        if self.report.files().is_empty() {
            return Err(Error::PackageError("package has no files".to_string()));
        }
        if self.report.disk_space_used() == 0 {
            let estimate = self.estimate_disk_space()?;
            self.report.set_disk_space_used(estimate);
        }

        info!(
            "Creating package {} from {}",
            self.output.display(),
            self.source_dir.display()
        );

        let file = File::create(&self.output).map_err(|e| {
            Error::IoError(format!("could not create {}: {}", self.output.display(), e))
        })?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let mut digest = Sha256::new();

        self.write_header(&mut builder, &mut digest)?;
        for name in self.report.files().to_vec() {
            self.write_entry(&mut builder, &name, &mut digest)?;
        }

        let computed = digest.finalize().to_vec();
        if !self.report.digest().is_empty() && self.report.digest() != computed.as_slice() {
            return Err(Error::PackageError(format!(
                "package digest mismatch: expected {}, created {}",
                hex::encode(self.report.digest()),
                hex::encode(&computed)
            )));
        }
        self.report.set_digest(computed);
        self.sign()?;
        self.write_footers(&mut builder)?;

        builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| Error::IoError(format!("could not finish {}: {}", self.output.display(), e)))?;

        debug!("Package digest {}", hex::encode(self.report.digest()));
        Ok(())
    }

    fn estimate_disk_space(&self) -> Result<u64> {
        let mut total = 0;
        for name in self.report.files() {
            let path = self.source_dir.join(name);
            let meta = fs::symlink_metadata(&path).map_err(|e| {
                Error::IoError(format!("could not stat {}: {}", path.display(), e))
            })?;
            total += meta.len().div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE;
        }
        Ok(total)
    }

    fn sign(&mut self) -> Result<()> {
        let digest = self.report.digest().to_vec();

        if let Some(key) = &self.developer_key {
            let signature = key.sign(&digest).to_bytes()?;
            self.report.set_developer_signature(signature);
        }
        if let Some((key, hardware_id)) = &self.store_key {
            let signed = match hardware_id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => hardware_bound_digest(id, &digest)?,
                None => digest,
            };
            let signature = key.sign(&signed).to_bytes()?;
            self.report.set_store_signature(signature);
        }
        Ok(())
    }

    fn write_header<W: io::Write>(&self, builder: &mut Builder<W>, digest: &mut Sha256) -> Result<()> {
        let mut meta = Mapping::new();
        meta.insert("packageId".into(), self.report.package_id().into());
        meta.insert("diskSpaceUsed".into(), self.report.disk_space_used().into());
        if !self.report.extra_meta_data().is_empty() {
            meta.insert(
                "extra".into(),
                Value::Mapping(self.report.extra_meta_data().clone()),
            );
        }
        let extra_signed = self.report.extra_signed_meta_data();
        if !extra_signed.is_empty() {
            meta.insert("extraSigned".into(), Value::Mapping(extra_signed.clone()));
            digest.update(canonical_json(extra_signed)?);
        }

        let text = yaml::to_documents(&[
            yaml::format_header(HEADER_FORMAT, METADATA_FORMAT_VERSION),
            Value::Mapping(meta),
        ])?;
        append_metadata(builder, PACKAGE_HEADER_NAME, text.as_bytes())
    }

    fn write_entry<W: io::Write>(
        &self,
        builder: &mut Builder<W>,
        name: &str,
        digest: &mut Sha256,
    ) -> Result<()> {
        let path = self.source_dir.join(name);
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| Error::IoError(format!("could not stat {}: {}", path.display(), e)))?;

        let mut header = Header::new_ustar();
        header.set_mtime(0);
        if meta.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, format!("{}/", name), io::empty())
                .map_err(|e| write_error(&self.output, e))?;
            digest.update(format!("D/0/{}", name).as_bytes());
        } else if meta.is_file() {
            let executable = meta.permissions().mode() & 0o100 != 0;
            header.set_entry_type(EntryType::Regular);
            header.set_mode(if executable { 0o755 } else { 0o644 });
            header.set_size(meta.len());
            let file = File::open(&path)
                .map_err(|e| Error::IoError(format!("could not open {}: {}", path.display(), e)))?;
            let reader = HashingReader {
                inner: file,
                digest: &mut *digest,
            };
            builder
                .append_data(&mut header, name, reader)
                .map_err(|e| write_error(&self.output, e))?;
            digest.update(format!("F/{}/{}", meta.len(), name).as_bytes());
        } else {
            return Err(Error::PackageError(format!(
                "only files and directories can be packaged: {}",
                name
            )));
        }
        Ok(())
    }

    fn write_footers<W: io::Write>(&self, builder: &mut Builder<W>) -> Result<()> {
        let mut footer = Mapping::new();
        footer.insert("digest".into(), hex::encode(self.report.digest()).into());
        let text = yaml::to_documents(&[
            yaml::format_header(FOOTER_FORMAT, METADATA_FORMAT_VERSION),
            Value::Mapping(footer),
        ])?;
        append_metadata(builder, PACKAGE_FOOTER_PREFIX, text.as_bytes())?;

        let signatures = [
            ("developerSignature", "developer", self.report.developer_signature()),
            ("storeSignature", "store", self.report.store_signature()),
        ];
        for (key, suffix, signature) in signatures {
            if signature.is_empty() {
                continue;
            }
            let mut map = Mapping::new();
            map.insert(key.into(), BASE64.encode(signature).into());
            let text = yaml::to_documents(&[Value::Mapping(map)])?;
            append_metadata(
                builder,
                &format!("{}{}", PACKAGE_FOOTER_PREFIX, suffix),
                text.as_bytes(),
            )?;
        }
        Ok(())
    }
}

/// List the contents of an application directory in package order
///
/// `info.yaml` comes first and the icon it names second, as the installer
/// requires. Everything else follows sorted by path.
pub fn collect_package_files(source_dir: &Path) -> Result<Vec<String>> {
    let manifest = ApplicationManifest::from_file(&source_dir.join(MANIFEST_FILE_NAME))?;
    if manifest.icon.is_empty() || !source_dir.join(&manifest.icon).is_file() {
        return Err(Error::PackageError(format!(
            "the icon '{}' named in {} is missing",
            manifest.icon, MANIFEST_FILE_NAME
        )));
    }

    let mut files = vec![MANIFEST_FILE_NAME.to_string(), manifest.icon.clone()];
    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(format!("could not scan {}: {}", source_dir.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| Error::IoError(e.to_string()))?
            .to_str()
            .ok_or_else(|| {
                Error::PackageError(format!("file name is not valid UTF-8: {}", entry.path().display()))
            })?
            .to_string();
        if relative != MANIFEST_FILE_NAME && relative != manifest.icon {
            files.push(relative);
        }
    }
    Ok(files)
}

fn append_metadata<W: io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_size(data.len() as u64);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::IoError(format!("could not write {}: {}", name, e)))
}

fn write_error(output: &Path, e: io::Error) -> Error {
    Error::IoError(format!("could not write {}: {}", output.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{PackageExtractor, PackageSource};
    use crate::signature::{verify_signature, ChainOfTrust};
    use tempfile::TempDir;

    fn source_tree(dir: &Path) -> InstallationReport {
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("info.yaml"), b"manifest").unwrap();
        fs::write(dir.join("lib/run.sh"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(dir.join("lib/run.sh"), fs::Permissions::from_mode(0o755)).unwrap();

        let mut report = InstallationReport::new("com.example.packaged");
        report.add_files(["info.yaml", "lib", "lib/run.sh"]);
        let mut extra = Mapping::new();
        extra.insert("channel".into(), "beta".into());
        report.set_extra_signed_meta_data(extra);
        report
    }

    #[test]
    fn test_create_and_extract() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let report = source_tree(&src);
        let package = temp_dir.path().join("out.appkg");

        let developer = SigningKeyPair::generate();
        let chain = ChainOfTrust::new(vec![developer.public_key_base64()]);
        let mut creator = PackageCreator::new(&src, &package, report).with_developer_key(developer);
        creator.create().unwrap();
        assert!(creator.report().disk_space_used() > 0);

        let dest = temp_dir.path().join("dest");
        fs::create_dir(&dest).unwrap();
        let mut extractor = PackageExtractor::new(PackageSource::File(package), &dest);
        extractor.extract(|_, _| Ok(())).unwrap();

        let extracted = extractor.installation_report();
        assert_eq!(extracted.package_id(), "com.example.packaged");
        assert_eq!(extracted.digest(), creator.report().digest());
        assert_eq!(extracted.files(), creator.report().files());
        assert_eq!(
            extracted.extra_signed_meta_data(),
            creator.report().extra_signed_meta_data()
        );
        assert!(extracted.store_signature().is_empty());
        verify_signature(extracted.digest(), extracted.developer_signature(), &chain).unwrap();

        let mode = fs::metadata(dest.join("lib/run.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0);
    }

    #[test]
    fn test_preset_digest_must_match() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let mut report = source_tree(&src);
        report.set_digest(vec![0u8; 32]);

        let mut creator = PackageCreator::new(&src, temp_dir.path().join("out.appkg"), report);
        let err = creator.create().unwrap_err();
        assert!(matches!(err, Error::PackageError(_)));
        assert!(err.message().contains("digest mismatch"));
    }

    #[test]
    fn test_hardware_bound_store_signature() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let report = source_tree(&src);
        let store = SigningKeyPair::generate();
        let chain = ChainOfTrust::new(vec![store.public_key_base64()]);

        let mut creator = PackageCreator::new(&src, temp_dir.path().join("out.appkg"), report)
            .with_store_key(store, Some("0815".to_string()));
        creator.create().unwrap();

        let report = creator.report();
        assert!(verify_signature(report.digest(), report.store_signature(), &chain).is_err());
        let bound = hardware_bound_digest("0815", report.digest()).unwrap();
        assert!(verify_signature(&bound, report.store_signature(), &chain).is_ok());
    }

    #[test]
    fn test_collect_package_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let manifest = ApplicationManifest {
            id: "com.example.collect".to_string(),
            icon: "z-icon.png".to_string(),
            ..Default::default()
        };
        fs::write(dir.join(MANIFEST_FILE_NAME), manifest.to_yaml().unwrap()).unwrap();
        fs::write(dir.join("z-icon.png"), b"png").unwrap();
        fs::create_dir(dir.join("a")).unwrap();
        fs::write(dir.join("a/main.qml"), b"").unwrap();

        let files = collect_package_files(dir).unwrap();
        assert_eq!(files, vec!["info.yaml", "z-icon.png", "a", "a/main.qml"]);

        fs::remove_file(dir.join("z-icon.png")).unwrap();
        assert!(collect_package_files(dir).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut report = InstallationReport::new("com.example.packaged");
        report.add_file("missing");
        let mut creator =
            PackageCreator::new(temp_dir.path(), temp_dir.path().join("out.appkg"), report);
        assert!(creator.create().is_err());
    }

    #[test]
    fn test_invalid_id_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut report = InstallationReport::new("nope");
        report.add_file("x");
        let mut creator =
            PackageCreator::new(temp_dir.path(), temp_dir.path().join("out.appkg"), report);
        assert!(matches!(creator.create(), Err(Error::PackageError(_))));
    }
}
