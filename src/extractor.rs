// src/extractor.rs

//! Streaming package extraction
//!
//! A package is a gzip-compressed tar archive:
//!
//! ```text
//! --PACKAGE-HEADER--        YAML: format header + packageId, diskSpaceUsed, extra, extraSigned
//! info.yaml                 application content, in any order the packager chose
//! icon.png
//! ...
//! --PACKAGE-FOOTER--        YAML: format header + digest
//! --PACKAGE-FOOTER--dev     YAML: developerSignature (optional)
//! --PACKAGE-FOOTER--store   YAML: storeSignature (optional)
//! ```
//!
//! The archive is read exactly once, from a local file or an http(s)
//! stream, and written to disk as it is read. While streaming, a SHA-256
//! digest over all content, entry names and the signed header metadata is
//! computed and finally checked against the digest in the footer.
//!
//! Entries are untrusted: only regular files and directories are accepted,
//! every entry's parent must already exist, and the resolved parent must lie
//! inside the current destination directory.

use crate::error::{Error, Result};
use crate::manifest::is_valid_dns_name;
use crate::report::InstallationReport;
use crate::yaml;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::read::GzDecoder;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tar::{Archive, EntryType};
use tracing::{debug, info};
use url::Url;

/// Name of the first archive entry
pub const PACKAGE_HEADER_NAME: &str = "--PACKAGE-HEADER--";
/// Prefix of the trailing archive entries
pub const PACKAGE_FOOTER_PREFIX: &str = "--PACKAGE-FOOTER--";

pub(crate) const HEADER_FORMAT: &str = "am-package-header";
pub(crate) const FOOTER_FORMAT: &str = "am-package-footer";
pub(crate) const METADATA_FORMAT_VERSION: u64 = 1;

/// Header and footer entries larger than this are rejected
const MAX_METADATA_SIZE: u64 = 1024 * 1024;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Where a package is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    File(PathBuf),
    Http(Url),
}

impl PackageSource {
    /// Parse a plain path, a `file://` url or an `http(s)://` url
    pub fn parse(source: &str) -> Result<Self> {
        if !source.contains("://") {
            return Ok(PackageSource::File(PathBuf::from(source)));
        }

        let url = Url::parse(source)
            .map_err(|e| Error::ParseError(format!("invalid package url '{}': {}", source, e)))?;
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(PackageSource::File)
                .map_err(|_| Error::ParseError(format!("invalid file url '{}'", source))),
            "http" | "https" => Ok(PackageSource::Http(url)),
            scheme => Err(Error::ParseError(format!(
                "unsupported package url scheme '{}'",
                scheme
            ))),
        }
    }

    /// Open the source, returning the stream and its size if known
    fn open(&self) -> Result<(Box<dyn Read + Send>, Option<u64>)> {
        match self {
            PackageSource::File(path) => {
                let file = File::open(path).map_err(|e| {
                    Error::IoError(format!("could not open package {}: {}", path.display(), e))
                })?;
                let size = file.metadata().ok().map(|m| m.len());
                Ok((Box::new(file), size))
            }
            PackageSource::Http(url) => {
                let response = reqwest::blocking::get(url.clone())?
                    .error_for_status()
                    .map_err(|e| Error::NetworkError(format!("could not download {}: {}", url, e)))?;
                let size = response.content_length();
                Ok((Box::new(response), size))
            }
        }
    }
}

impl std::fmt::Display for PackageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageSource::File(path) => write!(f, "{}", path.display()),
            PackageSource::Http(url) => write!(f, "{}", url),
        }
    }
}

/// Reader that counts consumed bytes and aborts once cancelled
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(io::Error::other("package extraction was cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Handle given to the per-entry callback
pub struct ExtractionControl {
    destination: PathBuf,
    report: InstallationReport,
    stop_notifications: bool,
}

impl ExtractionControl {
    /// Directory the following entries are extracted into
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Extract all following entries into `destination` instead
    pub fn set_destination(&mut self, destination: PathBuf) {
        debug!("Redirecting extraction to {}", destination.display());
        self.destination = destination;
    }

    /// The report built so far. The header has been parsed at this point.
    pub fn report(&self) -> &InstallationReport {
        &self.report
    }

    /// Do not call the callback for any further entries
    pub fn stop_notifications(&mut self) {
        self.stop_notifications = true;
    }
}

/// Extracts one package
pub struct PackageExtractor {
    source: PackageSource,
    destination: PathBuf,
    cancel: Arc<AtomicBool>,
    progress: Option<Box<dyn FnMut(f64) + Send>>,
    report: InstallationReport,
}

impl PackageExtractor {
    pub fn new(source: PackageSource, destination: impl Into<PathBuf>) -> Self {
        Self {
            source,
            destination: destination.into(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
            report: InstallationReport::default(),
        }
    }

    /// Share a cancellation flag with the owner of the extraction
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive progress fractions in [0, 1]
    pub fn on_progress(mut self, progress: Box<dyn FnMut(f64) + Send>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }

    /// Request cancellation; the running extraction stops at its next read
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// The report of a finished extraction
    pub fn installation_report(&self) -> &InstallationReport {
        &self.report
    }

    /// Extract the package, calling `callback` for every file and directory
    /// in archive order
    pub fn extract<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&str, &mut ExtractionControl) -> Result<()>,
    {
        info!("Extracting package {}", self.source);
        let result = self.extract_stream(&mut callback);

        if self.was_cancelled() {
            return Err(Error::Cancelled("package extraction was cancelled".to_string()));
        }
        result
    }

    fn extract_stream(
        &mut self,
        callback: &mut dyn FnMut(&str, &mut ExtractionControl) -> Result<()>,
    ) -> Result<()> {
        let (stream, total_size) = self.source.open()?;
        let consumed = Arc::new(AtomicU64::new(0));
        let reader = CountingReader {
            inner: stream,
            consumed: Arc::clone(&consumed),
            cancel: Arc::clone(&self.cancel),
        };
        let mut archive = Archive::new(GzDecoder::new(BufReader::new(reader)));

        let mut progress = ProgressTracker {
            callback: self.progress.as_mut(),
            consumed,
            total: total_size,
            last: 0.0,
        };
        progress.report(0.0);

        let mut control = ExtractionControl {
            destination: self.destination.clone(),
            report: InstallationReport::default(),
            stop_notifications: false,
        };
        let mut digest = Sha256::new();
        let mut footer = Vec::new();
        let mut seen_header = false;
        let mut seen_footer = false;

        let entries = archive.entries().map_err(archive_error)?;
        for (index, entry) in entries.enumerate() {
            let mut entry = entry.map_err(archive_error)?;
            let name = String::from_utf8(entry.path_bytes().into_owned()).map_err(|_| {
                Error::PackageError("file name in the archive is not valid UTF-8".to_string())
            })?;

            if name == PACKAGE_HEADER_NAME {
                if index != 0 {
                    return Err(Error::PackageError(format!(
                        "found a second {} entry in the archive",
                        PACKAGE_HEADER_NAME
                    )));
                }
                let data = read_metadata(&mut entry, &name)?;
                parse_header(&data, &mut control.report, &mut digest)?;
                seen_header = true;
                continue;
            }

            if index == 0 {
                return Err(Error::PackageError(format!(
                    "the first file in the package is not {}, but {}",
                    PACKAGE_HEADER_NAME, name
                )));
            }

            if name.starts_with(PACKAGE_FOOTER_PREFIX) {
                let data = read_metadata(&mut entry, &name)?;
                if !footer.is_empty() && !footer.ends_with(b"\n") {
                    footer.push(b'\n');
                }
                footer.extend_from_slice(&data);
                seen_footer = true;
                continue;
            }

            if name.starts_with("--") {
                return Err(Error::PackageError(format!(
                    "file names starting with -- are reserved by the packaging format: {}",
                    name
                )));
            }
            if seen_footer {
                return Err(Error::PackageError(format!(
                    "only {}* entries may follow the first footer, found {}",
                    PACKAGE_FOOTER_PREFIX, name
                )));
            }

            let entry_type = entry.header().entry_type();
            let (is_dir, relative) = match entry_type {
                EntryType::Regular => (false, name.clone()),
                EntryType::Directory => match name.strip_suffix('/') {
                    Some(dir) => (true, dir.to_string()),
                    None => {
                        return Err(Error::PackageError(format!(
                            "directory {} in the archive does not end with a slash",
                            name
                        )));
                    }
                },
                other => {
                    return Err(Error::PackageError(format!(
                        "file {} in the archive has the unsupported type {:?}",
                        name, other
                    )));
                }
            };
            check_relative_path(&relative)?;

            let target = resolve_target(control.destination(), &relative)?;
            let size = if is_dir {
                if relative != "." {
                    create_directory(&target)?;
                }
                0
            } else {
                let executable = entry.header().mode().map(|m| m & 0o100 != 0).unwrap_or(false);
                write_file(&mut entry, &target, executable, &mut digest, &mut progress)?
            };

            let kind = if is_dir { 'D' } else { 'F' };
            digest.update(format!("{}/{}/{}", kind, size, relative).as_bytes());
            control.report.add_file(&relative);

            if !control.stop_notifications {
                callback(&relative, &mut control)?;
            }
            progress.update();
        }

        if !seen_header {
            return Err(Error::PackageError(format!(
                "package has no {} entry",
                PACKAGE_HEADER_NAME
            )));
        }
        if !seen_footer {
            return Err(Error::PackageError(format!(
                "package has no {} entry",
                PACKAGE_FOOTER_PREFIX
            )));
        }

        let computed = digest.finalize().to_vec();
        parse_footer(&footer, &computed, &mut control.report)?;
        control.report.set_digest(computed);

        progress.report(1.0);
        self.report = control.report;
        self.destination = control.destination;
        Ok(())
    }
}

struct ProgressTracker<'a> {
    callback: Option<&'a mut Box<dyn FnMut(f64) + Send>>,
    consumed: Arc<AtomicU64>,
    total: Option<u64>,
    last: f64,
}

impl ProgressTracker<'_> {
    fn report(&mut self, fraction: f64) {
        if let Some(callback) = self.callback.as_mut() {
            callback(fraction.clamp(0.0, 1.0));
        }
        self.last = fraction;
    }

    /// Report the fraction of the source consumed, in 1% steps
    fn update(&mut self) {
        let Some(total) = self.total.filter(|t| *t > 0) else {
            return;
        };
        let fraction = (self.consumed.load(Ordering::Relaxed) as f64 / total as f64).min(1.0);
        if fraction - self.last >= 0.01 {
            self.report(fraction);
        }
    }
}

fn archive_error(e: io::Error) -> Error {
    Error::ArchiveError(format!("could not read package archive: {}", e))
}

fn read_metadata<R: Read>(entry: &mut tar::Entry<'_, R>, name: &str) -> Result<Vec<u8>> {
    let size = entry.header().size().map_err(archive_error)?;
    if size > MAX_METADATA_SIZE {
        return Err(Error::PackageError(format!(
            "{} is larger than {} bytes",
            name, MAX_METADATA_SIZE
        )));
    }
    let mut data = Vec::with_capacity(size as usize);
    entry.read_to_end(&mut data).map_err(archive_error)?;
    Ok(data)
}

/// Canonical JSON encoding (sorted keys, no whitespace) of a metadata map
pub(crate) fn canonical_json(map: &Mapping) -> Result<Vec<u8>> {
    let value = serde_json::to_value(map)
        .map_err(|e| Error::PackageError(format!("extraSigned metadata is not JSON compatible: {}", e)))?;
    serde_json::to_vec(&value)
        .map_err(|e| Error::PackageError(format!("could not encode extraSigned metadata: {}", e)))
}

fn parse_header(data: &[u8], report: &mut InstallationReport, digest: &mut Sha256) -> Result<()> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::PackageError("package header is not UTF-8".to_string()))?;
    let documents = yaml::parse_documents(text)
        .map_err(|e| Error::PackageError(format!("invalid package header: {}", e.message())))?;
    if documents.len() != 2 {
        return Err(Error::PackageError(format!(
            "package header must consist of 2 YAML documents, got {}",
            documents.len()
        )));
    }
    yaml::check_format_header(&documents[0], HEADER_FORMAT, METADATA_FORMAT_VERSION)
        .map_err(|e| Error::PackageError(e.message().to_string()))?;

    let meta = &documents[1];
    let package_id = yaml::string_field(meta, "packageId")
        .or_else(|| yaml::string_field(meta, "applicationId"))
        .unwrap_or_default();
    if !is_valid_dns_name(&package_id) {
        return Err(Error::PackageError(format!(
            "package header has an invalid packageId: '{}'",
            package_id
        )));
    }

    let disk_space_used = meta.get("diskSpaceUsed").and_then(Value::as_u64).unwrap_or(0);
    if disk_space_used == 0 {
        return Err(Error::PackageError(
            "package header has an invalid diskSpaceUsed field".to_string(),
        ));
    }

    let extra = yaml::mapping_field(meta, "extra")
        .map_err(|e| Error::PackageError(e.message().to_string()))?;
    let extra_signed = yaml::mapping_field(meta, "extraSigned")
        .map_err(|e| Error::PackageError(e.message().to_string()))?;
    if !extra_signed.is_empty() {
        digest.update(canonical_json(&extra_signed)?);
    }

    report.set_package_id(&package_id);
    report.set_disk_space_used(disk_space_used);
    report.set_extra_meta_data(extra);
    report.set_extra_signed_meta_data(extra_signed);
    Ok(())
}

fn parse_footer(data: &[u8], computed: &[u8], report: &mut InstallationReport) -> Result<()> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::PackageError("package footer is not UTF-8".to_string()))?;
    let documents = yaml::parse_documents(text)
        .map_err(|e| Error::PackageError(format!("invalid package footer: {}", e.message())))?;
    let Some((header, maps)) = documents.split_first() else {
        return Err(Error::PackageError("package footer is empty".to_string()));
    };
    yaml::check_format_header(header, FOOTER_FORMAT, METADATA_FORMAT_VERSION)
        .map_err(|e| Error::PackageError(e.message().to_string()))?;

    let mut merged = Mapping::new();
    for map in maps {
        match map {
            Value::Mapping(map) => merged.extend(map.clone()),
            Value::Null => {}
            _ => {
                return Err(Error::PackageError(
                    "package footer documents must be maps".to_string(),
                ));
            }
        }
    }
    let merged = Value::Mapping(merged);

    let digest = yaml::string_field(&merged, "digest")
        .ok_or_else(|| Error::PackageError("package footer has no digest".to_string()))
        .and_then(|d| {
            hex::decode(d)
                .map_err(|e| Error::PackageError(format!("invalid digest in package footer: {}", e)))
        })?;
    if digest != computed {
        return Err(Error::PackageError("package digest mismatch".to_string()));
    }

    for (key, is_store) in [("developerSignature", false), ("storeSignature", true)] {
        if let Some(encoded) = yaml::string_field(&merged, key) {
            let signature = BASE64.decode(encoded).map_err(|e| {
                Error::PackageError(format!("invalid {} in package footer: {}", key, e))
            })?;
            if is_store {
                report.set_store_signature(signature);
            } else {
                report.set_developer_signature(signature);
            }
        }
    }
    Ok(())
}

fn check_relative_path(relative: &str) -> Result<()> {
    let path = Path::new(relative);
    let valid = !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !valid {
        return Err(Error::PackageError(format!(
            "invalid file name in the archive: {}",
            relative
        )));
    }
    Ok(())
}

/// Resolve an entry below `destination`, checking that its parent exists and
/// does not escape the destination
fn resolve_target(destination: &Path, relative: &str) -> Result<PathBuf> {
    let target = destination.join(relative);
    let parent = target.parent().unwrap_or(destination);

    let canonical_destination = destination.canonicalize().map_err(|e| {
        Error::IoError(format!(
            "extraction directory {} is not accessible: {}",
            destination.display(),
            e
        ))
    })?;
    let canonical_parent = parent.canonicalize().map_err(|_| {
        Error::PackageError(format!(
            "invalid destination for {}: parent directory does not exist",
            relative
        ))
    })?;
    if !canonical_parent.starts_with(&canonical_destination) {
        return Err(Error::PackageError(format!(
            "invalid destination for {}: outside of the installation directory",
            relative
        )));
    }
    Ok(target)
}

fn create_directory(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(Error::IoError(format!(
            "could not create directory {}: {}",
            path.display(),
            e
        ))),
    }
}

fn write_file<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    target: &Path,
    executable: bool,
    digest: &mut Sha256,
    progress: &mut ProgressTracker<'_>,
) -> Result<u64> {
    let mode = if executable { 0o755 } else { 0o644 };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(target)
        .map_err(|e| Error::IoError(format!("could not create {}: {}", target.display(), e)))?;

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = match entry.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(archive_error(e)),
        };
        digest.update(&buffer[..n]);
        file.write_all(&buffer[..n]).map_err(|e| {
            Error::IoError(format!("could not write {}: {}", target.display(), e))
        })?;
        written += n as u64;
        progress.update();
    }
    Ok(written)
}
