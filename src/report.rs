// src/report.rs

//! Installation reports
//!
//! Every installed application has an `installation-report.yaml` in its
//! manifest directory. It records where the package came from (digest and
//! signatures), which files it installed and where. The report is protected
//! by an HMAC so that tampering with it on disk is detected.
//!
//! The file is a stream of three YAML documents:
//!
//! ```yaml
//! formatType: am-installation-report
//! formatVersion: 1
//! ---
//! packageId: com.example.app
//! installationLocationId: internal-0
//! diskSpaceUsed: 123456
//! digest: 4d5e...
//! files: [info.yaml, icon.png, main.qml]
//! ---
//! hmac: 9a0b...
//! ```

use crate::error::{Error, Result};
use crate::manifest::is_valid_dns_name;
use crate::yaml;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use serde_yaml::{Mapping, Value};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// File name of the report inside a manifest directory
pub const REPORT_FILE_NAME: &str = "installation-report.yaml";

/// Reports larger than this are rejected unread
pub const MAX_REPORT_SIZE: usize = 2 * 1024 * 1024;

const REPORT_FORMAT: &str = "am-installation-report";
const REPORT_FORMAT_VERSION: u64 = 1;

/// Key of the report HMAC. Reports are only protected against accidental or
/// casual modification, not against someone able to read this binary.
const REPORT_HMAC_KEY: [u8; 64] = [
    0xd8, 0xde, 0x41, 0x25, 0xee, 0x24, 0xd0, 0x19, 0xa2, 0x43, 0x06, 0x22, 0x30, 0xa4, 0x87, 0xf0,
    0x12, 0x07, 0xe9, 0xd3, 0x1c, 0xd4, 0x6f, 0xd6, 0x1c, 0xc5, 0x38, 0x22, 0x2d, 0x7a, 0xe9, 0x90,
    0x1e, 0xdf, 0xc8, 0x85, 0x86, 0x96, 0xc4, 0x64, 0xc5, 0x59, 0xee, 0xc4, 0x69, 0xb6, 0x0f, 0x94,
    0x5c, 0xb0, 0x2a, 0xf0, 0xf1, 0xc0, 0x8a, 0x7a, 0xf0, 0xf6, 0x3f, 0x17, 0xe6, 0xab, 0x2e, 0xc7,
];

/// Record of one installed package
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallationReport {
    package_id: String,
    installation_location_id: String,
    digest: Vec<u8>,
    developer_signature: Vec<u8>,
    store_signature: Vec<u8>,
    disk_space_used: u64,
    files: Vec<String>,
    extra_meta_data: Mapping,
    extra_signed_meta_data: Mapping,
}

impl InstallationReport {
    /// Create an empty report for `package_id`
    pub fn new(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            ..Default::default()
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn set_package_id(&mut self, id: &str) {
        self.package_id = id.to_string();
    }

    pub fn installation_location_id(&self) -> &str {
        &self.installation_location_id
    }

    pub fn set_installation_location_id(&mut self, id: &str) {
        self.installation_location_id = id.to_string();
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn set_digest(&mut self, digest: Vec<u8>) {
        self.digest = digest;
    }

    pub fn developer_signature(&self) -> &[u8] {
        &self.developer_signature
    }

    pub fn set_developer_signature(&mut self, signature: Vec<u8>) {
        self.developer_signature = signature;
    }

    pub fn store_signature(&self) -> &[u8] {
        &self.store_signature
    }

    pub fn set_store_signature(&mut self, signature: Vec<u8>) {
        self.store_signature = signature;
    }

    pub fn disk_space_used(&self) -> u64 {
        self.disk_space_used
    }

    pub fn set_disk_space_used(&mut self, bytes: u64) {
        self.disk_space_used = bytes;
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn add_file(&mut self, file: &str) {
        self.files.push(file.to_string());
    }

    pub fn add_files<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.files.extend(files.into_iter().map(|f| f.as_ref().to_string()));
    }

    /// Metadata not covered by the package digest
    pub fn extra_meta_data(&self) -> &Mapping {
        &self.extra_meta_data
    }

    pub fn set_extra_meta_data(&mut self, extra: Mapping) {
        self.extra_meta_data = extra;
    }

    /// Metadata covered by the package digest
    pub fn extra_signed_meta_data(&self) -> &Mapping {
        &self.extra_signed_meta_data
    }

    pub fn set_extra_signed_meta_data(&mut self, extra: Mapping) {
        self.extra_signed_meta_data = extra;
    }

    /// Whether the report describes a usable installation
    pub fn is_valid(&self) -> bool {
        is_valid_dns_name(&self.package_id) && !self.digest.is_empty() && !self.files.is_empty()
    }

    fn body(&self) -> Value {
        let mut body = Mapping::new();
        body.insert("packageId".into(), self.package_id.clone().into());
        body.insert(
            "installationLocationId".into(),
            self.installation_location_id.clone().into(),
        );
        body.insert("diskSpaceUsed".into(), self.disk_space_used.into());
        body.insert("digest".into(), hex::encode(&self.digest).into());
        if !self.developer_signature.is_empty() {
            body.insert(
                "developerSignature".into(),
                BASE64.encode(&self.developer_signature).into(),
            );
        }
        if !self.store_signature.is_empty() {
            body.insert(
                "storeSignature".into(),
                BASE64.encode(&self.store_signature).into(),
            );
        }
        if !self.extra_meta_data.is_empty() {
            body.insert("extra".into(), Value::Mapping(self.extra_meta_data.clone()));
        }
        if !self.extra_signed_meta_data.is_empty() {
            body.insert(
                "extraSigned".into(),
                Value::Mapping(self.extra_signed_meta_data.clone()),
            );
        }
        body.insert(
            "files".into(),
            Value::Sequence(self.files.iter().cloned().map(Value::from).collect()),
        );
        Value::Mapping(body)
    }

    /// Serialize the report, including its HMAC
    pub fn serialize(&self) -> Result<String> {
        let header = yaml::format_header(REPORT_FORMAT, REPORT_FORMAT_VERSION);
        let body = self.body();
        let protected = yaml::to_documents(&[header.clone(), body.clone()])?;

        let mut footer = Mapping::new();
        footer.insert("hmac".into(), hex::encode(report_hmac(protected.as_bytes())?).into());

        yaml::to_documents(&[header, body, Value::Mapping(footer)])
    }

    /// Load a serialized report into this one
    ///
    /// If a package id is already set, the report must be for that package.
    /// On any error the digest, the file list and the disk usage are cleared,
    /// so a half-read report never looks valid.
    pub fn deserialize(&mut self, content: &[u8]) -> Result<()> {
        let result = self.deserialize_inner(content);
        if let Err(e) = &result {
            debug!("Rejecting installation report: {}", e);
            self.digest.clear();
            self.files.clear();
            self.disk_space_used = 0;
        }
        result
    }

    /// Parse a serialized report
    pub fn from_yaml(content: &[u8]) -> Result<Self> {
        let mut report = Self::default();
        report.deserialize(content)?;
        Ok(report)
    }

    fn deserialize_inner(&mut self, content: &[u8]) -> Result<()> {
        if content.len() > MAX_REPORT_SIZE {
            return Err(Error::ParseError(format!(
                "installation report is larger than {} bytes",
                MAX_REPORT_SIZE
            )));
        }
        let text = std::str::from_utf8(content)
            .map_err(|e| Error::ParseError(format!("installation report is not UTF-8: {}", e)))?;

        let documents = yaml::parse_documents(text)?;
        if documents.len() != 3 {
            return Err(Error::ParseError(format!(
                "installation report must consist of 3 YAML documents, got {}",
                documents.len()
            )));
        }
        yaml::check_format_header(&documents[0], REPORT_FORMAT, REPORT_FORMAT_VERSION)?;

        let body = &documents[1];
        let package_id = yaml::string_field(body, "packageId").unwrap_or_default();
        if !self.package_id.is_empty() && package_id != self.package_id {
            return Err(Error::ParseError(format!(
                "installation report is for '{}', expected '{}'",
                package_id, self.package_id
            )));
        }

        let installation_location_id =
            yaml::string_field(body, "installationLocationId").unwrap_or_default();
        let disk_space_used = body
            .get("diskSpaceUsed")
            .and_then(Value::as_u64)
            .unwrap_or_default();

        let digest = yaml::string_field(body, "digest")
            .map(hex::decode)
            .transpose()
            .map_err(|e| Error::ParseError(format!("invalid digest in installation report: {}", e)))?
            .unwrap_or_default();
        if digest.is_empty() {
            return Err(Error::ParseError(
                "installation report has no digest".to_string(),
            ));
        }

        let developer_signature = signature_field(body, "developerSignature")?;
        let store_signature = signature_field(body, "storeSignature")?;
        let extra_meta_data = yaml::mapping_field(body, "extra")?;
        let extra_signed_meta_data = yaml::mapping_field(body, "extraSigned")?;

        let files: Vec<String> = match body.get("files") {
            Some(Value::Sequence(files)) => files
                .iter()
                .map(|f| {
                    f.as_str().map(str::to_string).ok_or_else(|| {
                        Error::ParseError("installation report file names must be strings".to_string())
                    })
                })
                .collect::<Result<_>>()?,
            _ => Vec::new(),
        };
        if files.is_empty() {
            return Err(Error::ParseError(
                "installation report has no files".to_string(),
            ));
        }

        let expected = yaml::string_field(&documents[2], "hmac")
            .map(hex::decode)
            .transpose()
            .map_err(|e| Error::ParseError(format!("invalid hmac in installation report: {}", e)))?
            .unwrap_or_default();
        let protected = yaml::to_documents(&documents[..2])?;
        if !verify_report_hmac(protected.as_bytes(), &expected)? {
            return Err(Error::ParseError(
                "installation report hmac does not match".to_string(),
            ));
        }

        self.package_id = package_id;
        self.installation_location_id = installation_location_id;
        self.disk_space_used = disk_space_used;
        self.digest = digest;
        self.developer_signature = developer_signature;
        self.store_signature = store_signature;
        self.extra_meta_data = extra_meta_data;
        self.extra_signed_meta_data = extra_signed_meta_data;
        self.files = files;
        Ok(())
    }
}

/// A present signature key must hold a non-empty base64 value
fn signature_field(body: &Value, key: &str) -> Result<Vec<u8>> {
    match body.get(key) {
        None => Ok(Vec::new()),
        Some(value) => {
            let encoded = value.as_str().unwrap_or_default();
            let decoded = BASE64.decode(encoded).map_err(|e| {
                Error::ParseError(format!("invalid {} in installation report: {}", key, e))
            })?;
            if decoded.is_empty() {
                return Err(Error::ParseError(format!(
                    "installation report has an empty {}",
                    key
                )));
            }
            Ok(decoded)
        }
    }
}

fn new_mac() -> Result<HmacSha256> {
    HmacSha256::new_from_slice(&REPORT_HMAC_KEY)
        .map_err(|e| Error::SystemError(format!("invalid report hmac key: {}", e)))
}

fn report_hmac(data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = new_mac()?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_report_hmac(data: &[u8], expected: &[u8]) -> Result<bool> {
    let mut mac = new_mac()?;
    mac.update(data);
    Ok(mac.verify_slice(expected).is_ok())
}
