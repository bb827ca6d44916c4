// src/yaml.rs

//! Multi-document YAML helpers
//!
//! Every metadata file of the installer is a YAML stream whose first document
//! is a format header (`formatType` and `formatVersion`).

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

/// Split a YAML stream into its documents
pub fn parse_documents(content: &str) -> Result<Vec<Value>> {
    serde_yaml::Deserializer::from_str(content)
        .map(|document| Value::deserialize(document).map_err(Error::from))
        .collect()
}

/// Serialize documents into a YAML stream
pub fn to_documents(documents: &[Value]) -> Result<String> {
    let mut out = String::new();
    for document in documents {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(document)?);
    }
    Ok(out)
}

/// Build a format header document
pub fn format_header(format_type: &str, format_version: u64) -> Value {
    let mut header = Mapping::new();
    header.insert("formatType".into(), format_type.into());
    header.insert("formatVersion".into(), format_version.into());
    Value::Mapping(header)
}

/// Check that `document` is the expected format header
pub fn check_format_header(document: &Value, format_type: &str, format_version: u64) -> Result<()> {
    let actual_type = document.get("formatType").and_then(Value::as_str);
    let actual_version = document.get("formatVersion").and_then(Value::as_u64);

    if actual_type != Some(format_type) || actual_version != Some(format_version) {
        return Err(Error::ParseError(format!(
            "metadata has an invalid format header: expected {} version {}, got {} version {}",
            format_type,
            format_version,
            actual_type.unwrap_or("<none>"),
            actual_version.map(|v| v.to_string()).unwrap_or_else(|| "<none>".to_string())
        )));
    }
    Ok(())
}

/// Read a string field of a mapping document
pub fn string_field(document: &Value, key: &str) -> Option<String> {
    document.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Read a mapping field, treating a missing key as empty
pub fn mapping_field(document: &Value, key: &str) -> Result<Mapping> {
    match document.get(key) {
        None | Some(Value::Null) => Ok(Mapping::new()),
        Some(Value::Mapping(map)) => Ok(map.clone()),
        Some(_) => Err(Error::ParseError(format!("'{}' must be a map", key))),
    }
}
