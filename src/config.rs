//! Build spec decoding, defaulting and validation.
//!
//! Every defect is collected before returning so a user sees all of them in
//! one pass. A local `iso_url` is checked for existence here rather than at
//! download time.

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::checksum::ChecksumType;
use crate::error::{ConfigError, ConfigErrors};

pub const DEFAULT_GUEST_OS_TYPE: &str = "Other";
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "virtualbox";
pub const DEFAULT_VM_NAME: &str = "packer";
pub const DEFAULT_DISK_SIZE_MB: u32 = 40_000;

const SUPPORTED_SCHEMES: &[&str] = &["file", "http", "https"];

const KNOWN_FIELDS: &[&str] = &[
    "guest_os_type",
    "iso_url",
    "iso_checksum",
    "iso_checksum_type",
    "output_directory",
    "vm_name",
    "disk_size",
];

/// Fields as written in the spec, before defaults. A field that failed to
/// decode is `None` and has already been reported.
#[derive(Debug, Default)]
struct RawConfig {
    guest_os_type: Option<String>,
    iso_url: Option<String>,
    iso_checksum: Option<String>,
    iso_checksum_type: Option<String>,
    output_directory: Option<String>,
    vm_name: Option<String>,
    disk_size: Option<u32>,
}

impl RawConfig {
    fn decode(map: &Map<String, Value>, errs: &mut Vec<ConfigError>) -> Self {
        for key in map.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                errs.push(ConfigError::UnknownField(key.clone()));
            }
        }
        Self {
            guest_os_type: field(map, "guest_os_type", errs),
            iso_url: field(map, "iso_url", errs),
            iso_checksum: field(map, "iso_checksum", errs),
            iso_checksum_type: field(map, "iso_checksum_type", errs),
            output_directory: field(map, "output_directory", errs),
            vm_name: field(map, "vm_name", errs),
            disk_size: field(map, "disk_size", errs),
        }
    }
}

/// Decode one field; `null` counts as absent.
fn field<T: DeserializeOwned>(
    map: &Map<String, Value>,
    name: &'static str,
    errs: &mut Vec<ConfigError>,
) -> Option<T> {
    let value = map.get(name).filter(|v| !v.is_null())?;
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            errs.push(ConfigError::InvalidField {
                field: name,
                reason: err.to_string(),
            });
            None
        }
    }
}

/// Validated, normalized build configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub guest_os_type: String,
    /// Canonical URL string; local paths become `file://` URLs.
    pub iso_url: String,
    /// Lower-case hex digest.
    pub iso_checksum: String,
    pub iso_checksum_type: ChecksumType,
    pub output_directory: String,
    pub vm_name: String,
    /// Size of the primary disk in megabytes.
    pub disk_size: u32,
}

/// Where the installation medium comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoSource {
    Local(PathBuf),
    Remote(Url),
}

impl BuildConfig {
    /// Decode and validate a raw build spec.
    pub fn from_raw(raw: &Value) -> Result<Self, ConfigErrors> {
        let Some(map) = raw.as_object() else {
            return Err(ConfigErrors(vec![ConfigError::Decode(
                "build spec must be an object".to_string(),
            )]));
        };

        let mut errs = Vec::new();
        let raw = RawConfig::decode(map, &mut errs);

        let guest_os_type = or_default(raw.guest_os_type, DEFAULT_GUEST_OS_TYPE);
        let output_directory = or_default(raw.output_directory, DEFAULT_OUTPUT_DIRECTORY);
        let vm_name = or_default(raw.vm_name, DEFAULT_VM_NAME);

        let disk_size = raw.disk_size.unwrap_or(DEFAULT_DISK_SIZE_MB);
        if disk_size == 0 {
            errs.push(ConfigError::InvalidDiskSize);
        }

        let iso_checksum_type = match non_empty(raw.iso_checksum_type) {
            None => Some(ChecksumType::default()),
            Some(value) => match value.parse::<ChecksumType>() {
                Ok(kind) => Some(kind),
                Err(name) => {
                    errs.push(ConfigError::UnknownChecksumType(name));
                    None
                }
            },
        };

        let iso_checksum = match non_empty(raw.iso_checksum) {
            None => {
                errs.push(ConfigError::MissingChecksum);
                String::new()
            }
            Some(value) => {
                let value = value.trim().to_ascii_lowercase();
                if let Some(kind) = iso_checksum_type {
                    if !kind.accepts(&value) {
                        errs.push(ConfigError::InvalidChecksum {
                            kind: kind.to_string(),
                            value: value.clone(),
                        });
                    }
                }
                value
            }
        };

        let iso_url = match non_empty(raw.iso_url) {
            None => {
                errs.push(ConfigError::MissingIsoUrl);
                String::new()
            }
            Some(value) => match normalize_iso_url(&value) {
                Ok(url) => url.to_string(),
                Err(err) => {
                    errs.push(err);
                    value
                }
            },
        };

        if !errs.is_empty() {
            return Err(ConfigErrors(errs));
        }

        Ok(Self {
            guest_os_type,
            iso_url,
            iso_checksum,
            iso_checksum_type: iso_checksum_type.unwrap_or_default(),
            output_directory,
            vm_name,
            disk_size,
        })
    }

    pub fn output_dir(&self) -> &Path {
        Path::new(&self.output_directory)
    }

    /// Path of the primary disk image inside the output directory.
    pub fn disk_path(&self) -> PathBuf {
        self.output_dir().join(format!("{}.vdi", self.vm_name))
    }

    /// Resolve the canonical `iso_url` into a local path or a remote URL.
    pub fn iso_source(&self) -> anyhow::Result<IsoSource> {
        let url = Url::parse(&self.iso_url)
            .map_err(|e| anyhow::anyhow!("iso_url '{}' is not a valid URL: {}", self.iso_url, e))?;
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("iso_url '{}' is not a local path", self.iso_url))?;
            return Ok(IsoSource::Local(path));
        }
        Ok(IsoSource::Remote(url))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn or_default(value: Option<String>, default: &str) -> String {
    non_empty(value)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Parse `raw` into a canonical URL.
///
/// Values without a scheme are local paths and become absolute `file://`
/// URLs. Single-letter schemes are Windows drive letters, not schemes.
pub fn normalize_iso_url(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    let url = match scheme_of(raw) {
        Some(scheme) if scheme.len() > 1 => {
            Url::parse(raw).map_err(|e| ConfigError::InvalidIsoUrl(e.to_string()))?
        }
        _ => file_url(Path::new(raw))?,
    };

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| ConfigError::InvalidIsoUrl(format!("'{raw}' is not a local path")))?;
            check_local_file(&path)?;
        }
        scheme if SUPPORTED_SCHEMES.contains(&scheme) => {}
        scheme => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
    }

    Ok(url)
}

fn scheme_of(raw: &str) -> Option<&str> {
    let (scheme, _) = raw.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        Some(scheme)
    } else {
        None
    }
}

fn file_url(path: &Path) -> Result<Url, ConfigError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ConfigError::InvalidIsoUrl(format!("resolving current directory: {e}")))?
            .join(path)
    };
    Url::from_file_path(&absolute).map_err(|_| {
        ConfigError::InvalidIsoUrl(format!("'{}' is not a valid path", absolute.display()))
    })
}

fn check_local_file(path: &Path) -> Result<(), ConfigError> {
    let bad = |reason: String| ConfigError::BadIsoFile {
        path: path.display().to_string(),
        reason,
    };
    let meta = fs::metadata(path).map_err(|e| bad(e.to_string()))?;
    if !meta.is_file() {
        return Err(bad("not a regular file".to_string()));
    }
    Ok(())
}
