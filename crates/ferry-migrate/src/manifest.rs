//! Per-unit manifest format
//!
//! The manifest is the enumeration snapshot of a unit: every object's
//! relative path, size, modification time and content hash. It is stored
//! as the first entry of the unit's archive and uploaded next to the archive
//! parts, where its presence marks a complete remote copy.

use crate::store::{ObjectEntry, Unit};
use chrono::{DateTime, Utc};
use ferry_core::types::CompressionFormat;
use ferry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Version of the manifest format
pub const MANIFEST_VERSION: &str = "1.0.0";

/// Name of the manifest inside the archive and in the remote unit folder
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Enumeration snapshot and archive description of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitManifest {
    /// Manifest format version
    pub version: String,

    /// What created this manifest (e.g., "ferry v0.1.0")
    pub created_by: String,

    /// Unit metadata as listed at enumeration time
    pub unit: Unit,

    /// When the object listing was taken
    pub enumerated_at: DateTime<Utc>,

    /// Every object of the unit, directory markers excluded
    pub objects: Vec<ManifestObject>,

    /// Sealed archive, absent until the archive stage finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveInfo>,
}

/// One object in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestObject {
    /// Path relative to the unit root
    pub path: String,

    /// Size in bytes
    pub size: u64,

    /// Last modification time reported by the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,

    /// Hex SHA-256 of the downloaded content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Description of a sealed archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Container and compression format
    pub format: CompressionFormat,

    /// Parts in sequence order
    pub parts: Vec<ArchivePart>,

    /// Length of the concatenated part stream
    pub total_bytes: u64,

    /// Hex SHA-256 of the concatenated part stream
    pub sha256: String,
}

/// One physical slice of a unit's archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePart {
    /// 1-based position in the stream
    pub sequence: u32,

    /// File name, e.g. `archive.tar.gz.001`
    pub name: String,

    /// Size in bytes
    pub size: u64,

    /// Hex SHA-256 of this part
    pub sha256: String,

    /// Unit the part belongs to
    pub unit_id: String,
}

impl UnitManifest {
    /// Build a manifest from an enumeration snapshot
    pub fn new(unit: &Unit, objects: &[ObjectEntry]) -> Self {
        let objects = objects
            .iter()
            .filter(|o| !o.is_directory_marker())
            .map(|o| ManifestObject {
                path: o.path.clone(),
                size: o.size,
                last_modified: o.last_modified,
                sha256: None,
            })
            .collect();

        Self {
            version: MANIFEST_VERSION.to_string(),
            created_by: format!("ferry v{}", env!("CARGO_PKG_VERSION")),
            unit: unit.clone(),
            enumerated_at: Utc::now(),
            objects,
            archive: None,
        }
    }

    /// Look up an object by relative path
    pub fn object(&self, path: &str) -> Option<&ManifestObject> {
        self.objects.iter().find(|o| o.path == path)
    }

    /// Sum of object sizes
    pub fn total_object_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.size).sum()
    }

    /// Serialize as pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::data_integrity(
                format!("manifest of {}", manifest.unit.id),
                format!("unsupported manifest version {}", manifest.version),
            ));
        }
        Ok(manifest)
    }

    /// Write to a file
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?).map_err(Error::from_write)
    }

    /// Read from a file
    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }
}
