//! Extension manifests.
//!
//! Each installed extension ships `manifest.json` under
//! `<extensions_dir>/<id>/`. The manifest names the extension and lists the
//! permissions it asks for; handlers consult it before acting.

use encore_rpc::codec;
use encore_rpc::{Blob, CodecError, ContextKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest schema revision. Closed: a revision this build does not know is
/// rejected rather than guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ManifestVersion {
    V1,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported manifest version {0}")]
pub struct UnsupportedManifestVersion(pub u32);

impl TryFrom<u32> for ManifestVersion {
    type Error = UnsupportedManifestVersion;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ManifestVersion::V1),
            other => Err(UnsupportedManifestVersion(other)),
        }
    }
}

impl From<ManifestVersion> for u32 {
    fn from(value: ManifestVersion) -> Self {
        match value {
            ManifestVersion::V1 => 1,
        }
    }
}

encore_rpc::open_enum! {
    /// A capability an extension asks the host for.
    pub enum Permission {
        Library = "library",
        Playback = "playback",
        Notifications = "notifications",
        Network = "network",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub manifest_version: ManifestVersion,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub icon: Option<Blob>,
    #[serde(default)]
    pub published_at: Option<Timestamp>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    Invalid { path: PathBuf, source: CodecError },
    #[error("manifest {path} declares id '{found}', expected '{expected}'")]
    IdMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

impl ExtensionManifest {
    /// Manifest for an extension bundled with the host, granted every known
    /// permission.
    pub fn builtin(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            manifest_version: ManifestVersion::V1,
            permissions: vec![
                Permission::Library,
                Permission::Playback,
                Permission::Notifications,
                Permission::Network,
            ],
            icon: None,
            published_at: None,
        }
    }

    pub fn grants(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn path_in(extensions_dir: &Path, id: &str) -> PathBuf {
        extensions_dir.join(id).join(MANIFEST_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = fs::read(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        codec::decode(&bytes).map_err(|source| ManifestError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `<extensions_dir>/<id>/manifest.json`, falling back to
    /// [`builtin`](Self::builtin) when the extension has no manifest on disk.
    pub fn load_or_builtin(extensions_dir: &Path, id: &str) -> Result<Self, ManifestError> {
        let path = Self::path_in(extensions_dir, id);
        if !path.exists() {
            tracing::debug!(extension = id, path = %path.display(), "no manifest on disk; using builtin");
            return Ok(Self::builtin(id));
        }
        let manifest = Self::load(&path)?;
        if manifest.id != id {
            return Err(ManifestError::IdMismatch {
                path,
                expected: id.to_string(),
                found: manifest.id,
            });
        }
        Ok(manifest)
    }
}

/// Context slot carrying the calling extension's manifest into handlers.
pub struct ManifestKey;

impl ContextKey for ManifestKey {
    type Value = Option<Arc<ExtensionManifest>>;

    fn default_value() -> Self::Value {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "id": "lyrics",
        "name": "Lyrics",
        "version": "2.1.0",
        "manifest_version": 1,
        "permissions": ["playback", "telepathy"],
        "icon": "iVBORw0=",
        "published_at": "2024-05-01T12:00:00Z"
    }"#;

    #[test]
    fn unknown_permissions_are_kept_verbatim() {
        let manifest: ExtensionManifest = codec::decode(MANIFEST.as_bytes()).unwrap();

        assert_eq!(
            manifest.permissions,
            vec![Permission::Playback, Permission::Unknown("telepathy".into())]
        );
        assert!(manifest.grants(&Permission::Playback));
        assert!(!manifest.grants(&Permission::Notifications));
        assert_eq!(manifest.icon.as_ref().map(Blob::len), Some(5));
    }

    #[test]
    fn unknown_manifest_version_is_rejected() {
        let newer = MANIFEST.replace("\"manifest_version\": 1", "\"manifest_version\": 7");
        let err = codec::decode::<ExtensionManifest>(newer.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unsupported manifest version 7"));
    }

    #[test]
    fn manifest_version_encodes_as_an_integer() {
        let json = serde_json::to_value(ExtensionManifest::builtin("demo")).unwrap();
        assert_eq!(json["manifest_version"], 1);
        assert_eq!(json["permissions"][2], "notifications");
    }

    #[test]
    fn load_or_builtin_prefers_the_file_on_disk() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lyrics");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), MANIFEST).unwrap();

        let loaded = ExtensionManifest::load_or_builtin(temp.path(), "lyrics").unwrap();
        assert_eq!(loaded.version, "2.1.0");

        let fallback = ExtensionManifest::load_or_builtin(temp.path(), "radio").unwrap();
        assert_eq!(fallback, ExtensionManifest::builtin("radio"));
    }

    #[test]
    fn manifest_id_must_match_its_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("other");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), MANIFEST).unwrap();

        let err = ExtensionManifest::load_or_builtin(temp.path(), "other").unwrap_err();
        assert!(matches!(err, ManifestError::IdMismatch { found, .. } if found == "lyrics"));
    }
}
