//! Content packages (game systems, modules) installed into one instance

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::archive::{self, ArchiveError};
use super::instance::validate_name;
use super::layout::{list_subdirs, InstanceLocator};
use super::lock::ScopedLock;
use super::settings::Settings;
use crate::error::{IoContext, ManagerError, Result};
use crate::fetch::{url_file_stem, Fetcher};

/// Written next to the unpacked files to remember where they came from
const SOURCE_FILE: &str = ".fim-package.json";

/// Manifests a package archive may carry at its root
const PACKAGE_MANIFESTS: [&str; 2] = ["system.json", "module.json"];

/// Subset of a package manifest we care about
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PackageManifest {
    id: Option<String>,
    /// Older manifests use `name` as the id
    name: Option<String>,
    title: Option<String>,
    version: Option<String>,
    download: Option<String>,
}

impl PackageManifest {
    fn id(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceRecord {
    source_url: String,
    installed_at: DateTime<Utc>,
}

/// An installed package as found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentPackage {
    pub id: String,
    pub title: Option<String>,
    pub version: Option<String>,
    pub source_url: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

/// Installs, lists and removes packages under an instance's content directory
pub struct ContentManager {
    locator: Arc<dyn InstanceLocator>,
    fetcher: Arc<dyn Fetcher>,
    settings: Settings,
}

impl ContentManager {
    pub fn new(
        locator: Arc<dyn InstanceLocator>,
        fetcher: Arc<dyn Fetcher>,
        settings: Settings,
    ) -> Self {
        Self {
            locator,
            fetcher,
            settings,
        }
    }

    /// Fetch and unpack a package from an archive or manifest URL.
    ///
    /// The download runs before the instance lock is taken; only the unpack
    /// into the instance tree holds it.
    pub fn install(&self, instance: &str, url: &str) -> Result<ContentPackage> {
        self.locator.locate(instance)?;
        let deadline = self.settings.fetch_deadline();

        let fetched = self.fetch(url, deadline)?;
        let (remote_manifest, archive_url, bytes) = if is_manifest(url, &fetched) {
            let manifest: PackageManifest = serde_json::from_slice(&fetched)
                .map_err(|e| ManagerError::unpack(url, format!("invalid manifest: {}", e)))?;
            let download = manifest
                .download
                .clone()
                .ok_or_else(|| ManagerError::unpack(url, "manifest has no download URL"))?;
            debug!("Manifest {} points at {}", url, download);
            let bytes = self.fetch(&download, deadline)?;
            (Some(manifest), download, bytes)
        } else {
            (None, url.to_string(), fetched)
        };

        let mut zip =
            archive::open(Cursor::new(bytes)).map_err(|e| ManagerError::unpack(&archive_url, e))?;
        let root = archive::common_root(&zip);
        let embedded = read_embedded_manifest(&mut zip, root.as_deref())
            .map_err(|e| ManagerError::unpack(&archive_url, e))?;

        let id = remote_manifest
            .as_ref()
            .and_then(|m| m.id().map(str::to_string))
            .or_else(|| embedded.as_ref().and_then(|m| m.id().map(str::to_string)))
            .or_else(|| url_file_stem(url))
            .ok_or_else(|| ManagerError::unpack(url, "cannot determine a package id"))?;
        validate_name("package id", &id)?;

        let _lock = self.lock(instance)?;
        let paths = self.locator.locate(instance)?;
        let target = paths.package_dir(&id);
        if target.exists() {
            return Err(ManagerError::PackageAlreadyInstalled {
                instance: instance.to_string(),
                package: id,
            });
        }

        let staging = paths
            .content
            .join(format!(".{}.partial-{}", id, Uuid::new_v4().simple()));

        let installed_at = Utc::now();
        let unpacked = archive::extract(&mut zip, &staging, root.as_deref(), &[])
            .map_err(|e| archive_failure(&archive_url, e))
            .and_then(|count| {
                let record = SourceRecord {
                    source_url: url.to_string(),
                    installed_at,
                };
                let source_file = staging.join(SOURCE_FILE);
                std::fs::write(&source_file, serde_json::to_vec_pretty(&record)?)
                    .at(&source_file)?;
                Ok(count)
            })
            .and_then(|count| {
                std::fs::rename(&staging, &target).at(&target)?;
                Ok(count)
            });

        let count = match unpacked {
            Ok(count) => count,
            Err(e) => {
                discard_staging(&staging);
                return Err(e);
            }
        };

        info!(
            "Installed package '{}' into instance '{}' ({} entries)",
            id, instance, count
        );
        let manifest = embedded.or(remote_manifest).unwrap_or_default();
        Ok(ContentPackage {
            title: manifest.title,
            version: manifest.version,
            source_url: Some(url.to_string()),
            installed_at: Some(installed_at),
            path: target,
            id,
        })
    }

    /// Installed packages ordered by id
    pub fn list(&self, instance: &str) -> Result<Vec<ContentPackage>> {
        let paths = self.locator.locate(instance)?;
        list_subdirs(&paths.content)?
            .into_iter()
            .map(|(id, path)| Ok(describe_package(id, path)))
            .collect()
    }

    pub fn info(&self, instance: &str, package: &str) -> Result<ContentPackage> {
        let paths = self.locator.locate(instance)?;
        let dir = self.existing_package(instance, &paths.package_dir(package), package)?;
        Ok(describe_package(package.to_string(), dir))
    }

    /// Delete an installed package; a second call reports `PackageNotFound`
    pub fn remove(&self, instance: &str, package: &str) -> Result<()> {
        let _lock = self.lock(instance)?;
        let paths = self.locator.locate(instance)?;
        let dir = self.existing_package(instance, &paths.package_dir(package), package)?;
        std::fs::remove_dir_all(&dir).at(&dir)?;
        info!("Removed package '{}' from instance '{}'", package, instance);
        Ok(())
    }

    fn existing_package(&self, instance: &str, dir: &Path, package: &str) -> Result<PathBuf> {
        let not_found = || ManagerError::PackageNotFound {
            instance: instance.to_string(),
            package: package.to_string(),
        };
        validate_name("package id", package).map_err(|_| not_found())?;
        if dir.is_dir() {
            Ok(dir.to_path_buf())
        } else {
            Err(not_found())
        }
    }

    fn lock(&self, instance: &str) -> Result<ScopedLock> {
        ScopedLock::instance(self.locator.scope(), instance, self.settings.lock_timeout())
    }

    fn fetch(&self, url: &str, deadline: std::time::Instant) -> Result<Vec<u8>> {
        debug!("Fetching {}", url);
        self.fetcher
            .fetch(url, deadline)
            .map_err(|source| ManagerError::Fetch {
                url: url.to_string(),
                source,
            })
    }
}

/// A manifest URL ends in `.json` or its body parses as a JSON object
fn is_manifest(url: &str, body: &[u8]) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.to_ascii_lowercase().ends_with(".json") {
        return true;
    }
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

fn read_embedded_manifest<R: std::io::Read + std::io::Seek>(
    zip: &mut zip::ZipArchive<R>,
    root: Option<&str>,
) -> std::result::Result<Option<PackageManifest>, ArchiveError> {
    for file in PACKAGE_MANIFESTS {
        let name = match root {
            Some(root) => format!("{}/{}", root, file),
            None => file.to_string(),
        };
        if let Some(bytes) = archive::read_entry(zip, &name)? {
            match serde_json::from_slice(&bytes) {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(e) => warn!("Ignoring unreadable {}: {}", name, e),
            }
        }
    }
    Ok(None)
}

fn describe_package(id: String, path: PathBuf) -> ContentPackage {
    let manifest = PACKAGE_MANIFESTS
        .iter()
        .map(|f| path.join(f))
        .find(|p| p.is_file())
        .and_then(|p| std::fs::read(&p).ok())
        .and_then(|bytes| serde_json::from_slice::<PackageManifest>(&bytes).ok())
        .unwrap_or_default();
    let source = std::fs::read(path.join(SOURCE_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<SourceRecord>(&bytes).ok());

    ContentPackage {
        id,
        title: manifest.title,
        version: manifest.version,
        source_url: source.as_ref().map(|s| s.source_url.clone()),
        installed_at: source.map(|s| s.installed_at),
        path,
    }
}

fn archive_failure(source_name: &str, e: ArchiveError) -> ManagerError {
    match e {
        ArchiveError::Io { path, source } => ManagerError::Io { path, source },
        other => ManagerError::unpack(source_name, other),
    }
}

fn discard_staging(staging: &Path) {
    if let Err(e) = std::fs::remove_dir_all(staging) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to clean up staging directory {:?}: {}", staging, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_detection() {
        assert!(is_manifest("https://x.test/system.json", b"garbage"));
        assert!(is_manifest("https://x.test/latest?v=2", b"  {\"id\":\"a\"}"));
        assert!(!is_manifest("https://x.test/dnd5e.zip", b"PK\x03\x04"));
    }

    #[test]
    fn legacy_name_field_is_an_id() {
        let m: PackageManifest = serde_json::from_str(r#"{"name":"pf2e"}"#).unwrap();
        assert_eq!(m.id(), Some("pf2e"));
        let m: PackageManifest = serde_json::from_str(r#"{"id":"a","name":"b"}"#).unwrap();
        assert_eq!(m.id(), Some("a"));
    }
}
